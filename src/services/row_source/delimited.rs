//! Delimited text reader (CSV, semicolon-separated, TSV)

use std::path::Path;

use crate::error::SourceError;
use super::{check_readable, classify_io_error, Table};

const UTF8_BOM: char = '\u{feff}';

/// Read the whole file: first record is the header row.
///
/// Records may be shorter or longer than the header; fully blank records are
/// dropped so trailing empty lines do not count as data rows.
pub(super) fn read_table(path: &Path, delimiter: u8) -> Result<Table, SourceError> {
    check_readable(path)?;

    let unreadable = |reason: String| SourceError::Unreadable {
        location: path.display().to_string(),
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| match e.kind() {
            csv::ErrorKind::Io(io) => classify_io_error(path, io),
            _ => unreadable(e.to_string()),
        })?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| unreadable(e.to_string()))?
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let h = if i == 0 { h.trim_start_matches(UTF8_BOM) } else { h };
            h.trim().to_string()
        })
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(unreadable("missing header row".to_string()));
    }

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| unreadable(format!("record {}: {}", idx + 1, e)))?;
        if record.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        rows.push(record.iter().map(str::to_string).collect());
    }

    Ok(Table::new(headers, rows))
}
