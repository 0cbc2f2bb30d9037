//! Spreadsheet reader (xlsx, xls, xlsb, ods) backed by calamine

use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Duration, NaiveDate, NaiveTime};

use crate::error::SourceError;
use super::{check_readable, Table};

/// Read `sheet` (or the first sheet): first non-empty row is the header row
pub(super) fn read_table(path: &Path, sheet: Option<&str>) -> Result<Table, SourceError> {
    check_readable(path)?;

    let location = path.display().to_string();
    let unreadable = |reason: String| SourceError::Unreadable {
        location: location.clone(),
        reason,
    };

    let mut workbook =
        open_workbook_auto(path).map_err(|e| unreadable(format!("cannot open workbook: {}", e)))?;

    let sheet_name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| unreadable("workbook contains no sheets".to_string()))?,
    };

    if !workbook.sheet_names().iter().any(|n| n == &sheet_name) {
        return Err(SourceError::NotFound {
            location: format!("{}#{}", location, sheet_name),
        });
    }

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| unreadable(format!("cannot read sheet '{}': {}", sheet_name, e)))?;

    let mut rows = range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect::<Vec<_>>())
        .filter(|cells| cells.iter().any(|c| !c.trim().is_empty()));

    let headers: Vec<String> = match rows.next() {
        Some(cells) => cells.into_iter().map(|h| h.trim().to_string()).collect(),
        None => return Err(unreadable(format!("sheet '{}' is empty", sheet_name))),
    };

    Ok(Table::new(headers, rows.collect()))
}

/// Render a cell the way a user sees it: integers without decimals, booleans
/// as TRUE/FALSE, dates as ISO text
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                format!("{}", n)
            }
        }
        Data::Int(n) => n.to_string(),
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::DateTime(dt) => excel_serial_to_string(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#{:?}", e),
    }
}

/// Excel 1900 date system: serial 1 is 1900-01-01, with the phantom
/// 1900-02-29 folded in by counting from 1899-12-30
fn excel_serial_to_string(serial: f64) -> String {
    let Some(epoch) = NaiveDate::from_ymd_opt(1899, 12, 30) else {
        return serial.to_string();
    };
    let days = serial.trunc() as i64;
    let seconds = ((serial.fract()) * 86_400.0).round() as i64;
    let Some(date) = epoch.checked_add_signed(Duration::days(days)) else {
        return serial.to_string();
    };
    if seconds == 0 {
        date.to_string()
    } else {
        (date.and_time(NaiveTime::MIN) + Duration::seconds(seconds))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}
