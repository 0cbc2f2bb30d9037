//! Row source abstraction
//!
//! A row source serves random windows of a finite tabular dataset. It must
//! return the same `total_rows` and the same row at a given index on every
//! fetch within a run; the orchestrator probes the size with a 1-row fetch
//! and then plans disjoint windows on that assumption.
//!
//! - `FileRowSource` reads delimited text (`csv`) or spreadsheets (`calamine`)
//! - `InMemoryRowSource` serves a fixed table (tests, previews)

mod delimited;
mod spreadsheet;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::SourceError;
use crate::types::RowWindow;

/// Spreadsheet file extensions handled by `calamine`
const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xls", "xlsb", "ods"];

/// Where the rows of a run come from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceDescriptor {
    Delimited { path: PathBuf, delimiter: u8 },
    Spreadsheet { path: PathBuf, sheet: Option<String> },
    Memory { name: String },
}

impl SourceDescriptor {
    /// Pick the adapter from the file extension
    pub fn from_path(path: impl Into<PathBuf>, sheet: Option<String>, delimiter: u8) -> Self {
        let path = path.into();
        let is_spreadsheet = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| SPREADSHEET_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false);

        if is_spreadsheet {
            SourceDescriptor::Spreadsheet { path, sheet }
        } else {
            SourceDescriptor::Delimited { path, delimiter }
        }
    }

    pub fn location(&self) -> String {
        match self {
            SourceDescriptor::Delimited { path, .. } => path.display().to_string(),
            SourceDescriptor::Spreadsheet { path, sheet: Some(sheet) } => {
                format!("{}#{}", path.display(), sheet)
            }
            SourceDescriptor::Spreadsheet { path, sheet: None } => path.display().to_string(),
            SourceDescriptor::Memory { name } => format!("memory:{}", name),
        }
    }
}

/// Row source trait - abstraction over every tabular input
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Fetch up to `max_rows` data rows starting at the 0-based `start_row`
    async fn fetch(
        &self,
        descriptor: &SourceDescriptor,
        start_row: usize,
        max_rows: usize,
    ) -> Result<RowWindow, SourceError>;

    /// Get source name for logging
    fn name(&self) -> &str;
}

// =============================================================================
// Table
// =============================================================================

/// Fully materialized source: header row plus data rows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn window(&self, start_row: usize, max_rows: usize) -> RowWindow {
        let rows = self
            .rows
            .iter()
            .skip(start_row)
            .take(max_rows)
            .cloned()
            .collect();
        RowWindow {
            headers: self.headers.clone(),
            start_row,
            rows,
            total_rows: self.rows.len(),
        }
    }
}

/// Map an IO failure on `path` onto the caller-facing failure classes
pub(crate) fn classify_io_error(path: &Path, err: &io::Error) -> SourceError {
    let location = path.display().to_string();
    match err.kind() {
        io::ErrorKind::NotFound => SourceError::NotFound { location },
        io::ErrorKind::PermissionDenied => SourceError::AccessDenied { location },
        _ => SourceError::ServiceUnavailable {
            reason: format!("{}: {}", location, err),
        },
    }
}

/// Fail early with a classified error if `path` cannot be opened
pub(crate) fn check_readable(path: &Path) -> Result<(), SourceError> {
    std::fs::File::open(path)
        .map(|_| ())
        .map_err(|e| classify_io_error(path, &e))
}

// =============================================================================
// FileRowSource
// =============================================================================

/// Reads delimited text and spreadsheet files from disk.
///
/// Each descriptor is parsed once and cached, so repeated windowed fetches
/// within a run see the same rows.
#[derive(Default)]
pub struct FileRowSource {
    cache: Mutex<HashMap<SourceDescriptor, Arc<Table>>>,
}

impl FileRowSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a cached table so the next fetch re-reads the file
    pub fn invalidate(&self, descriptor: &SourceDescriptor) {
        self.cache.lock().remove(descriptor);
    }

    async fn load(&self, descriptor: &SourceDescriptor) -> Result<Arc<Table>, SourceError> {
        let cached = self.cache.lock().get(descriptor).cloned();
        if let Some(table) = cached {
            return Ok(table);
        }

        let owned = descriptor.clone();
        let table = tokio::task::spawn_blocking(move || match &owned {
            SourceDescriptor::Delimited { path, delimiter } => {
                delimited::read_table(path, *delimiter)
            }
            SourceDescriptor::Spreadsheet { path, sheet } => {
                spreadsheet::read_table(path, sheet.as_deref())
            }
            SourceDescriptor::Memory { name } => Err(SourceError::NotFound {
                location: format!("memory:{}", name),
            }),
        })
        .await
        .map_err(|e| SourceError::ServiceUnavailable {
            reason: format!("reader task failed: {}", e),
        })??;

        debug!(
            "Loaded {} rows ({} columns) from {}",
            table.rows.len(),
            table.headers.len(),
            descriptor.location()
        );

        let table = Arc::new(table);
        self.cache
            .lock()
            .insert(descriptor.clone(), Arc::clone(&table));
        Ok(table)
    }
}

#[async_trait]
impl RowSource for FileRowSource {
    async fn fetch(
        &self,
        descriptor: &SourceDescriptor,
        start_row: usize,
        max_rows: usize,
    ) -> Result<RowWindow, SourceError> {
        let table = self.load(descriptor).await?;
        Ok(table.window(start_row, max_rows))
    }

    fn name(&self) -> &str {
        "FileRowSource"
    }
}

// =============================================================================
// InMemoryRowSource
// =============================================================================

/// Serves a fixed table, with optional per-window failures and a fetch log
#[derive(Default)]
pub struct InMemoryRowSource {
    table: Table,
    failures: Mutex<HashMap<usize, SourceError>>,
    fetches: Mutex<Vec<(usize, usize)>>,
    fetch_count: AtomicUsize,
}

impl InMemoryRowSource {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            ..Default::default()
        }
    }

    /// Build from string slices, first slice being the header row
    pub fn from_rows(headers: &[&str], rows: &[Vec<&str>]) -> Self {
        Self::new(Table::new(
            headers.iter().map(|h| h.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        ))
    }

    /// Make every fetch starting at `start_row` fail with `error`
    pub fn fail_window(&self, start_row: usize, error: SourceError) {
        self.failures.lock().insert(start_row, error);
    }

    /// `(start_row, max_rows)` of every fetch so far
    pub fn fetch_log(&self) -> Vec<(usize, usize)> {
        self.fetches.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RowSource for InMemoryRowSource {
    async fn fetch(
        &self,
        _descriptor: &SourceDescriptor,
        start_row: usize,
        max_rows: usize,
    ) -> Result<RowWindow, SourceError> {
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        self.fetches.lock().push((start_row, max_rows));

        let failure = self.failures.lock().get(&start_row).cloned();
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(self.table.window(start_row, max_rows))
    }

    fn name(&self) -> &str {
        "InMemoryRowSource"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn memory() -> SourceDescriptor {
        SourceDescriptor::Memory { name: "test".into() }
    }

    #[test]
    fn test_descriptor_from_path_picks_adapter_by_extension() {
        let d = SourceDescriptor::from_path("jobs.XLSX", None, b',');
        assert!(matches!(d, SourceDescriptor::Spreadsheet { .. }));

        let d = SourceDescriptor::from_path("jobs.csv", None, b';');
        assert_eq!(d, SourceDescriptor::Delimited { path: "jobs.csv".into(), delimiter: b';' });

        let d = SourceDescriptor::from_path("jobs.ods", Some("Export".into()), b',');
        assert_eq!(d.location(), "jobs.ods#Export");
    }

    #[test]
    fn test_table_window_past_end_is_empty() {
        let table = Table::new(vec!["a".into()], vec![vec!["1".into()], vec!["2".into()]]);
        let w = table.window(5, 10);
        assert!(w.rows.is_empty());
        assert_eq!(w.total_rows, 2);
    }

    #[tokio::test]
    async fn test_in_memory_source_windows_are_stable() {
        let source = InMemoryRowSource::from_rows(
            &["id", "status"],
            &[vec!["1", "A"], vec!["2", "B"], vec!["3", "C"]],
        );

        let probe = source.fetch(&memory(), 0, 1).await.unwrap();
        assert_eq!(probe.total_rows, 3);
        assert_eq!(probe.rows.len(), 1);

        let first = source.fetch(&memory(), 1, 2).await.unwrap();
        let again = source.fetch(&memory(), 1, 2).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.source_rows()[0].row_index, 2);
        assert_eq!(source.fetch_log(), vec![(0, 1), (1, 2), (1, 2)]);
    }

    #[tokio::test]
    async fn test_in_memory_source_injected_failure() {
        let source = InMemoryRowSource::from_rows(&["id"], &[vec!["1"], vec!["2"]]);
        source.fail_window(1, SourceError::ServiceUnavailable { reason: "503".into() });

        assert!(source.fetch(&memory(), 0, 1).await.is_ok());
        let err = source.fetch(&memory(), 1, 1).await.unwrap_err();
        assert!(matches!(err, SourceError::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_file_source_missing_file_is_not_found() {
        let source = FileRowSource::new();
        let descriptor = SourceDescriptor::from_path("/definitely/not/here.csv", None, b',');
        let err = source.fetch(&descriptor, 0, 1).await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
        assert!(!err.remediation().is_empty());
    }

    #[tokio::test]
    async fn test_file_source_caches_parsed_table() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "Job Ref,Status").unwrap();
        writeln!(file, "A-1,NEW").unwrap();
        writeln!(file, "A-2,NEW").unwrap();
        file.flush().unwrap();

        let source = FileRowSource::new();
        let descriptor = SourceDescriptor::from_path(file.path(), None, b',');
        let first = source.fetch(&descriptor, 0, 10).await.unwrap();
        assert_eq!(first.total_rows, 2);

        // Appending after the first fetch must not change the run's view
        writeln!(file, "A-3,NEW").unwrap();
        file.flush().unwrap();
        let second = source.fetch(&descriptor, 0, 10).await.unwrap();
        assert_eq!(second.total_rows, 2);

        source.invalidate(&descriptor);
        let third = source.fetch(&descriptor, 0, 10).await.unwrap();
        assert_eq!(third.total_rows, 3);
    }
}
