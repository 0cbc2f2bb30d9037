//! Error types for partner imports
//!
//! Run-level failures abort before any row is processed and come back as
//! `Err(ImportError)`. Row and chunk failures never escape a run; they are
//! rendered into the run summary instead.

use thiserror::Error;

use crate::types::InternalField;

/// Failure that aborts a run before any row is processed
#[derive(Debug, Error)]
pub enum ImportError {
    /// Mapping profile or source shape does not allow a run
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Row source unreachable or unauthorized
    #[error("Source access error: {0}")]
    SourceAccess(#[from] SourceError),

    /// Destination store failed outside of row processing
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ImportError {
    pub fn configuration(message: impl Into<String>) -> Self {
        ImportError::Configuration(message.into())
    }
}

/// Row source failure classes surfaced to the caller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source '{location}' was not found")]
    NotFound { location: String },

    #[error("access to source '{location}' was denied")]
    AccessDenied { location: String },

    #[error("source service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    #[error("source '{location}' could not be read: {reason}")]
    Unreadable { location: String, reason: String },
}

impl SourceError {
    /// Actionable hint shown next to the error instead of a raw transport message
    pub fn remediation(&self) -> &'static str {
        match self {
            SourceError::NotFound { .. } => {
                "Check the file path or sheet link and that the file has not been moved or renamed."
            }
            SourceError::AccessDenied { .. } => {
                "Share the file with the import account (read access is enough) or fix its file permissions."
            }
            SourceError::ServiceUnavailable { .. } => {
                "The source is temporarily unavailable. Wait a moment and retry the import."
            }
            SourceError::Unreadable { .. } => {
                "Make sure the file is a valid delimited text file or spreadsheet with a header row."
            }
        }
    }
}

/// Destination store failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store timeout: {0}")]
    Timeout(String),

    #[error("store throttled: {0}")]
    Throttled(String),

    #[error("job with external id '{external_id}' already exists")]
    UniqueViolation { external_id: String },

    #[error("store rejected write: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Timeouts and throttling abort the rest of the containing chunk
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Throttled(_))
    }
}

/// Failure isolated to a single row
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("required field '{field}' is missing or empty")]
    MissingField { field: InternalField },

    #[error("lookup failed: {0}")]
    Lookup(StoreError),

    #[error("write failed: {0}")]
    Apply(StoreError),
}

/// Failure isolated to a single chunk
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkFailure {
    /// Timeout or throttling from the store; stops the run
    #[error("chunk starting at row {start_row} aborted: {error}")]
    Transient { start_row: usize, error: StoreError },

    /// Window could not be fetched; the run skips the chunk and continues
    #[error("chunk starting at row {start_row} could not be fetched: {error}")]
    Source { start_row: usize, error: SourceError },
}

impl ChunkFailure {
    /// 1-based row number of the first row in the failed chunk
    pub fn start_row(&self) -> usize {
        match self {
            ChunkFailure::Transient { start_row, .. } | ChunkFailure::Source { start_row, .. } => {
                *start_row
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ChunkFailure::Transient { .. })
    }
}
