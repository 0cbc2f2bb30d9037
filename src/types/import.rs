//! Import run types: chunk outcomes, run summary, progress snapshots and results

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChunkFailure;
use super::{ChunkWindow, Decision};

// =============================================================================
// ISSUES
// =============================================================================

/// What an error entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueScope {
    Row,
    Chunk,
    Run,
}

/// Error entry in a run summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowIssue {
    /// 1-based row number; for chunk entries the chunk's first row
    pub row: usize,
    pub scope: IssueScope,
    pub message: String,
    pub external_id: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Non-fatal warning in a run summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowWarning {
    pub row: usize,
    pub warning: String,
    pub external_id: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

// =============================================================================
// CHUNK OUTCOME
// =============================================================================

/// Everything one chunk produced, before it is folded into the run summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub window: ChunkWindow,
    /// Rows the source actually returned for the window
    pub rows_fetched: usize,
    pub decisions: Vec<Decision>,
    pub warnings: Vec<RowWarning>,
    pub unmapped_engineers: BTreeSet<String>,
    /// Set when the chunk was aborted or could not be fetched
    pub failure: Option<ChunkFailure>,
}

impl ChunkOutcome {
    pub fn new(window: ChunkWindow) -> Self {
        Self {
            window,
            rows_fetched: 0,
            decisions: Vec::new(),
            warnings: Vec::new(),
            unmapped_engineers: BTreeSet::new(),
            failure: None,
        }
    }

    pub fn failed(window: ChunkWindow, failure: ChunkFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(window)
        }
    }

    /// Where the next chunk should start. A failed or empty fetch advances
    /// by the full window so the run never stalls.
    pub fn next_start_row(&self) -> usize {
        if self.failure.is_some() || self.rows_fetched == 0 {
            self.window.start_row + self.window.size.max(1)
        } else {
            self.window.start_row + self.rows_fetched
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.failure.as_ref().is_some_and(ChunkFailure::is_fatal)
    }
}

// =============================================================================
// RUN SUMMARY
// =============================================================================

/// Decision detail kept for UI preview
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewBuckets {
    pub inserts: Vec<Decision>,
    pub updates: Vec<Decision>,
    /// Skips and duplicates
    pub skips: Vec<Decision>,
}

impl PreviewBuckets {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.skips.is_empty()
    }
}

/// Counters only, as published with progress snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryCounts {
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub warnings: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRunSummary {
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub errors: Vec<RowIssue>,
    pub warnings: Vec<RowWarning>,
    pub dry_run: bool,
    pub preview: PreviewBuckets,
    /// Sorted, unique engineer identifiers without a mapping
    pub unmapped_engineers: Vec<String>,
}

impl ImportRunSummary {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Default::default()
        }
    }

    pub fn counts(&self) -> SummaryCounts {
        SummaryCounts {
            processed: self.processed,
            inserted: self.inserted,
            updated: self.updated,
            skipped: self.skipped,
            duplicates: self.duplicates,
            errors: self.errors.len(),
            warnings: self.warnings.len(),
        }
    }

    pub fn row_error_count(&self) -> usize {
        self.errors.iter().filter(|e| e.scope == IssueScope::Row).count()
    }

    /// `processed = inserted + updated + skipped + duplicates + row errors`
    pub fn is_balanced(&self) -> bool {
        self.processed
            == self.inserted + self.updated + self.skipped + self.duplicates + self.row_error_count()
    }

    /// Bounded prefix of errors and warnings for inline display
    pub fn inline(&self, limit: usize) -> InlineIssues {
        InlineIssues {
            errors: self.errors.iter().take(limit).cloned().collect(),
            warnings: self.warnings.iter().take(limit).cloned().collect(),
            hidden_errors: self.errors.len().saturating_sub(limit),
            hidden_warnings: self.warnings.len().saturating_sub(limit),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineIssues {
    pub errors: Vec<RowIssue>,
    pub warnings: Vec<RowWarning>,
    pub hidden_errors: usize,
    pub hidden_warnings: usize,
}

// =============================================================================
// RUN STATE & PROGRESS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutionMode {
    Sequential,
    Parallel { chunks: usize },
}

impl ExecutionMode {
    /// `0` or `1` parallel chunks means sequential
    pub fn from_parallelism(chunks: usize) -> Self {
        if chunks > 1 {
            ExecutionMode::Parallel { chunks }
        } else {
            ExecutionMode::Sequential
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunState {
    Idle,
    Probing,
    Running { mode: ExecutionMode },
    Cancelling,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Probing | RunState::Running { .. } | RunState::Cancelling)
    }
}

/// Snapshot published after every chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub run_id: Uuid,
    pub state: RunState,
    pub current_chunk: usize,
    pub total_chunks: usize,
    pub processed_rows: usize,
    pub total_rows: usize,
    pub aggregated_so_far: SummaryCounts,
    pub is_running: bool,
    pub can_cancel: bool,
}

impl RunProgress {
    pub fn idle(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: RunState::Idle,
            current_chunk: 0,
            total_chunks: 0,
            processed_rows: 0,
            total_rows: 0,
            aggregated_so_far: SummaryCounts::default(),
            is_running: false,
            can_cancel: false,
        }
    }
}

// =============================================================================
// SEEN EXTERNAL IDS
// =============================================================================

/// External ids already decided in a run, with the 1-based row that claimed
/// them. Only Insert, Update and Skip claim an id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeenExternalIds {
    first_rows: BTreeMap<String, usize>,
}

impl SeenExternalIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `row` as the claim for `external_id`; an earlier claim wins
    pub fn record(&mut self, external_id: &str, row: usize) {
        self.first_rows.entry(external_id.to_string()).or_insert(row);
    }

    pub fn first_row(&self, external_id: &str) -> Option<usize> {
        self.first_rows.get(external_id).copied()
    }

    /// Claims made strictly before the 1-based `row`
    pub fn before(&self, row: usize) -> Self {
        Self {
            first_rows: self
                .first_rows
                .iter()
                .filter(|(_, first)| **first < row)
                .map(|(id, first)| (id.clone(), *first))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.first_rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_rows.is_empty()
    }
}

// =============================================================================
// RUN RESULT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRunResult {
    pub run_id: Uuid,
    /// Completed without cancellation, chunk failures or an engineer block
    pub success: bool,
    pub cancelled: bool,
    pub summary: ImportRunSummary,
    pub total_rows: usize,
    pub next_start_row: usize,
    pub has_more: bool,
    /// Pass back on the next `run_import` call to keep duplicate detection run-wide
    #[serde(default)]
    pub seen_external_ids: SeenExternalIds,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ImportRunResult {
    pub fn is_blocked(&self) -> bool {
        !self.summary.unmapped_engineers.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}
