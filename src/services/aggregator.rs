//! Result aggregator
//!
//! Folds chunk outcomes into one run summary. Counts sum, issue lists
//! concatenate in source order and preview buckets fill only when the run
//! keeps previews. Outcomes must arrive in window order.

use std::collections::BTreeSet;

use crate::error::ChunkFailure;
use crate::types::{
    ChunkOutcome, Decision, ImportRunSummary, IssueScope, RowIssue, SummaryCounts,
};

pub struct RunAggregator {
    summary: ImportRunSummary,
    keep_preview: bool,
    unmapped_engineers: BTreeSet<String>,
    chunks: usize,
    chunk_failures: usize,
}

impl RunAggregator {
    pub fn new(dry_run: bool, keep_preview: bool) -> Self {
        Self {
            summary: ImportRunSummary::new(dry_run),
            keep_preview,
            unmapped_engineers: BTreeSet::new(),
            chunks: 0,
            chunk_failures: 0,
        }
    }

    /// Fold one chunk into the running totals
    pub fn absorb(&mut self, outcome: ChunkOutcome) {
        self.chunks += 1;
        for decision in outcome.decisions {
            self.record_decision(decision);
        }
        self.summary.warnings.extend(outcome.warnings);
        self.unmapped_engineers.extend(outcome.unmapped_engineers);
        if let Some(failure) = &outcome.failure {
            self.record_chunk_failure(failure);
        }
    }

    fn record_decision(&mut self, decision: Decision) {
        self.summary.processed += 1;
        match decision {
            Decision::Insert { .. } => {
                self.summary.inserted += 1;
                if self.keep_preview {
                    self.summary.preview.inserts.push(decision);
                }
            }
            Decision::Update { .. } => {
                self.summary.updated += 1;
                if self.keep_preview {
                    self.summary.preview.updates.push(decision);
                }
            }
            Decision::Skip { .. } => {
                self.summary.skipped += 1;
                if self.keep_preview {
                    self.summary.preview.skips.push(decision);
                }
            }
            Decision::Duplicate { .. } => {
                self.summary.duplicates += 1;
                if self.keep_preview {
                    self.summary.preview.skips.push(decision);
                }
            }
            Decision::Error { row_index, external_id, message, data } => {
                self.summary.errors.push(RowIssue {
                    row: row_index,
                    scope: IssueScope::Row,
                    message,
                    external_id,
                    data,
                });
            }
        }
    }

    pub fn record_chunk_failure(&mut self, failure: &ChunkFailure) {
        self.chunk_failures += 1;
        self.summary.errors.push(RowIssue {
            row: failure.start_row(),
            scope: IssueScope::Chunk,
            message: failure.to_string(),
            external_id: None,
            data: Default::default(),
        });
    }

    /// `next_row` is the 1-based number of the first row left unprocessed
    pub fn record_cancellation(&mut self, next_row: usize) {
        self.summary.errors.push(RowIssue {
            row: next_row,
            scope: IssueScope::Run,
            message: format!("import cancelled by operator before row {}", next_row),
            external_id: None,
            data: Default::default(),
        });
    }

    pub fn counts(&self) -> SummaryCounts {
        self.summary.counts()
    }

    pub fn chunks_absorbed(&self) -> usize {
        self.chunks
    }

    pub fn has_chunk_failures(&self) -> bool {
        self.chunk_failures > 0
    }

    pub fn finish(mut self) -> ImportRunSummary {
        self.summary.unmapped_engineers = self.unmapped_engineers.into_iter().collect();
        self.summary
    }
}
