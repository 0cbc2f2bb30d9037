//! Progress publishing
//!
//! The orchestrator is the single writer of run progress. After each state
//! change and each chunk it hands an immutable `RunProgress` snapshot to a
//! `ProgressSink`; sinks never mutate run state.

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::types::{RunProgress, RunState, SummaryCounts};

pub trait ProgressSink: Send + Sync {
    fn publish(&self, progress: &RunProgress);
}

/// Latest snapshot wins; UI subscribers read it from the receiver
impl ProgressSink for watch::Sender<RunProgress> {
    fn publish(&self, progress: &RunProgress) {
        self.send_replace(progress.clone());
    }
}

/// Writes each snapshot to the log
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn publish(&self, p: &RunProgress) {
        info!(
            run_id = %p.run_id,
            "Import {:?}: chunk {}/{}, rows {}/{} (inserted {}, updated {}, skipped {}, duplicates {}, errors {})",
            p.state,
            p.current_chunk,
            p.total_chunks,
            p.processed_rows,
            p.total_rows,
            p.aggregated_so_far.inserted,
            p.aggregated_so_far.updated,
            p.aggregated_so_far.skipped,
            p.aggregated_so_far.duplicates,
            p.aggregated_so_far.errors
        );
    }
}

/// Keeps every snapshot (for tests)
#[derive(Default)]
pub struct CollectingProgressSink {
    snapshots: Mutex<Vec<RunProgress>>,
}

impl CollectingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<RunProgress> {
        self.snapshots.lock().clone()
    }

    pub fn states(&self) -> Vec<RunState> {
        self.snapshots.lock().iter().map(|p| p.state).collect()
    }
}

impl ProgressSink for CollectingProgressSink {
    fn publish(&self, progress: &RunProgress) {
        self.snapshots.lock().push(progress.clone());
    }
}

// =============================================================================
// PUBLISHER
// =============================================================================

/// Owns the current snapshot for one run and publishes every change
pub(crate) struct ProgressPublisher<'a> {
    sink: &'a dyn ProgressSink,
    current: RunProgress,
}

impl<'a> ProgressPublisher<'a> {
    pub fn new(run_id: Uuid, sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            current: RunProgress::idle(run_id),
        }
    }

    pub fn state(&self) -> RunState {
        self.current.state
    }

    pub fn transition(&mut self, state: RunState) {
        self.current.state = state;
        self.current.is_running = state.is_running();
        self.current.can_cancel = matches!(state, RunState::Running { .. });
        self.sink.publish(&self.current);
    }

    pub fn sized(&mut self, total_rows: usize, total_chunks: usize) {
        self.current.total_rows = total_rows;
        self.current.total_chunks = total_chunks;
    }

    pub fn chunk_done(&mut self, current_chunk: usize, processed_rows: usize, counts: SummaryCounts) {
        self.current.current_chunk = current_chunk;
        self.current.processed_rows = processed_rows.min(self.current.total_rows);
        self.current.aggregated_so_far = counts;
        self.sink.publish(&self.current);
    }
}
