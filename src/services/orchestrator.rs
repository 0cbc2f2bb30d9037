//! Chunk orchestrator
//!
//! Drives one import run:
//!
//! ```text
//! Idle -> Probing -> Running(Sequential | Parallel) -> [Cancelling] -> Completed | Failed
//! ```
//!
//! - **Probing**: 1-row fetch for `total_rows` and a header check
//! - **Gate**: whole-source scan for unmapped engineers; any hit blocks the run
//! - **Parallel(N)**: the first N windows are fetched and planned together via
//!   `join_all` (all settle, nothing written), then settled one at a time in
//!   window order so duplicates and writes match a sequential run
//! - **Sequential**: one window at a time from the cursor to the end
//!
//! Cancellation is checked only between chunks. A transient store failure
//! (timeout/throttle) stops the run; a source failure for one window is
//! recorded and the cursor moves on.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ChunkFailure, ImportError};
use crate::services::aggregator::RunAggregator;
use crate::services::cancellation::CancellationRegistry;
use crate::services::engineer_gate::scan_unmapped_engineers;
use crate::services::job_store::JobStore;
use crate::services::progress::{ProgressPublisher, ProgressSink};
use crate::services::reconcile::{PlannedChunk, ReconcileEngine, RunOptions};
use crate::services::row_source::{RowSource, SourceDescriptor};
use crate::types::{
    ChunkOutcome, ChunkWindow, ExecutionMode, ImportRunResult, ImportRunSummary, InternalField,
    MappingProfile, RunState, SeenExternalIds,
};

// =============================================================================
// SETTINGS & REQUEST
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub chunk_size: usize,
    pub parallel_chunks: usize,
    pub gate_page_size: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            parallel_chunks: config.parallel_chunks,
            gate_page_size: config.gate_page_size,
        }
    }
}

/// Everything a caller supplies for one run
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub run_id: Uuid,
    /// Operator allowed to cancel the run
    pub owner_id: Uuid,
    pub descriptor: SourceDescriptor,
    pub profile: MappingProfile,
    pub options: RunOptions,
    /// 0-based row to start from
    pub start_row: usize,
    /// Window size for `run_import`; defaults to the configured chunk size
    pub max_rows: Option<usize>,
    /// Skips the probe when the caller already knows the source size
    pub total_rows_hint: Option<usize>,
    /// Ids claimed by earlier windows of the same run; claims at or after
    /// `start_row` are ignored so a window can be retried
    pub seen_external_ids: SeenExternalIds,
}

impl ImportRequest {
    pub fn new(descriptor: SourceDescriptor, profile: MappingProfile, options: RunOptions) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            owner_id: Uuid::nil(),
            descriptor,
            profile,
            options,
            start_row: 0,
            max_rows: None,
            total_rows_hint: None,
            seen_external_ids: SeenExternalIds::new(),
        }
    }

    pub fn owned_by(mut self, owner_id: Uuid) -> Self {
        self.owner_id = owner_id;
        self
    }

    pub fn window(mut self, start_row: usize, max_rows: usize) -> Self {
        self.start_row = start_row;
        self.max_rows = Some(max_rows);
        self
    }

    pub fn with_total_rows_hint(mut self, total_rows: usize) -> Self {
        self.total_rows_hint = Some(total_rows);
        self
    }

    /// Next window of the same run, after `previous`
    pub fn continuing(mut self, previous: &ImportRunResult) -> Self {
        self.run_id = previous.run_id;
        self.start_row = previous.next_start_row;
        self.total_rows_hint = Some(previous.total_rows);
        self.seen_external_ids = previous.seen_external_ids.clone();
        self
    }

    /// Run-wide claims that precede this request's first row
    fn prior_claims(&self) -> SeenExternalIds {
        self.seen_external_ids.before(self.start_row + 1)
    }
}

/// Outcome of `ChunkOrchestrator::check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub total_rows: usize,
    /// Optional mapped columns absent from the source headers
    pub missing_columns: Vec<String>,
    pub unmapped_engineers: Vec<String>,
}

/// What the probe and gate decided
enum Preflight {
    Ready { total_rows: usize },
    Blocked { total_rows: usize, unmapped: Vec<String> },
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

pub struct ChunkOrchestrator {
    source: Arc<dyn RowSource>,
    store: Arc<dyn JobStore>,
    settings: OrchestratorSettings,
    registry: CancellationRegistry,
}

impl ChunkOrchestrator {
    pub fn new(
        source: Arc<dyn RowSource>,
        store: Arc<dyn JobStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            source,
            store,
            settings,
            registry: CancellationRegistry::default(),
        }
    }

    /// Share a registry with whoever cancels runs (the CLI uses the global one)
    pub fn with_registry(mut self, registry: CancellationRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    fn chunk_size(&self, request: &ImportRequest) -> usize {
        request.max_rows.unwrap_or(self.settings.chunk_size).max(1)
    }

    // =========================================================================
    // Full run
    // =========================================================================

    /// Process the source from `request.start_row` to the end
    pub async fn run(
        &self,
        request: &ImportRequest,
        sink: &dyn ProgressSink,
    ) -> Result<ImportRunResult, ImportError> {
        let started_at = Utc::now();
        let guard = self.registry.register(request.run_id, request.owner_id);
        let mut progress = ProgressPublisher::new(request.run_id, sink);

        info!(
            run_id = %request.run_id,
            "Starting import of {} for partner {} (dry_run={}, create_missing={})",
            request.descriptor.location(),
            request.profile.partner_id,
            request.options.dry_run,
            request.options.create_missing
        );

        progress.transition(RunState::Probing);
        let preflight = match self.preflight(request).await {
            Ok(preflight) => preflight,
            Err(e) => {
                error!(run_id = %request.run_id, "Import aborted before processing: {}", e);
                progress.transition(RunState::Failed);
                return Err(e);
            }
        };

        let total_rows = match preflight {
            Preflight::Ready { total_rows } => total_rows,
            Preflight::Blocked { total_rows, unmapped } => {
                progress.sized(total_rows, 0);
                progress.transition(RunState::Failed);
                return Ok(blocked_result(request, total_rows, unmapped, started_at));
            }
        };

        let chunk_size = self.settings.chunk_size.max(1);
        let remaining = total_rows.saturating_sub(request.start_row);
        let total_chunks = ChunkWindow::count(remaining, chunk_size);
        let mode = ExecutionMode::from_parallelism(self.settings.parallel_chunks);
        progress.sized(total_rows, total_chunks);
        progress.transition(RunState::Running { mode });

        let mut aggregator = RunAggregator::new(request.options.dry_run, request.options.keeps_preview());
        let mut seen = request.prior_claims();
        let mut cursor = request.start_row;
        let mut chunk_no = 0;
        let mut cancelled = false;
        let mut fatal = false;

        if let ExecutionMode::Parallel { chunks } = mode {
            if guard.is_cancelled() {
                cancelled = true;
            } else {
                let windows: Vec<ChunkWindow> = ChunkWindow::plan(cursor, total_rows, chunk_size)
                    .into_iter()
                    .take(chunks)
                    .collect();

                debug!(run_id = %request.run_id, "Planning {} windows in parallel", windows.len());

                let planned = join_all(
                    windows
                        .iter()
                        .map(|window| self.plan_window(request, *window, &seen)),
                )
                .await;

                // join_all keeps input order, so settling follows window order
                let engine = self.engine(request);
                for chunk in planned {
                    let outcome = engine.settle_rows(chunk, &mut seen).await;
                    fatal |= outcome.is_fatal();
                    chunk_no += 1;
                    cursor = outcome.next_start_row().min(total_rows);
                    aggregator.absorb(outcome);
                }
                progress.chunk_done(chunk_no, cursor - request.start_row, aggregator.counts());

                if fatal {
                    error!(run_id = %request.run_id, "Parallel phase hit a fatal chunk error, stopping run");
                }
            }
        }

        while !fatal && !cancelled && cursor < total_rows {
            if guard.is_cancelled() {
                cancelled = true;
                break;
            }

            let window = ChunkWindow::new(cursor, chunk_size, total_rows);
            let outcome = self.process_window(request, window, &mut seen).await;
            chunk_no += 1;
            fatal = outcome.is_fatal();
            cursor = outcome.next_start_row().min(total_rows);
            aggregator.absorb(outcome);
            progress.chunk_done(chunk_no, cursor - request.start_row, aggregator.counts());

            if fatal {
                error!(
                    run_id = %request.run_id,
                    start_row = window.first_row_number(),
                    "Chunk {} hit a fatal store error, stopping run",
                    chunk_no
                );
            }
        }

        if cancelled {
            warn!(run_id = %request.run_id, "Import cancelled after {} chunks", chunk_no);
            progress.transition(RunState::Cancelling);
            aggregator.record_cancellation(cursor + 1);
        }

        let success = !cancelled && !aggregator.has_chunk_failures();
        progress.transition(if fatal { RunState::Failed } else { RunState::Completed });
        debug!(run_id = %request.run_id, "Run ended in state {:?} after {} chunks", progress.state(), chunk_no);

        let summary = aggregator.finish();
        info!(
            run_id = %request.run_id,
            "Import finished: processed={} inserted={} updated={} skipped={} duplicates={} errors={} warnings={}",
            summary.processed,
            summary.inserted,
            summary.updated,
            summary.skipped,
            summary.duplicates,
            summary.errors.len(),
            summary.warnings.len()
        );

        Ok(ImportRunResult {
            run_id: request.run_id,
            success,
            cancelled,
            summary,
            total_rows,
            next_start_row: cursor,
            has_more: cursor < total_rows,
            seen_external_ids: seen,
            started_at,
            finished_at: Utc::now(),
        })
    }

    // =========================================================================
    // Single window
    // =========================================================================

    /// Validate, probe (unless hinted), gate, then process one window starting
    /// at `request.start_row`. Safe to call again with the same start row.
    /// Callers driving a whole source pass each result on via
    /// `ImportRequest::continuing` so repeats across windows stay `Duplicate`.
    pub async fn run_import(&self, request: &ImportRequest) -> Result<ImportRunResult, ImportError> {
        let started_at = Utc::now();

        let total_rows = match self.preflight(request).await? {
            Preflight::Ready { total_rows } => total_rows,
            Preflight::Blocked { total_rows, unmapped } => {
                return Ok(blocked_result(request, total_rows, unmapped, started_at));
            }
        };

        let window = ChunkWindow::new(request.start_row, self.chunk_size(request), total_rows);
        let mut aggregator = RunAggregator::new(request.options.dry_run, request.options.keeps_preview());
        let mut next_start_row = request.start_row.max(total_rows);
        let mut seen = request.prior_claims();

        if request.start_row < total_rows {
            let outcome = self.process_window(request, window, &mut seen).await;
            next_start_row = outcome.next_start_row().min(total_rows);
            aggregator.absorb(outcome);
        }

        let success = !aggregator.has_chunk_failures();
        Ok(ImportRunResult {
            run_id: request.run_id,
            success,
            cancelled: false,
            summary: aggregator.finish(),
            total_rows,
            next_start_row,
            has_more: next_start_row < total_rows,
            seen_external_ids: seen,
            started_at,
            finished_at: Utc::now(),
        })
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Validate the profile, probe the source (unless hinted) and run the
    /// engineer gate without processing any rows
    pub async fn check(&self, request: &ImportRequest) -> Result<PreflightReport, ImportError> {
        request.profile.ensure_runnable()?;

        let (total_rows, missing_columns) = match request.total_rows_hint {
            Some(hint) => (hint, Vec::new()),
            None => self.probe(request).await?,
        };
        if total_rows == 0 {
            return Err(ImportError::configuration("no data rows found"));
        }

        let unmapped_engineers = scan_unmapped_engineers(
            self.source.as_ref(),
            &request.descriptor,
            &request.profile,
            self.settings.gate_page_size,
        )
        .await?;

        Ok(PreflightReport { total_rows, missing_columns, unmapped_engineers })
    }

    async fn preflight(&self, request: &ImportRequest) -> Result<Preflight, ImportError> {
        let report = self.check(request).await?;
        let total_rows = report.total_rows;

        if report.unmapped_engineers.is_empty() {
            Ok(Preflight::Ready { total_rows })
        } else {
            warn!(
                run_id = %request.run_id,
                "Import blocked: {} unmapped engineers ({})",
                report.unmapped_engineers.len(),
                report.unmapped_engineers.join(", ")
            );
            Ok(Preflight::Blocked { total_rows, unmapped: report.unmapped_engineers })
        }
    }

    /// 1-row fetch: learn the source size and check mapped columns exist.
    /// Returns the size and the optional mapped columns the headers lack.
    async fn probe(&self, request: &ImportRequest) -> Result<(usize, Vec<String>), ImportError> {
        let probe = self.source.fetch(&request.descriptor, 0, 1).await?;
        let mut missing = Vec::new();

        for field in InternalField::ALL {
            let Some(column) = request.profile.column_for(field) else {
                continue;
            };
            if probe.has_column(column) {
                continue;
            }
            if InternalField::REQUIRED.contains(&field) {
                return Err(ImportError::configuration(format!(
                    "column '{}' mapped to {} is not in the source headers",
                    column, field
                )));
            }
            warn!(
                "Column '{}' mapped to {} is not in the source headers, field will stay empty",
                column, field
            );
            missing.push(column.to_string());
        }

        debug!(
            run_id = %request.run_id,
            "Probe of {} via {}: {} rows, {} columns",
            request.descriptor.location(),
            self.source.name(),
            probe.total_rows,
            probe.headers.len()
        );
        Ok((probe.total_rows, missing))
    }

    fn engine<'a>(&'a self, request: &'a ImportRequest) -> ReconcileEngine<'a> {
        ReconcileEngine::new(&request.profile, self.store.as_ref(), request.options)
    }

    /// Fetch and plan one window; nothing is written
    async fn plan_window(
        &self,
        request: &ImportRequest,
        window: ChunkWindow,
        seen: &SeenExternalIds,
    ) -> PlannedChunk {
        debug!(
            run_id = %request.run_id,
            start_row = window.first_row_number(),
            "Processing rows {}..={}",
            window.first_row_number(),
            window.end_row()
        );

        let fetched = match self
            .source
            .fetch(&request.descriptor, window.start_row, window.len())
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(
                    run_id = %request.run_id,
                    "Fetch of rows from {} failed, skipping chunk: {} ({})",
                    window.first_row_number(),
                    e,
                    e.remediation()
                );
                return PlannedChunk::failed(
                    window,
                    ChunkFailure::Source { start_row: window.first_row_number(), error: e },
                );
            }
        };

        self.engine(request)
            .plan_rows(window, &fetched.source_rows(), seen)
            .await
    }

    async fn process_window(
        &self,
        request: &ImportRequest,
        window: ChunkWindow,
        seen: &mut SeenExternalIds,
    ) -> ChunkOutcome {
        let planned = self.plan_window(request, window, seen).await;
        self.engine(request).settle_rows(planned, seen).await
    }
}

fn blocked_result(
    request: &ImportRequest,
    total_rows: usize,
    unmapped: Vec<String>,
    started_at: chrono::DateTime<Utc>,
) -> ImportRunResult {
    let mut summary = ImportRunSummary::new(request.options.dry_run);
    summary.unmapped_engineers = unmapped;
    ImportRunResult {
        run_id: request.run_id,
        success: false,
        cancelled: false,
        summary,
        total_rows,
        next_start_row: request.start_row,
        has_more: request.start_row < total_rows,
        seen_external_ids: request.seen_external_ids.clone(),
        started_at,
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SourceError, StoreError};
    use crate::services::job_store::InMemoryJobStore;
    use crate::services::progress::CollectingProgressSink;
    use crate::services::row_source::InMemoryRowSource;
    use crate::types::{Decision, IssueScope, InternalStatus, RunProgress};

    const HEADERS: [&str; 5] = ["Ref", "Status", "Engineer", "Customer", "Phone"];

    fn profile() -> MappingProfile {
        let mut p = MappingProfile::new("acme");
        p.set_column_mapping(InternalField::PartnerExternalId, Some("Ref"));
        p.set_column_mapping(InternalField::PartnerStatus, Some("Status"));
        p.set_column_mapping(InternalField::EngineerIdentifier, Some("Engineer"));
        p.set_column_mapping(InternalField::ClientName, Some("Customer"));
        p.set_column_mapping(InternalField::ClientPhone, Some("Phone"));
        p.add_status_mapping("NEW", InternalStatus::AwaitingSurvey);
        p.add_status_mapping("AWAITING_INSTALL_DATE", InternalStatus::AwaitingInstallBooking);
        p.add_override_rule("AWAITING_INSTALL_DATE", true);
        p.add_engineer_mapping("A.Brown", "eng-2");
        p
    }

    /// `ids[i]` becomes row i+1, all NEW, assigned to A.Brown
    fn source(ids: &[&str]) -> Arc<InMemoryRowSource> {
        let rows: Vec<Vec<&str>> = ids
            .iter()
            .map(|id| vec![*id, "NEW", "A.Brown", "Jana", "777"])
            .collect();
        Arc::new(InMemoryRowSource::from_rows(&HEADERS, &rows))
    }

    /// `(id, customer)` pairs, all NEW and assigned to A.Brown
    fn named_source(rows: &[(&str, &str)]) -> Arc<InMemoryRowSource> {
        let rows: Vec<Vec<&str>> = rows
            .iter()
            .map(|(id, name)| vec![*id, "NEW", "A.Brown", *name, "777"])
            .collect();
        Arc::new(InMemoryRowSource::from_rows(&HEADERS, &rows))
    }

    /// X at rows 4 and 9 with different customers
    const REPEATED_X: [(&str, &str); 10] = [
        ("A", "Jana"),
        ("B", "Jana"),
        ("C", "Jana"),
        ("X", "Jana"),
        ("D", "Jana"),
        ("E", "Petr"),
        ("F", "Petr"),
        ("G", "Petr"),
        ("X", "Impostor"),
        ("H", "Petr"),
    ];

    fn client_name(store: &InMemoryJobStore, external_id: &str) -> Option<String> {
        store
            .get(external_id)
            .and_then(|job| job.fields.get(&InternalField::ClientName).cloned())
    }

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor::Memory { name: "partner.csv".into() }
    }

    fn settings(chunk_size: usize, parallel_chunks: usize) -> OrchestratorSettings {
        OrchestratorSettings { chunk_size, parallel_chunks, gate_page_size: 3 }
    }

    fn live() -> RunOptions {
        RunOptions { dry_run: false, create_missing: true, verbose: false }
    }

    fn dry() -> RunOptions {
        RunOptions { dry_run: true, create_missing: true, verbose: false }
    }

    fn orchestrator(
        source: Arc<InMemoryRowSource>,
        store: Arc<InMemoryJobStore>,
        settings: OrchestratorSettings,
    ) -> ChunkOrchestrator {
        ChunkOrchestrator::new(source, store, settings)
    }

    /// Cancels its run once `after_chunk` chunks have been reported
    struct CancelAfter {
        registry: CancellationRegistry,
        run_id: Uuid,
        owner_id: Uuid,
        after_chunk: usize,
    }

    impl ProgressSink for CancelAfter {
        fn publish(&self, progress: &RunProgress) {
            if progress.current_chunk == self.after_chunk {
                let _ = self.registry.cancel(&self.run_id, self.owner_id);
            }
        }
    }

    #[tokio::test]
    async fn test_three_new_rows_in_two_chunks_all_insert() {
        let source = source(&["P-1", "P-2", "P-3"]);
        let store = Arc::new(InMemoryJobStore::new());
        let orch = orchestrator(source.clone(), store.clone(), settings(2, 0));
        let sink = CollectingProgressSink::new();

        let request = ImportRequest::new(descriptor(), profile(), live());
        let result = orch.run(&request, &sink).await.unwrap();

        assert!(result.success);
        assert_eq!(result.summary.inserted, 3);
        assert_eq!(result.summary.processed, 3);
        assert!(result.summary.is_balanced());
        assert_eq!(store.job_count(), 3);
        assert!(!result.has_more);

        let chunk_reports: Vec<(usize, usize)> = sink
            .snapshots()
            .iter()
            .filter(|p| p.current_chunk > 0 && p.can_cancel)
            .map(|p| (p.current_chunk, p.aggregated_so_far.inserted))
            .collect();
        assert_eq!(chunk_reports, vec![(1, 2), (2, 3)]);
    }

    #[tokio::test]
    async fn test_unmapped_engineer_blocks_run() {
        let source = Arc::new(InMemoryRowSource::from_rows(
            &HEADERS,
            &[
                vec!["P-1", "NEW", "A.Brown", "Jana", "777"],
                vec!["P-2", "NEW", "J.Smith", "Petr", "778"],
            ],
        ));
        let store = Arc::new(InMemoryJobStore::new());
        let orch = orchestrator(source, store.clone(), settings(2, 0));
        let sink = CollectingProgressSink::new();

        for options in [dry(), live()] {
            let request = ImportRequest::new(descriptor(), profile(), options);
            let result = orch.run(&request, &sink).await.unwrap();

            assert!(!result.success);
            assert!(result.is_blocked());
            assert_eq!(result.summary.unmapped_engineers, vec!["J.Smith".to_string()]);
            assert_eq!(result.summary.processed, 0);
            assert!(result.summary.preview.is_empty());
        }
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_override_rule_suppresses_scheduling() {
        let source = Arc::new(InMemoryRowSource::from_rows(
            &HEADERS,
            &[vec!["P-1", "AWAITING_INSTALL_DATE", "A.Brown", "Jana", "777"]],
        ));
        let store = Arc::new(InMemoryJobStore::new());
        let orch = orchestrator(source, store.clone(), settings(10, 0));

        let request = ImportRequest::new(descriptor(), profile(), live());
        orch.run(&request, &CollectingProgressSink::new()).await.unwrap();

        let job = store.get("P-1").unwrap();
        assert_eq!(job.status, Some(InternalStatus::AwaitingInstallBooking));
        assert_eq!(job.status.unwrap().as_str(), "awaiting_install_booking");
        assert!(job.suppress_scheduling);
    }

    #[tokio::test]
    async fn test_repeated_external_id_across_chunks_is_duplicate() {
        let source = source(&["A", "B", "C", "X", "D", "E", "F", "G", "X", "H"]);
        let store = Arc::new(InMemoryJobStore::new());
        let orch = orchestrator(source, store, settings(5, 0));

        let request = ImportRequest::new(descriptor(), profile(), dry());
        let result = orch.run(&request, &CollectingProgressSink::new()).await.unwrap();

        assert_eq!(result.summary.duplicates, 1);
        assert_eq!(result.summary.inserted, 9);
        assert!(result.summary.preview.inserts.iter().any(|d| d.row_index() == 4));
        assert_eq!(
            result.summary.preview.skips,
            vec![Decision::Duplicate { row_index: 9, external_id: "X".into(), first_row: Some(4) }]
        );
    }

    #[tokio::test]
    async fn test_parallel_phase_detects_cross_chunk_duplicates() {
        let source = source(&["A", "B", "C", "X", "D", "E", "F", "G", "X", "H", "X"]);
        let store = Arc::new(InMemoryJobStore::new());
        let orch = orchestrator(source, store, settings(5, 2));

        let request = ImportRequest::new(descriptor(), profile(), dry());
        let result = orch.run(&request, &CollectingProgressSink::new()).await.unwrap();

        // Rows 1-10 in the parallel phase, row 11 in the sequential tail
        assert!(result.success);
        assert_eq!(result.summary.processed, 11);
        assert_eq!(result.summary.duplicates, 2);
        assert!(result
            .summary
            .preview
            .skips
            .iter()
            .all(|d| matches!(d, Decision::Duplicate { first_row: Some(4), .. })));
        assert!(result.summary.is_balanced());
    }

    #[tokio::test]
    async fn test_parallel_live_run_matches_sequential_counts() {
        let ids = ["A", "B", "C", "D", "E", "F", "G", "H", "I"];
        let seq_store = Arc::new(InMemoryJobStore::new());
        let par_store = Arc::new(InMemoryJobStore::new());

        let seq = orchestrator(source(&ids), seq_store.clone(), settings(2, 0))
            .run(&ImportRequest::new(descriptor(), profile(), live()), &CollectingProgressSink::new())
            .await
            .unwrap();
        let par = orchestrator(source(&ids), par_store.clone(), settings(2, 3))
            .run(&ImportRequest::new(descriptor(), profile(), live()), &CollectingProgressSink::new())
            .await
            .unwrap();

        assert_eq!(seq.summary.counts(), par.summary.counts());
        assert_eq!(seq_store.snapshot().jobs, par_store.snapshot().jobs);
    }

    #[tokio::test]
    async fn test_timeout_in_second_of_four_chunks_stops_run() {
        let source = source(&["P-1", "P-2", "P-3", "P-4", "P-5", "P-6", "P-7", "P-8"]);
        let store = Arc::new(InMemoryJobStore::new());
        store.fail_writes_for("P-4", StoreError::Timeout("upsert exceeded 30s".into()));
        let orch = orchestrator(source, store.clone(), settings(2, 0));
        let sink = CollectingProgressSink::new();

        let request = ImportRequest::new(descriptor(), profile(), live());
        let result = orch.run(&request, &sink).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.summary.inserted, 3);
        assert_eq!(store.job_count(), 3);
        assert!(store.get("P-5").is_none());

        let chunk_errors: Vec<_> = result
            .summary
            .errors
            .iter()
            .filter(|e| e.scope == IssueScope::Chunk)
            .collect();
        assert_eq!(chunk_errors.len(), 1);
        assert_eq!(chunk_errors[0].row, 3);
        assert!(chunk_errors[0].message.contains("timeout"));
        assert!(result.summary.is_balanced());
        assert_eq!(sink.states().last(), Some(&RunState::Failed));
        assert!(result.has_more);
    }

    #[tokio::test]
    async fn test_source_failure_skips_chunk_and_continues() {
        let source = source(&["P-1", "P-2", "P-3", "P-4", "P-5", "P-6"]);
        source.fail_window(2, SourceError::ServiceUnavailable { reason: "503".into() });
        let store = Arc::new(InMemoryJobStore::new());
        // Large gate pages so only the chunk fetch hits the failing window
        let orch = orchestrator(
            source,
            store,
            OrchestratorSettings { chunk_size: 2, parallel_chunks: 0, gate_page_size: 100 },
        );

        let request = ImportRequest::new(descriptor(), profile(), dry());
        let result = orch.run(&request, &CollectingProgressSink::new()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.summary.inserted, 4);
        assert_eq!(result.summary.errors.len(), 1);
        assert_eq!(result.summary.errors[0].row, 3);
        assert_eq!(result.next_start_row, 6);
        assert!(!result.has_more);
    }

    #[tokio::test]
    async fn test_cancellation_keeps_completed_chunks_only() {
        let source = source(&["P-1", "P-2", "P-3", "P-4", "P-5", "P-6"]);
        let store = Arc::new(InMemoryJobStore::new());
        let orch = orchestrator(source, store.clone(), settings(2, 0));

        let owner_id = Uuid::new_v4();
        let request = ImportRequest::new(descriptor(), profile(), live()).owned_by(owner_id);
        let sink = CancelAfter {
            registry: orch.registry().clone(),
            run_id: request.run_id,
            owner_id,
            after_chunk: 1,
        };

        let result = orch.run(&request, &sink).await.unwrap();

        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(result.summary.processed, 2);
        assert_eq!(result.summary.inserted, 2);
        assert_eq!(store.job_count(), 2);
        assert_eq!(result.next_start_row, 2);
        assert!(result.summary.errors.iter().any(|e| e.scope == IssueScope::Run));
        assert!(result.summary.is_balanced());
        assert_eq!(orch.registry().active_runs(), 0);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_processes_nothing() {
        let source = source(&["P-1", "P-2"]);
        let store = Arc::new(InMemoryJobStore::new());
        let orch = orchestrator(source, store.clone(), settings(1, 2));
        let sink = CollectingProgressSink::new();

        let request = ImportRequest::new(descriptor(), profile(), live());
        orch.registry().pre_cancel(request.run_id, request.owner_id);
        let result = orch.run(&request, &sink).await.unwrap();

        assert!(result.cancelled);
        assert_eq!(result.summary.processed, 0);
        assert_eq!(store.write_count(), 0);
        assert!(sink.states().contains(&RunState::Cancelling));
    }

    #[tokio::test]
    async fn test_dry_run_is_deterministic_and_side_effect_free() {
        let source = source(&["P-1", "P-2", "P-1", "P-3", ""]);
        let store = Arc::new(InMemoryJobStore::new());
        let orch = orchestrator(source, store.clone(), settings(2, 0));

        let request = ImportRequest::new(descriptor(), profile(), dry());
        let first = orch.run(&request, &CollectingProgressSink::new()).await.unwrap();
        let second = orch.run(&request, &CollectingProgressSink::new()).await.unwrap();

        assert_eq!(first.summary, second.summary);
        assert_eq!(first.summary.duplicates, 1);
        assert_eq!(first.summary.row_error_count(), 1);
        assert_eq!(store.write_count(), 0);
        assert!(first.summary.dry_run);
    }

    #[tokio::test]
    async fn test_live_preview_only_when_verbose() {
        let store = Arc::new(InMemoryJobStore::new());
        let orch = orchestrator(source(&["P-1"]), store, settings(2, 0));

        let quiet = orch
            .run(&ImportRequest::new(descriptor(), profile(), live()), &CollectingProgressSink::new())
            .await
            .unwrap();
        assert!(quiet.summary.preview.is_empty());

        let verbose = RunOptions { verbose: true, ..live() };
        let loud = orch
            .run(&ImportRequest::new(descriptor(), profile(), verbose), &CollectingProgressSink::new())
            .await
            .unwrap();
        assert_eq!(loud.summary.preview.skips.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_source_is_configuration_error() {
        let source = Arc::new(InMemoryRowSource::from_rows(&HEADERS, &[]));
        let orch = orchestrator(source, Arc::new(InMemoryJobStore::new()), settings(2, 0));
        let sink = CollectingProgressSink::new();

        let err = orch
            .run(&ImportRequest::new(descriptor(), profile(), dry()), &sink)
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::Configuration(ref m) if m.contains("no data rows")));
        assert_eq!(sink.states(), vec![RunState::Probing, RunState::Failed]);
    }

    #[tokio::test]
    async fn test_unmapped_required_field_rejected_before_fetch() {
        let source = source(&["P-1"]);
        let orch = orchestrator(source.clone(), Arc::new(InMemoryJobStore::new()), settings(2, 0));
        let mut p = profile();
        p.set_column_mapping(InternalField::PartnerStatus, None);

        let err = orch
            .run(&ImportRequest::new(descriptor(), p, dry()), &CollectingProgressSink::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::Configuration(_)));
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_required_column_missing_from_headers() {
        let source = source(&["P-1"]);
        let orch = orchestrator(source, Arc::new(InMemoryJobStore::new()), settings(2, 0));
        let mut p = profile();
        p.set_column_mapping(InternalField::PartnerExternalId, Some("Job Reference"));

        let err = orch
            .run(&ImportRequest::new(descriptor(), p, dry()), &CollectingProgressSink::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Job Reference"));
    }

    #[tokio::test]
    async fn test_source_access_error_aborts_with_zero_rows() {
        let source = source(&["P-1"]);
        source.fail_window(0, SourceError::AccessDenied { location: "partner sheet".into() });
        let store = Arc::new(InMemoryJobStore::new());
        let orch = orchestrator(source, store.clone(), settings(2, 0));

        let err = orch
            .run(&ImportRequest::new(descriptor(), profile(), live()), &CollectingProgressSink::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::SourceAccess(SourceError::AccessDenied { .. })));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_run_import_single_window_and_retry() {
        let source = source(&["P-1", "P-2", "P-3", "P-4", "P-5"]);
        let store = Arc::new(InMemoryJobStore::new());
        let orch = orchestrator(source.clone(), store.clone(), settings(100, 0));

        let request = ImportRequest::new(descriptor(), profile(), live()).window(2, 2);
        let first = orch.run_import(&request).await.unwrap();

        assert!(first.success);
        assert_eq!(first.summary.inserted, 2);
        assert_eq!(first.next_start_row, 4);
        assert!(first.has_more);
        assert!(store.get("P-3").is_some() && store.get("P-4").is_some());

        // Retrying the same window is idempotent
        let retry = orch.run_import(&request.clone().with_total_rows_hint(5)).await.unwrap();
        assert_eq!(retry.summary.skipped, 2);
        assert_eq!(store.job_count(), 2);
    }

    #[tokio::test]
    async fn test_run_import_with_hint_skips_probe() {
        let source = source(&["P-1", "P-2"]);
        let orch = orchestrator(source.clone(), Arc::new(InMemoryJobStore::new()), settings(2, 0));

        let request = ImportRequest::new(descriptor(), profile(), dry())
            .window(0, 1)
            .with_total_rows_hint(2);
        let result = orch.run_import(&request).await.unwrap();

        assert_eq!(result.summary.processed, 1);
        // Gate page fetch plus the window fetch, no 1-row probe
        assert_eq!(source.fetch_log(), vec![(0, 3), (0, 1)]);
    }

    #[tokio::test]
    async fn test_check_reports_missing_columns_and_unmapped_engineers() {
        let source = Arc::new(InMemoryRowSource::from_rows(
            &HEADERS,
            &[vec!["P-1", "NEW", "K.Jones", "Jana", "777"]],
        ));
        let orch = orchestrator(source, Arc::new(InMemoryJobStore::new()), settings(2, 0));
        let mut p = profile();
        p.set_column_mapping(InternalField::Postcode, Some("PSC"));

        let report = orch
            .check(&ImportRequest::new(descriptor(), p, dry()))
            .await
            .unwrap();

        assert_eq!(report.total_rows, 1);
        assert_eq!(report.missing_columns, vec!["PSC".to_string()]);
        assert_eq!(report.unmapped_engineers, vec!["K.Jones".to_string()]);
    }

    #[tokio::test]
    async fn test_live_repeat_never_overwrites_first_occurrence() {
        for parallel in [0, 2] {
            let store = Arc::new(InMemoryJobStore::new());
            let orch = orchestrator(named_source(&REPEATED_X), store.clone(), settings(5, parallel));

            let request = ImportRequest::new(descriptor(), profile(), live());
            let result = orch.run(&request, &CollectingProgressSink::new()).await.unwrap();

            assert!(result.success, "parallel={}", parallel);
            assert_eq!(result.summary.inserted, 9, "parallel={}", parallel);
            assert_eq!(result.summary.duplicates, 1, "parallel={}", parallel);
            assert_eq!(store.write_count(), 9, "parallel={}", parallel);
            assert_eq!(client_name(&store, "X").as_deref(), Some("Jana"), "parallel={}", parallel);
        }
    }

    #[tokio::test]
    async fn test_rejected_first_occurrence_frees_id_in_both_modes() {
        for parallel in [0, 2] {
            let store = Arc::new(InMemoryJobStore::new());
            store.fail_next_write_for("X", StoreError::Rejected("postcode invalid".into()));
            let orch = orchestrator(named_source(&REPEATED_X), store.clone(), settings(5, parallel));

            let request = ImportRequest::new(descriptor(), profile(), live());
            let result = orch.run(&request, &CollectingProgressSink::new()).await.unwrap();

            assert_eq!(result.summary.duplicates, 0, "parallel={}", parallel);
            assert_eq!(result.summary.row_error_count(), 1, "parallel={}", parallel);
            assert_eq!(result.summary.errors[0].row, 4);
            assert_eq!(client_name(&store, "X").as_deref(), Some("Impostor"), "parallel={}", parallel);
            assert!(result.summary.is_balanced());
        }
    }

    #[tokio::test]
    async fn test_run_import_windows_share_duplicate_detection() {
        let source = source(&["A", "B", "C", "X", "D", "E", "F", "G", "X", "H"]);
        let orch = orchestrator(source, Arc::new(InMemoryJobStore::new()), settings(100, 0));

        let first = orch
            .run_import(&ImportRequest::new(descriptor(), profile(), dry()).window(0, 5))
            .await
            .unwrap();
        assert_eq!(first.summary.inserted, 5);
        assert_eq!(first.next_start_row, 5);

        let next = ImportRequest::new(descriptor(), profile(), dry())
            .window(0, 5)
            .continuing(&first);
        let second = orch.run_import(&next).await.unwrap();

        assert_eq!(second.run_id, first.run_id);
        assert_eq!(second.summary.inserted, 4);
        assert_eq!(second.summary.duplicates, 1);
        assert_eq!(
            second.summary.preview.skips,
            vec![Decision::Duplicate { row_index: 9, external_id: "X".into(), first_row: Some(4) }]
        );
        assert!(!second.has_more);
        assert_eq!(second.seen_external_ids.len(), 9);

        // Retrying the window ignores claims it made itself
        let mut again = next.clone();
        again.seen_external_ids = second.seen_external_ids.clone();
        let retry = orch.run_import(&again).await.unwrap();
        assert_eq!(retry.summary, second.summary);
    }

    #[tokio::test]
    async fn test_timeout_in_parallel_window_skips_sequential_tail() {
        let source = source(&["P-1", "P-2", "P-3", "P-4", "P-5", "P-6"]);
        let store = Arc::new(InMemoryJobStore::new());
        store.fail_writes_for("P-3", StoreError::Timeout("upsert exceeded 30s".into()));
        let orch = orchestrator(source.clone(), store.clone(), settings(2, 2));
        let sink = CollectingProgressSink::new();

        let request = ImportRequest::new(descriptor(), profile(), live());
        let result = orch.run(&request, &sink).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.summary.inserted, 2);
        assert_eq!(store.job_count(), 2);
        assert!(store.get("P-4").is_none());
        assert!(store.get("P-5").is_none());
        assert!(!source.fetch_log().contains(&(4, 2)));
        assert_eq!(result.next_start_row, 4);
        assert!(result.has_more);
        assert!(result.summary.is_balanced());

        let chunk_errors: Vec<_> = result
            .summary
            .errors
            .iter()
            .filter(|e| e.scope == IssueScope::Chunk)
            .collect();
        assert_eq!(chunk_errors.len(), 1);
        assert_eq!(chunk_errors[0].row, 3);
        assert_eq!(sink.states().last(), Some(&RunState::Failed));
    }

    #[tokio::test]
    async fn test_cancellation_after_parallel_phase_skips_tail() {
        let source = source(&["P-1", "P-2", "P-3", "P-4", "P-5", "P-6"]);
        let store = Arc::new(InMemoryJobStore::new());
        let orch = orchestrator(source, store.clone(), settings(2, 2));

        let owner_id = Uuid::new_v4();
        let request = ImportRequest::new(descriptor(), profile(), live()).owned_by(owner_id);
        let sink = CancelAfter {
            registry: orch.registry().clone(),
            run_id: request.run_id,
            owner_id,
            after_chunk: 2,
        };

        let result = orch.run(&request, &sink).await.unwrap();

        assert!(result.cancelled);
        assert_eq!(result.summary.processed, 4);
        assert_eq!(store.job_count(), 4);
        assert!(store.get("P-5").is_none());
        assert_eq!(result.next_start_row, 4);
        let run_errors: Vec<_> = result
            .summary
            .errors
            .iter()
            .filter(|e| e.scope == IssueScope::Run)
            .collect();
        assert_eq!(run_errors.len(), 1);
        assert_eq!(run_errors[0].row, 5);
        assert_eq!(orch.registry().active_runs(), 0);
    }
}
