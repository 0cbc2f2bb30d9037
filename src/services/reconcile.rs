//! Reconciliation engine
//!
//! Turns the rows of one window into decisions, in source order:
//!
//! 1. map raw columns onto internal fields (missing key or status => `Error`)
//! 2. translate the partner status (unmapped => warning, status left unset)
//! 3. apply the override rule for the untranslated status
//! 4. resolve the engineer (unmapped identifiers are collected, not fatal)
//! 5. decide `Insert | Update | Skip` against the store
//! 6. settle: repeats of an already claimed external id become `Duplicate`,
//!    live runs write the rest; timeouts/throttling abort the chunk
//!
//! Steps 1-5 (`plan_rows`) only read, so windows can be planned concurrently.
//! Step 6 (`settle_rows`) must see windows one at a time in source order with
//! the run-wide `SeenExternalIds`. An id is claimed only by an Insert, Update
//! or Skip; a row that ends in `Error` leaves the id free for later rows.
//!
//! A row failure never stops the chunk; a transient store failure stops the
//! chunk but keeps everything decided before it.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::error::{ChunkFailure, RowError, StoreError};
use crate::services::job_store::{JobStore, UpsertOutcome, WriteIntent};
use crate::types::{
    ChunkOutcome, ChunkWindow, Decision, InternalField, JobRecord, MappingProfile,
    NormalizedRecord, RowWarning, SeenExternalIds, SourceRow,
};

/// Per-run switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Decide only, never write
    pub dry_run: bool,
    /// Allow `Insert` for external ids the store does not know
    pub create_missing: bool,
    /// Keep decision detail in preview buckets even for live runs
    pub verbose: bool,
}

impl RunOptions {
    pub fn keeps_preview(&self) -> bool {
        self.dry_run || self.verbose
    }
}

// =============================================================================
// PLANNED CHUNK
// =============================================================================

/// Decision for one row plus the write that would carry it out
#[derive(Debug, Clone)]
struct PlannedRow {
    row_index: usize,
    /// Set once the row normalized; only such rows take part in duplicate detection
    external_id: Option<String>,
    decision: Decision,
    write: Option<(JobRecord, WriteIntent)>,
    data: BTreeMap<String, String>,
}

/// A window that has been read and decided but not yet settled
#[derive(Debug, Clone)]
pub struct PlannedChunk {
    outcome: ChunkOutcome,
    rows: Vec<PlannedRow>,
}

impl PlannedChunk {
    fn new(window: ChunkWindow) -> Self {
        Self { outcome: ChunkOutcome::new(window), rows: Vec::new() }
    }

    /// Window that could not be fetched; settles into a failed outcome
    pub fn failed(window: ChunkWindow, failure: ChunkFailure) -> Self {
        Self { outcome: ChunkOutcome::failed(window, failure), rows: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct ReconcileEngine<'a> {
    profile: &'a MappingProfile,
    store: &'a dyn JobStore,
    options: RunOptions,
}

impl<'a> ReconcileEngine<'a> {
    pub fn new(profile: &'a MappingProfile, store: &'a dyn JobStore, options: RunOptions) -> Self {
        Self { profile, store, options }
    }

    /// Plan and settle one window
    pub async fn process_rows(
        &self,
        window: ChunkWindow,
        rows: &[SourceRow],
        seen: &mut SeenExternalIds,
    ) -> ChunkOutcome {
        let planned = self.plan_rows(window, rows, seen).await;
        self.settle_rows(planned, seen).await
    }

    /// Normalize, look up and decide every row of a window without writing.
    /// Ids already in `seen` skip the lookup.
    pub async fn plan_rows(
        &self,
        window: ChunkWindow,
        rows: &[SourceRow],
        seen: &SeenExternalIds,
    ) -> PlannedChunk {
        let mut chunk = PlannedChunk::new(window);
        chunk.outcome.rows_fetched = rows.len();

        for row in rows {
            let record = match self.normalize(row, &mut chunk.outcome.warnings) {
                Ok(record) => record,
                Err(e) => {
                    chunk.rows.push(PlannedRow {
                        row_index: row.row_index,
                        external_id: None,
                        decision: error_decision(row.row_index, self.external_id_of(row), &e, &row.values),
                        write: None,
                        data: BTreeMap::new(),
                    });
                    continue;
                }
            };

            if let (Some(identifier), None) = (&record.engineer_identifier, &record.engineer_id) {
                chunk.outcome.unmapped_engineers.insert(identifier.clone());
            }

            if let Some(first_row) = seen.first_row(&record.external_id) {
                chunk.rows.push(PlannedRow {
                    row_index: record.row_index,
                    external_id: Some(record.external_id.clone()),
                    decision: Decision::Duplicate {
                        row_index: record.row_index,
                        external_id: record.external_id.clone(),
                        first_row: Some(first_row),
                    },
                    write: None,
                    data: BTreeMap::new(),
                });
                continue;
            }

            let existing = match self.store.lookup(&record.external_id).await {
                Ok(existing) => existing,
                Err(e) if e.is_transient() => {
                    warn!(
                        "Lookup of '{}' (row {}) hit transient store error, aborting chunk: {}",
                        record.external_id, row.row_index, e
                    );
                    chunk.outcome.failure = Some(ChunkFailure::Transient {
                        start_row: window.first_row_number(),
                        error: e,
                    });
                    break;
                }
                Err(e) => {
                    let err = RowError::Lookup(e);
                    chunk.rows.push(PlannedRow {
                        row_index: record.row_index,
                        external_id: Some(record.external_id.clone()),
                        decision: error_decision(
                            row.row_index,
                            Some(record.external_id.clone()),
                            &err,
                            &row.values,
                        ),
                        write: None,
                        data: BTreeMap::new(),
                    });
                    continue;
                }
            };

            let mut planned = self.plan(&record, existing.as_ref());
            if planned.write.is_some() {
                planned.data = row.values.clone();
            }
            chunk.rows.push(planned);
        }

        chunk
    }

    /// Resolve duplicates against the run-wide `seen` and, in live runs, write.
    /// Chunks must be settled in source order.
    pub async fn settle_rows(&self, chunk: PlannedChunk, seen: &mut SeenExternalIds) -> ChunkOutcome {
        let PlannedChunk { mut outcome, rows } = chunk;
        let window = outcome.window;

        for planned in rows {
            if let Some(external_id) = &planned.external_id {
                if let Some(first_row) = seen.first_row(external_id) {
                    outcome.decisions.push(Decision::Duplicate {
                        row_index: planned.row_index,
                        external_id: external_id.clone(),
                        first_row: Some(first_row),
                    });
                    continue;
                }
            }

            let row_index = planned.row_index;
            let decision = if self.options.dry_run {
                planned.decision
            } else {
                match self.apply(planned).await {
                    Ok(decision) => decision,
                    Err(e) => {
                        warn!("Write of row {} hit transient store error, aborting chunk: {}", row_index, e);
                        outcome.failure = Some(ChunkFailure::Transient {
                            start_row: window.first_row_number(),
                            error: e,
                        });
                        break;
                    }
                }
            };

            if decision.claims_external_id() {
                if let Some(external_id) = decision.external_id() {
                    seen.record(external_id, decision.row_index());
                }
            }
            outcome.decisions.push(decision);
        }

        debug!(
            "Rows {}..{}: {} decisions, {} warnings{}",
            window.first_row_number(),
            window.end_row(),
            outcome.decisions.len(),
            outcome.warnings.len(),
            if outcome.failure.is_some() { " (aborted)" } else { "" }
        );

        outcome
    }

    // =========================================================================
    // Normalization
    // =========================================================================

    fn value<'r>(&self, row: &'r SourceRow, field: InternalField) -> Option<&'r str> {
        self.profile.column_for(field).and_then(|column| row.get(column))
    }

    fn external_id_of(&self, row: &SourceRow) -> Option<String> {
        self.value(row, InternalField::PartnerExternalId).map(str::to_string)
    }

    /// Translate one row through the mapping profile
    pub fn normalize(
        &self,
        row: &SourceRow,
        warnings: &mut Vec<RowWarning>,
    ) -> Result<NormalizedRecord, RowError> {
        let external_id = self
            .value(row, InternalField::PartnerExternalId)
            .ok_or(RowError::MissingField { field: InternalField::PartnerExternalId })?;
        let partner_status = self
            .value(row, InternalField::PartnerStatus)
            .ok_or(RowError::MissingField { field: InternalField::PartnerStatus })?;

        let mut warn_row = |warning: String| {
            warnings.push(RowWarning {
                row: row.row_index,
                warning,
                external_id: Some(external_id.to_string()),
                data: row.values.clone(),
            });
        };

        let status = self.profile.translate_status(partner_status);
        if status.is_none() {
            warn_row(format!(
                "partner status '{}' has no mapping; internal status left unchanged",
                partner_status
            ));
        }

        let suppress_scheduling = self.profile.suppress_scheduling_for(partner_status);

        let engineer_identifier = self
            .value(row, InternalField::EngineerIdentifier)
            .map(str::to_string);
        let engineer_id = engineer_identifier
            .as_deref()
            .and_then(|identifier| self.profile.resolve_engineer(identifier))
            .map(str::to_string);

        let mut fields = BTreeMap::new();
        for field in InternalField::ALL.into_iter().filter(InternalField::is_payload) {
            let Some(value) = self.value(row, field) else {
                continue;
            };
            if field.is_date() {
                match parse_date(value) {
                    Some(date) => {
                        fields.insert(field, date.to_string());
                    }
                    None => warn_row(format!("{} '{}' is not a valid date; ignored", field, value)),
                }
            } else {
                fields.insert(field, value.to_string());
            }
        }

        Ok(NormalizedRecord {
            row_index: row.row_index,
            external_id: external_id.to_string(),
            partner_status: partner_status.to_string(),
            status,
            suppress_scheduling,
            engineer_identifier,
            engineer_id,
            fields,
        })
    }

    // =========================================================================
    // Decision
    // =========================================================================

    fn plan(&self, record: &NormalizedRecord, existing: Option<&JobRecord>) -> PlannedRow {
        let row_index = record.row_index;
        let external_id = record.external_id.clone();

        let (decision, write) = match existing {
            None if !self.options.create_missing => (
                Decision::Skip {
                    row_index,
                    external_id,
                    reason: "not found, creation disabled".to_string(),
                },
                None,
            ),
            None => {
                let missing = record.missing_contact_fields();
                if missing.is_empty() {
                    (
                        Decision::Insert {
                            row_index,
                            external_id,
                            reason: "new job".to_string(),
                        },
                        Some((record.to_new_job(), WriteIntent::Create)),
                    )
                } else {
                    let names: Vec<&str> = missing.iter().map(InternalField::as_str).collect();
                    (
                        Decision::Skip {
                            row_index,
                            external_id,
                            reason: format!(
                                "not found, missing required contact fields: {}",
                                names.join(", ")
                            ),
                        },
                        None,
                    )
                }
            }
            Some(existing) => {
                let changes = record.changes_against(existing);
                if changes.is_empty() {
                    (
                        Decision::Skip {
                            row_index,
                            external_id,
                            reason: "no change".to_string(),
                        },
                        None,
                    )
                } else {
                    let merged = record.merge_into(existing);
                    (
                        Decision::Update {
                            row_index,
                            external_id,
                            reason: format!("changed: {}", changes.join(", ")),
                            before_status: existing.status,
                            after_status: merged.status,
                        },
                        Some((merged, WriteIntent::Update)),
                    )
                }
            }
        };

        PlannedRow {
            row_index,
            external_id: Some(record.external_id.clone()),
            decision,
            write,
            data: BTreeMap::new(),
        }
    }

    /// Carry out a planned write. Only transient store errors come back as `Err`.
    async fn apply(&self, planned: PlannedRow) -> Result<Decision, StoreError> {
        let Some((job, intent)) = planned.write else {
            return Ok(planned.decision);
        };

        match self.store.upsert(&job, intent).await {
            Ok(UpsertOutcome::Inserted) | Ok(UpsertOutcome::Updated) => Ok(planned.decision),
            Ok(UpsertOutcome::Skipped) => Ok(Decision::Skip {
                row_index: planned.row_index,
                external_id: job.external_id,
                reason: "no change reported by store".to_string(),
            }),
            Err(StoreError::UniqueViolation { .. }) => {
                debug!("'{}' was created concurrently, row {} counted as duplicate", job.external_id, planned.row_index);
                Ok(planned.decision.into_duplicate(None))
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => Ok(error_decision(
                planned.row_index,
                Some(job.external_id),
                &RowError::Apply(e),
                &planned.data,
            )),
        }
    }
}


fn error_decision(
    row_index: usize,
    external_id: Option<String>,
    error: &RowError,
    data: &BTreeMap<String, String>,
) -> Decision {
    Decision::Error {
        row_index,
        external_id,
        message: error.to_string(),
        data: data.clone(),
    }
}

/// Accepts ISO, Czech/German dotted and British slashed day-first dates
fn parse_date(s: &str) -> Option<NaiveDate> {
    ["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(s.trim(), format).ok())
}
