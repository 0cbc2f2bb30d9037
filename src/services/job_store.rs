//! Destination job store abstraction
//!
//! The store is the single source of truth for jobs. `JobStore` is the seam
//! the reconciliation engine talks to; `InMemoryJobStore` backs the CLI (via a
//! JSON snapshot file) and every test.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::types::{Engineer, JobRecord};

/// How a record should be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIntent {
    /// Must not exist yet; an existing id is a `UniqueViolation`
    Create,
    /// Replace the stored record with the same external id
    Update,
}

/// What the store actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Skipped,
}

/// Job store trait - lookup and idempotent upsert keyed by external id
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn lookup(&self, external_id: &str) -> Result<Option<JobRecord>, StoreError>;

    async fn upsert(&self, record: &JobRecord, intent: WriteIntent) -> Result<UpsertOutcome, StoreError>;

    async fn list_engineers(&self) -> Result<Vec<Engineer>, StoreError>;
}

// =============================================================================
// InMemoryJobStore
// =============================================================================

/// Serializable contents of an in-memory store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    #[serde(default)]
    pub engineers: Vec<Engineer>,
    #[serde(default)]
    pub jobs: Vec<JobRecord>,
}

/// Job store held in memory, with fault injection for tests
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<String, JobRecord>>,
    engineers: Mutex<Vec<Engineer>>,
    write_faults: Mutex<HashMap<String, StoreError>>,
    one_shot_write_faults: Mutex<HashMap<String, StoreError>>,
    lookup_faults: Mutex<HashMap<String, StoreError>>,
    writes: AtomicUsize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engineers(engineers: Vec<Engineer>) -> Self {
        let store = Self::new();
        *store.engineers.lock() = engineers;
        store
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::with_engineers(snapshot.engineers);
        {
            let mut jobs = store.jobs.lock();
            for job in snapshot.jobs {
                jobs.insert(job.external_id.clone(), job);
            }
        }
        store
    }

    /// Load a JSON snapshot; a missing file yields an empty store
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Store snapshot {} not found, starting empty", path.display());
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read store snapshot {}", path.display()))?;
        let snapshot: StoreSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Invalid store snapshot {}", path.display()))?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write store snapshot {}", path.display()))?;
        Ok(())
    }

    /// Jobs sorted by external id
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut jobs: Vec<JobRecord> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        StoreSnapshot {
            engineers: self.engineers.lock().clone(),
            jobs,
        }
    }

    pub fn insert_job(&self, record: JobRecord) {
        self.jobs.lock().insert(record.external_id.clone(), record);
    }

    pub fn get(&self, external_id: &str) -> Option<JobRecord> {
        self.jobs.lock().get(external_id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make writes for `external_id` fail with `error`
    pub fn fail_writes_for(&self, external_id: &str, error: StoreError) {
        self.write_faults.lock().insert(external_id.to_string(), error);
    }

    /// Make only the next write for `external_id` fail with `error`
    pub fn fail_next_write_for(&self, external_id: &str, error: StoreError) {
        self.one_shot_write_faults.lock().insert(external_id.to_string(), error);
    }

    /// Make lookups for `external_id` fail with `error`
    pub fn fail_lookups_for(&self, external_id: &str, error: StoreError) {
        self.lookup_faults.lock().insert(external_id.to_string(), error);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn lookup(&self, external_id: &str) -> Result<Option<JobRecord>, StoreError> {
        if let Some(error) = self.lookup_faults.lock().get(external_id).cloned() {
            return Err(error);
        }
        Ok(self.jobs.lock().get(external_id).cloned())
    }

    async fn upsert(&self, record: &JobRecord, intent: WriteIntent) -> Result<UpsertOutcome, StoreError> {
        if let Some(error) = self.one_shot_write_faults.lock().remove(&record.external_id) {
            return Err(error);
        }
        if let Some(error) = self.write_faults.lock().get(&record.external_id).cloned() {
            return Err(error);
        }

        let mut jobs = self.jobs.lock();
        let outcome = match (jobs.get(&record.external_id), intent) {
            (Some(_), WriteIntent::Create) => {
                return Err(StoreError::UniqueViolation {
                    external_id: record.external_id.clone(),
                });
            }
            (Some(existing), WriteIntent::Update) if existing == record => UpsertOutcome::Skipped,
            (Some(_), WriteIntent::Update) => UpsertOutcome::Updated,
            (None, _) => UpsertOutcome::Inserted,
        };

        if outcome != UpsertOutcome::Skipped {
            jobs.insert(record.external_id.clone(), record.clone());
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    async fn list_engineers(&self) -> Result<Vec<Engineer>, StoreError> {
        Ok(self.engineers.lock().clone())
    }
}
