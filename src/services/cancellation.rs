//! Cancellation registry for import runs
//!
//! Cooperative, chunk-granular cancellation. A run registers itself under its
//! `run_id` together with the operator that started it; only that operator may
//! cancel. The orchestrator polls `is_cancelled` between chunks, never inside
//! one, so a cancelled run still reports every chunk it finished.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Process-wide registry used by the binary
pub static CANCELLATION: Lazy<CancellationRegistry> = Lazy::new(CancellationRegistry::default);

struct RunEntry {
    token: CancellationToken,
    owner_id: Uuid,
}

/// Keeps a run registered; dropping it removes the run from the registry
pub struct RunGuard {
    run_id: Uuid,
    token: CancellationToken,
    registry: CancellationRegistry,
}

impl RunGuard {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Token for this run, e.g. to wire a Ctrl-C handler
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.run_id);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("run {0} belongs to another operator")]
    NotOwner(Uuid),
}

#[derive(Clone, Default)]
pub struct CancellationRegistry {
    runs: Arc<Mutex<HashMap<Uuid, RunEntry>>>,
}

impl CancellationRegistry {
    /// Register a run. A run cancelled before it started stays cancelled.
    pub fn register(&self, run_id: Uuid, owner_id: Uuid) -> RunGuard {
        let token = {
            let mut runs = self.runs.lock();
            let entry = runs.entry(run_id).or_insert_with(|| RunEntry {
                token: CancellationToken::new(),
                owner_id,
            });
            entry.token.clone()
        };
        RunGuard {
            run_id,
            token,
            registry: self.clone(),
        }
    }

    /// `Ok(true)` if cancelled, `Ok(false)` if no such run is active
    pub fn cancel(&self, run_id: &Uuid, caller_id: Uuid) -> Result<bool, CancelError> {
        let runs = self.runs.lock();
        match runs.get(run_id) {
            Some(entry) if entry.owner_id != caller_id => Err(CancelError::NotOwner(*run_id)),
            Some(entry) => {
                entry.token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Mark a run cancelled before it is registered
    pub fn pre_cancel(&self, run_id: Uuid, caller_id: Uuid) {
        let token = CancellationToken::new();
        token.cancel();
        self.runs.lock().insert(run_id, RunEntry { token, owner_id: caller_id });
    }

    pub fn is_cancelled(&self, run_id: &Uuid) -> bool {
        self.runs
            .lock()
            .get(run_id)
            .is_some_and(|e| e.token.is_cancelled())
    }

    pub fn active_runs(&self) -> usize {
        self.runs.lock().len()
    }

    fn remove(&self, run_id: &Uuid) {
        self.runs.lock().remove(run_id);
    }
}
