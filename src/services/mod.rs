//! Import services

pub mod aggregator;
pub mod cancellation;
pub mod engineer_gate;
pub mod export;
pub mod job_store;
pub mod orchestrator;
pub mod profile_store;
pub mod progress;
pub mod reconcile;
pub mod row_source;
