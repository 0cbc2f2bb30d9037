//! Sazinka Import - partner job import and reconciliation engine
//!
//! Reads partner exports (delimited text or spreadsheets), translates rows
//! through a per-partner mapping profile and reconciles them against the job
//! store in bounded chunks, with dry-run previews and an engineer gate that
//! blocks writes while any engineer identifier is unresolved.

pub mod cli;
pub mod config;
pub mod error;
pub mod services;
pub mod types;
