//! Issue export for offline triage
//!
//! Full error and warning lists as flat CSV (`kind,row,external_id,message,data`,
//! with `data` holding the raw row as a JSON object) and the whole run result
//! as JSON.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::types::{ImportRunResult, ImportRunSummary, IssueScope};

#[derive(Debug, Serialize)]
struct IssueRecord<'a> {
    kind: &'static str,
    row: usize,
    external_id: &'a str,
    message: &'a str,
    data: String,
}

fn kind_of(scope: IssueScope) -> &'static str {
    match scope {
        IssueScope::Row => "error",
        IssueScope::Chunk => "chunk_error",
        IssueScope::Run => "run_error",
    }
}

/// Errors first, then warnings, each in source order. Returns the record count.
pub fn write_issues_csv<W: Write>(summary: &ImportRunSummary, writer: W) -> Result<usize> {
    let mut csv = csv::Writer::from_writer(writer);
    let mut written = 0;

    for issue in &summary.errors {
        csv.serialize(IssueRecord {
            kind: kind_of(issue.scope),
            row: issue.row,
            external_id: issue.external_id.as_deref().unwrap_or(""),
            message: &issue.message,
            data: serde_json::to_string(&issue.data)?,
        })?;
        written += 1;
    }

    for warning in &summary.warnings {
        csv.serialize(IssueRecord {
            kind: "warning",
            row: warning.row,
            external_id: warning.external_id.as_deref().unwrap_or(""),
            message: &warning.warning,
            data: serde_json::to_string(&warning.data)?,
        })?;
        written += 1;
    }

    if written == 0 {
        // Keep the header row so empty exports still open as a table
        csv.write_record(["kind", "row", "external_id", "message", "data"])?;
    }

    csv.flush()?;
    Ok(written)
}

pub fn export_issues(summary: &ImportRunSummary, path: &Path) -> Result<usize> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create issue export {}", path.display()))?;
    write_issues_csv(summary, file)
}

pub fn export_result_json(result: &ImportRunResult, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write run result {}", path.display()))?;
    Ok(())
}
