//! Source rows, normalized records and chunk windows

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{InternalField, InternalStatus, JobRecord};

// =============================================================================
// ROW WINDOWS (row source contract)
// =============================================================================

/// One fetch from a row source: a window of raw rows plus the source size
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowWindow {
    pub headers: Vec<String>,
    /// 0-based offset of `rows[0]` among the data rows
    pub start_row: usize,
    pub rows: Vec<Vec<String>>,
    pub total_rows: usize,
}

impl RowWindow {
    /// Pair each raw row with the headers, numbering rows from 1
    pub fn source_rows(&self) -> Vec<SourceRow> {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, cells)| SourceRow::from_cells(self.start_row + i + 1, &self.headers, cells))
            .collect()
    }

    pub fn has_column(&self, column: &str) -> bool {
        let column = column.trim();
        self.headers.iter().any(|h| h.trim().eq_ignore_ascii_case(column))
    }
}

/// Raw source row keyed by column name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRow {
    /// 1-based, stable across repeated fetches of the same source
    pub row_index: usize,
    pub values: BTreeMap<String, String>,
}

impl SourceRow {
    pub fn from_cells(row_index: usize, headers: &[String], cells: &[String]) -> Self {
        let values = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.trim().is_empty())
            .map(|(i, h)| {
                let value = cells.get(i).cloned().unwrap_or_default();
                (h.trim().to_string(), value)
            })
            .collect();
        Self { row_index, values }
    }

    /// Trimmed, non-empty value of `column` (header match ignores ASCII case)
    pub fn get(&self, column: &str) -> Option<&str> {
        let column = column.trim();
        self.values
            .iter()
            .find(|(h, _)| h.eq_ignore_ascii_case(column))
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    }
}

// =============================================================================
// NORMALIZED RECORDS
// =============================================================================

/// A source row translated through the mapping profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRecord {
    pub row_index: usize,
    pub external_id: String,
    pub partner_status: String,
    /// `None` when the partner status has no mapping
    pub status: Option<InternalStatus>,
    /// `None` when no override rule matches the partner status
    pub suppress_scheduling: Option<bool>,
    pub engineer_identifier: Option<String>,
    /// `None` when there is no identifier or it has no mapping
    pub engineer_id: Option<String>,
    pub fields: BTreeMap<InternalField, String>,
}

impl NormalizedRecord {
    pub fn field(&self, field: InternalField) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    /// `client_name` plus a phone number or e-mail address
    pub fn missing_contact_fields(&self) -> Vec<InternalField> {
        let mut missing = Vec::new();
        if self.field(InternalField::ClientName).is_none() {
            missing.push(InternalField::ClientName);
        }
        if self.field(InternalField::ClientPhone).is_none()
            && self.field(InternalField::ClientEmail).is_none()
        {
            missing.push(InternalField::ClientPhone);
            missing.push(InternalField::ClientEmail);
        }
        missing
    }

    pub fn to_new_job(&self) -> JobRecord {
        JobRecord {
            external_id: self.external_id.clone(),
            partner_status: self.partner_status.clone(),
            status: self.status,
            suppress_scheduling: self.suppress_scheduling.unwrap_or(false),
            engineer_id: self.engineer_id.clone(),
            fields: self.fields.clone(),
        }
    }

    /// Names of everything this record would change on `existing`.
    ///
    /// Unresolved status, missing override, unresolved engineer and empty
    /// cells never count as changes.
    pub fn changes_against(&self, existing: &JobRecord) -> Vec<&'static str> {
        let mut changes = Vec::new();

        if self.status.is_some() && self.status != existing.status {
            changes.push("status");
        }
        if let Some(suppress) = self.suppress_scheduling {
            if suppress != existing.suppress_scheduling {
                changes.push("suppress_scheduling");
            }
        }
        if self.engineer_id.is_some() && self.engineer_id != existing.engineer_id {
            changes.push("engineer");
        }
        for (field, value) in &self.fields {
            if existing.fields.get(field) != Some(value) {
                changes.push(field.as_str());
            }
        }

        changes
    }

    /// `existing` with this record's supplied values laid over it
    pub fn merge_into(&self, existing: &JobRecord) -> JobRecord {
        let mut merged = existing.clone();
        merged.partner_status = self.partner_status.clone();
        if self.status.is_some() {
            merged.status = self.status;
        }
        if let Some(suppress) = self.suppress_scheduling {
            merged.suppress_scheduling = suppress;
        }
        if self.engineer_id.is_some() {
            merged.engineer_id = self.engineer_id.clone();
        }
        for (field, value) in &self.fields {
            merged.fields.insert(*field, value.clone());
        }
        merged
    }
}

// =============================================================================
// CHUNK WINDOWS
// =============================================================================

/// A bounded, disjoint range of data rows processed as one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkWindow {
    /// 0-based offset of the first row
    pub start_row: usize,
    pub size: usize,
    pub total_rows: usize,
}

impl ChunkWindow {
    pub fn new(start_row: usize, size: usize, total_rows: usize) -> Self {
        Self { start_row, size, total_rows }
    }

    /// Exclusive end, clamped to the source size
    pub fn end_row(&self) -> usize {
        self.start_row.saturating_add(self.size).min(self.total_rows)
    }

    pub fn next_start_row(&self) -> usize {
        self.end_row().max(self.start_row)
    }

    pub fn has_more(&self) -> bool {
        self.next_start_row() < self.total_rows
    }

    pub fn len(&self) -> usize {
        self.end_row().saturating_sub(self.start_row)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 1-based number of the first row, as shown to users
    pub fn first_row_number(&self) -> usize {
        self.start_row + 1
    }

    /// Disjoint windows covering `[start_row, total_rows)` in order
    pub fn plan(start_row: usize, total_rows: usize, size: usize) -> Vec<ChunkWindow> {
        if size == 0 {
            return Vec::new();
        }
        (start_row..total_rows)
            .step_by(size)
            .map(|start| ChunkWindow::new(start, size, total_rows))
            .collect()
    }

    pub fn count(total_rows: usize, size: usize) -> usize {
        if size == 0 {
            0
        } else {
            total_rows.div_ceil(size)
        }
    }
}
