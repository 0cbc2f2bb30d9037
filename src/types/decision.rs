//! Reconciliation decisions
//!
//! Exactly one decision is produced per source row per run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::InternalStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum Decision {
    #[serde(rename_all = "camelCase")]
    Insert {
        row_index: usize,
        external_id: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        row_index: usize,
        external_id: String,
        reason: String,
        before_status: Option<InternalStatus>,
        after_status: Option<InternalStatus>,
    },
    #[serde(rename_all = "camelCase")]
    Skip {
        row_index: usize,
        external_id: String,
        reason: String,
    },
    /// `first_row` is `None` when the store reported the clash on write
    #[serde(rename_all = "camelCase")]
    Duplicate {
        row_index: usize,
        external_id: String,
        first_row: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        row_index: usize,
        external_id: Option<String>,
        message: String,
        data: BTreeMap<String, String>,
    },
}

impl Decision {
    pub fn row_index(&self) -> usize {
        match self {
            Decision::Insert { row_index, .. }
            | Decision::Update { row_index, .. }
            | Decision::Skip { row_index, .. }
            | Decision::Duplicate { row_index, .. }
            | Decision::Error { row_index, .. } => *row_index,
        }
    }

    pub fn external_id(&self) -> Option<&str> {
        match self {
            Decision::Insert { external_id, .. }
            | Decision::Update { external_id, .. }
            | Decision::Skip { external_id, .. }
            | Decision::Duplicate { external_id, .. } => Some(external_id),
            Decision::Error { external_id, .. } => external_id.as_deref(),
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Decision::Insert { reason, .. }
            | Decision::Update { reason, .. }
            | Decision::Skip { reason, .. } => reason.clone(),
            Decision::Duplicate { first_row: Some(first), .. } => {
                format!("duplicate of row {}", first)
            }
            Decision::Duplicate { first_row: None, .. } => {
                "duplicate: already created by another chunk".to_string()
            }
            Decision::Error { message, .. } => message.clone(),
        }
    }

    /// Insert, Update and Skip are the outcomes that claim an external id
    pub fn claims_external_id(&self) -> bool {
        matches!(
            self,
            Decision::Insert { .. } | Decision::Update { .. } | Decision::Skip { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Insert { .. } => "insert",
            Decision::Update { .. } => "update",
            Decision::Skip { .. } => "skip",
            Decision::Duplicate { .. } => "duplicate",
            Decision::Error { .. } => "error",
        }
    }

    /// Re-tag a claiming decision as a duplicate of an earlier row
    pub fn into_duplicate(self, first_row: Option<usize>) -> Decision {
        match self {
            Decision::Insert { row_index, external_id, .. }
            | Decision::Update { row_index, external_id, .. }
            | Decision::Skip { row_index, external_id, .. }
            | Decision::Duplicate { row_index, external_id, .. } => Decision::Duplicate {
                row_index,
                external_id,
                first_row,
            },
            error @ Decision::Error { .. } => error,
        }
    }
}
