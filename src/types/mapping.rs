//! Partner mapping profile
//!
//! Administrator-maintained translation tables between a partner's export and
//! the internal job model. The profile is persisted outside the import core
//! (see `services::profile_store`) and injected into every run.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ImportError;
use super::{Engineer, InternalField, InternalStatus};

/// Column, status and engineer mappings for one partner source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingProfile {
    pub partner_id: String,
    /// Internal field -> source column name
    #[serde(default)]
    pub column_mappings: BTreeMap<InternalField, String>,
    /// Partner status -> internal status
    #[serde(default)]
    pub status_mappings: BTreeMap<String, InternalStatus>,
    /// Partner status -> suppress scheduling
    #[serde(default)]
    pub status_override_rules: BTreeMap<String, bool>,
    /// Partner engineer identifier -> internal engineer id
    #[serde(default)]
    pub engineer_mappings: BTreeMap<String, String>,
}

impl MappingProfile {
    pub fn new(partner_id: impl Into<String>) -> Self {
        Self {
            partner_id: partner_id.into(),
            ..Default::default()
        }
    }

    // =========================================================================
    // Column mappings
    // =========================================================================

    /// Map `field` onto a source column, or remove the mapping with `None`
    pub fn set_column_mapping(&mut self, field: InternalField, column: Option<&str>) {
        match column.map(str::trim).filter(|c| !c.is_empty()) {
            Some(column) => {
                self.column_mappings.insert(field, column.to_string());
            }
            None => {
                self.column_mappings.remove(&field);
            }
        }
    }

    pub fn column_for(&self, field: InternalField) -> Option<&str> {
        self.column_mappings.get(&field).map(String::as_str)
    }

    // =========================================================================
    // Status mappings & override rules
    // =========================================================================

    pub fn add_status_mapping(&mut self, partner_status: &str, status: InternalStatus) {
        self.status_mappings.insert(partner_status.trim().to_string(), status);
    }

    pub fn remove_status_mapping(&mut self, partner_status: &str) -> Option<InternalStatus> {
        self.status_mappings.remove(partner_status.trim())
    }

    pub fn translate_status(&self, partner_status: &str) -> Option<InternalStatus> {
        self.status_mappings.get(partner_status.trim()).copied()
    }

    pub fn add_override_rule(&mut self, partner_status: &str, suppress: bool) {
        self.status_override_rules.insert(partner_status.trim().to_string(), suppress);
    }

    pub fn remove_override_rule(&mut self, partner_status: &str) -> Option<bool> {
        self.status_override_rules.remove(partner_status.trim())
    }

    /// Suppress-scheduling flag for the untranslated partner status, if a rule exists
    pub fn suppress_scheduling_for(&self, partner_status: &str) -> Option<bool> {
        self.status_override_rules.get(partner_status.trim()).copied()
    }

    // =========================================================================
    // Engineer mappings
    // =========================================================================

    pub fn add_engineer_mapping(&mut self, partner_identifier: &str, engineer_id: &str) {
        self.engineer_mappings
            .insert(partner_identifier.trim().to_string(), engineer_id.trim().to_string());
    }

    pub fn remove_engineer_mapping(&mut self, partner_identifier: &str) -> Option<String> {
        self.engineer_mappings.remove(partner_identifier.trim())
    }

    pub fn resolve_engineer(&self, partner_identifier: &str) -> Option<&str> {
        self.engineer_mappings
            .get(partner_identifier.trim())
            .map(String::as_str)
    }

    /// Map every still-unmapped candidate onto the first engineer whose name
    /// contains it, or is contained by it, ignoring case.
    ///
    /// Returns the number of identifiers newly mapped. Candidates without a
    /// match stay unmapped.
    pub fn bulk_auto_match_engineers<S: AsRef<str>>(
        &mut self,
        candidates: &[S],
        engineers: &[Engineer],
    ) -> usize {
        let mut matched = 0;

        for candidate in candidates {
            let identifier = candidate.as_ref().trim();
            if identifier.is_empty() || self.engineer_mappings.contains_key(identifier) {
                continue;
            }

            let needle = identifier.to_lowercase();
            let found = engineers.iter().find(|e| {
                let name = e.name.trim().to_lowercase();
                !name.is_empty() && (name.contains(&needle) || needle.contains(&name))
            });

            if let Some(engineer) = found {
                self.engineer_mappings
                    .insert(identifier.to_string(), engineer.id.clone());
                matched += 1;
            }
        }

        matched
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Fail fast unless the fields every run depends on are mapped
    pub fn ensure_runnable(&self) -> Result<(), ImportError> {
        let missing: Vec<&str> = InternalField::REQUIRED
            .iter()
            .filter(|f| !self.column_mappings.contains_key(f))
            .map(|f| f.as_str())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ImportError::configuration(format!(
                "required fields are not mapped: {}",
                missing.join(", ")
            )))
        }
    }

    /// Structural checks run when an administrator saves the profile
    pub fn validate_for_save(&self) -> Result<(), ImportError> {
        if self.partner_id.trim().is_empty() {
            return Err(ImportError::configuration("partner id must not be empty"));
        }

        let mut columns = HashSet::new();
        for (field, column) in &self.column_mappings {
            let column = column.trim();
            if column.is_empty() {
                return Err(ImportError::configuration(format!(
                    "field '{}' is mapped to an empty column name",
                    field
                )));
            }
            if !columns.insert(column.to_lowercase()) {
                return Err(ImportError::configuration(format!(
                    "column '{}' is mapped to more than one field",
                    column
                )));
            }
        }

        if self.status_mappings.keys().any(|k| k.trim().is_empty())
            || self.status_override_rules.keys().any(|k| k.trim().is_empty())
        {
            return Err(ImportError::configuration("partner status must not be empty"));
        }

        for (identifier, engineer_id) in &self.engineer_mappings {
            if identifier.trim().is_empty() || engineer_id.trim().is_empty() {
                return Err(ImportError::configuration(format!(
                    "engineer mapping '{}' -> '{}' is incomplete",
                    identifier, engineer_id
                )));
            }
        }

        Ok(())
    }
}
