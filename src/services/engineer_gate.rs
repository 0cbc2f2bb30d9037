//! Unmapped-engineer gate
//!
//! Before a run may touch the store, every engineer identifier in the whole
//! source must resolve through the profile. `scan_unmapped_engineers` pages
//! through the source and returns the ones that do not; a non-empty list
//! blocks the run.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ImportError, SourceError};
use crate::services::job_store::JobStore;
use crate::services::row_source::{RowSource, SourceDescriptor};
use crate::types::{InternalField, MappingProfile};

/// Sorted, unique engineer identifiers without a mapping, across the entire source
pub async fn scan_unmapped_engineers(
    source: &dyn RowSource,
    descriptor: &SourceDescriptor,
    profile: &MappingProfile,
    page_size: usize,
) -> Result<Vec<String>, SourceError> {
    let Some(column) = profile.column_for(InternalField::EngineerIdentifier) else {
        debug!("Engineer column not mapped, gate has nothing to check");
        return Ok(Vec::new());
    };

    let page_size = page_size.max(1);
    let mut unmapped = BTreeSet::new();
    let mut start_row = 0;
    let mut pages = 0;

    loop {
        let window = source.fetch(descriptor, start_row, page_size).await?;
        pages += 1;

        for row in window.source_rows() {
            if let Some(identifier) = row.get(column) {
                if profile.resolve_engineer(identifier).is_none() {
                    unmapped.insert(identifier.to_string());
                }
            }
        }

        start_row += window.rows.len();
        if window.rows.is_empty() || start_row >= window.total_rows {
            break;
        }
    }

    debug!(
        "Gate scanned {} rows in {} pages: {} unmapped engineers",
        start_row,
        pages,
        unmapped.len()
    );

    Ok(unmapped.into_iter().collect())
}

// =============================================================================
// AUTO-MATCH
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoMatchReport {
    /// Identifiers newly mapped by this call
    pub matched: usize,
    pub still_unmapped: Vec<String>,
    pub engineers_available: usize,
}

/// Scan the source and map every unmapped identifier whose text matches an
/// engineer name. The caller persists the profile.
pub async fn auto_match_engineers(
    source: &dyn RowSource,
    descriptor: &SourceDescriptor,
    profile: &mut MappingProfile,
    store: &dyn JobStore,
    page_size: usize,
) -> Result<AutoMatchReport, ImportError> {
    let unmapped = scan_unmapped_engineers(source, descriptor, profile, page_size).await?;
    if unmapped.is_empty() {
        return Ok(AutoMatchReport::default());
    }

    let engineers = store.list_engineers().await?;
    let matched = profile.bulk_auto_match_engineers(unmapped.as_slice(), &engineers);
    let still_unmapped: Vec<String> = unmapped
        .into_iter()
        .filter(|identifier| profile.resolve_engineer(identifier).is_none())
        .collect();

    info!(
        "Auto-matched {} engineer identifiers for partner {}, {} still unmapped",
        matched,
        profile.partner_id,
        still_unmapped.len()
    );

    Ok(AutoMatchReport {
        matched,
        still_unmapped,
        engineers_available: engineers.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::job_store::InMemoryJobStore;
    use crate::services::row_source::InMemoryRowSource;
    use crate::types::Engineer;

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor::Memory { name: "gate".into() }
    }

    fn profile() -> MappingProfile {
        let mut p = MappingProfile::new("acme");
        p.set_column_mapping(InternalField::PartnerExternalId, Some("Ref"));
        p.set_column_mapping(InternalField::PartnerStatus, Some("Status"));
        p.set_column_mapping(InternalField::EngineerIdentifier, Some("Engineer"));
        p.add_engineer_mapping("A.Brown", "eng-2");
        p
    }

    fn source() -> InMemoryRowSource {
        InMemoryRowSource::from_rows(
            &["Ref", "Status", "Engineer"],
            &[
                vec!["1", "NEW", "J.Smith"],
                vec!["2", "NEW", "A.Brown"],
                vec!["3", "NEW", ""],
                vec!["4", "NEW", "K.Jones"],
                vec!["5", "NEW", "J.Smith"],
            ],
        )
    }

    #[tokio::test]
    async fn test_scan_covers_every_page() {
        let source = source();
        let unmapped = scan_unmapped_engineers(&source, &descriptor(), &profile(), 2)
            .await
            .unwrap();

        assert_eq!(unmapped, vec!["J.Smith".to_string(), "K.Jones".to_string()]);
        assert_eq!(source.fetch_log(), vec![(0, 2), (2, 2), (4, 2)]);
    }

    #[tokio::test]
    async fn test_scan_without_engineer_column_is_empty() {
        let source = source();
        let mut p = profile();
        p.set_column_mapping(InternalField::EngineerIdentifier, None);

        let unmapped = scan_unmapped_engineers(&source, &descriptor(), &p, 2).await.unwrap();

        assert!(unmapped.is_empty());
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_scan_propagates_source_failure() {
        let source = source();
        source.fail_window(2, SourceError::AccessDenied { location: "sheet".into() });

        let err = scan_unmapped_engineers(&source, &descriptor(), &profile(), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn test_auto_match_maps_by_name() {
        let source = source();
        let store = InMemoryJobStore::with_engineers(vec![
            Engineer { id: "eng-1".into(), name: "J.Smith (North)".into() },
            Engineer { id: "eng-2".into(), name: "Anna Brown".into() },
        ]);
        let mut p = profile();

        let report = auto_match_engineers(&source, &descriptor(), &mut p, &store, 10)
            .await
            .unwrap();

        assert_eq!(report.matched, 1);
        assert_eq!(report.still_unmapped, vec!["K.Jones".to_string()]);
        assert_eq!(report.engineers_available, 2);
        assert_eq!(p.resolve_engineer("J.Smith"), Some("eng-1"));
    }
}
