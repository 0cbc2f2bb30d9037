//! Internal job record model
//!
//! Closed sets of internal field and status names plus the stored job record
//! the destination store hands back on lookup.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// INTERNAL FIELDS
// =============================================================================

/// Internal job field that a partner column can be mapped onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalField {
    PartnerExternalId,
    PartnerStatus,
    EngineerIdentifier,
    ClientName,
    ClientPhone,
    ClientEmail,
    AddressLine,
    City,
    Postcode,
    SurveyDate,
    InstallDate,
    Notes,
}

impl InternalField {
    pub const ALL: [InternalField; 12] = [
        InternalField::PartnerExternalId,
        InternalField::PartnerStatus,
        InternalField::EngineerIdentifier,
        InternalField::ClientName,
        InternalField::ClientPhone,
        InternalField::ClientEmail,
        InternalField::AddressLine,
        InternalField::City,
        InternalField::Postcode,
        InternalField::SurveyDate,
        InternalField::InstallDate,
        InternalField::Notes,
    ];

    /// Fields that must be mapped before any run is accepted
    pub const REQUIRED: [InternalField; 2] = [
        InternalField::PartnerExternalId,
        InternalField::PartnerStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InternalField::PartnerExternalId => "partner_external_id",
            InternalField::PartnerStatus => "partner_status",
            InternalField::EngineerIdentifier => "engineer_identifier",
            InternalField::ClientName => "client_name",
            InternalField::ClientPhone => "client_phone",
            InternalField::ClientEmail => "client_email",
            InternalField::AddressLine => "address_line",
            InternalField::City => "city",
            InternalField::Postcode => "postcode",
            InternalField::SurveyDate => "survey_date",
            InternalField::InstallDate => "install_date",
            InternalField::Notes => "notes",
        }
    }

    /// Whether the field is carried in `JobRecord::fields` (as opposed to the
    /// key, status and engineer which have dedicated slots)
    pub fn is_payload(&self) -> bool {
        !matches!(
            self,
            InternalField::PartnerExternalId
                | InternalField::PartnerStatus
                | InternalField::EngineerIdentifier
        )
    }

    pub fn is_date(&self) -> bool {
        matches!(self, InternalField::SurveyDate | InternalField::InstallDate)
    }
}

impl fmt::Display for InternalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InternalField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InternalField::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s.trim())
            .ok_or_else(|| format!("Unknown internal field: {}", s))
    }
}

// =============================================================================
// INTERNAL STATUS
// =============================================================================

/// Internal job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalStatus {
    AwaitingSurvey,
    SurveyBooked,
    AwaitingInstallBooking,
    InstallBooked,
    Installed,
    Completed,
    OnHold,
    Cancelled,
}

impl InternalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InternalStatus::AwaitingSurvey => "awaiting_survey",
            InternalStatus::SurveyBooked => "survey_booked",
            InternalStatus::AwaitingInstallBooking => "awaiting_install_booking",
            InternalStatus::InstallBooked => "install_booked",
            InternalStatus::Installed => "installed",
            InternalStatus::Completed => "completed",
            InternalStatus::OnHold => "on_hold",
            InternalStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InternalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InternalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "awaiting_survey" => Ok(InternalStatus::AwaitingSurvey),
            "survey_booked" => Ok(InternalStatus::SurveyBooked),
            "awaiting_install_booking" => Ok(InternalStatus::AwaitingInstallBooking),
            "install_booked" => Ok(InternalStatus::InstallBooked),
            "installed" => Ok(InternalStatus::Installed),
            "completed" => Ok(InternalStatus::Completed),
            "on_hold" => Ok(InternalStatus::OnHold),
            "cancelled" => Ok(InternalStatus::Cancelled),
            _ => Err(format!("Unknown internal status: {}", s)),
        }
    }
}

// =============================================================================
// ENGINEERS & JOB RECORDS
// =============================================================================

/// Internal engineer as listed by the destination store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Engineer {
    pub id: String,
    pub name: String,
}

/// Job record as held by the destination store, keyed by partner external id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub external_id: String,
    /// Untranslated partner status as last imported
    pub partner_status: String,
    pub status: Option<InternalStatus>,
    pub suppress_scheduling: bool,
    pub engineer_id: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<InternalField, String>,
}
