use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Status;

/// A donation need posted by a school, with the donors' responses embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationRequest {
    pub id: String,
    pub school_id: String,
    /// First donor who responded; receives the request's transition notices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub donor_id: Option<String>,
    pub donation_needs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_request: Option<String>,
    pub status: Status,
    pub donors: Vec<DonorResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_approval_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_completion_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_rejection_date: Option<DateTime<Utc>>,
    pub date: DateTime<Utc>,
    #[serde(skip)]
    pub version: i64,
}

impl DonationRequest {
    /// Needs joined for human-readable messages.
    pub fn needs_label(&self) -> String {
        let mut label = self.donation_needs.join(", ");
        if let Some(custom) = self.custom_request.as_deref() {
            if !custom.is_empty() {
                if !label.is_empty() {
                    label.push_str("; ");
                }
                label.push_str(custom);
            }
        }
        label
    }
}

/// One donor's entry in a request's response sub-ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonorResponse {
    pub donor_id: String,
    pub status: Status,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDonationRequest {
    pub school_id: String,
    pub donation_needs: Vec<String>,
    #[serde(default)]
    pub custom_request: Option<String>,
}

/// Filters used by reporting reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationRequestFilter {
    pub school_id: Option<String>,
    pub status: Option<Status>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}
