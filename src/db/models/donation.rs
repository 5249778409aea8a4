use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::Status;

/// One logical donation as stored in an account ledger.
///
/// The same record lives twice: in the donor's `donationsMade` (with
/// `school_id`) and in the school's `donationsReceived` (without it, the
/// school is implied by where the record lives). Both copies share `id`,
/// `status` and the gift payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationRecord {
    pub id: String,
    pub donor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school_id: Option<String>,
    #[serde(flatten)]
    pub gift: Gift,
    pub status: Status,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_date: Option<DateTime<Utc>>,
}

/// What was given. Tagged by `type` so `amount` only exists for money and
/// `items` only for item donations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Gift {
    Money {
        amount: f64,
    },
    #[serde(rename_all = "camelCase")]
    Items {
        items: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delivery: Option<Delivery>,
    },
}

impl Gift {
    pub fn kind(&self) -> &'static str {
        match self {
            Gift::Money { .. } => "money",
            Gift::Items { .. } => "items",
        }
    }

    /// Short human description used in notification messages.
    pub fn describe(&self) -> String {
        match self {
            Gift::Money { amount } => format!("{:.2}", amount),
            Gift::Items { items, .. } => items.join(", "),
        }
    }

    /// Compare the value fields, ignoring delivery bookkeeping.
    pub fn same_value(&self, other: &Gift) -> bool {
        match (self, other) {
            (Gift::Money { amount: a }, Gift::Money { amount: b }) => a == b,
            (Gift::Items { items: a, .. }, Gift::Items { items: b, .. }) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub preferred_date: NaiveDate,
    pub status: Status,
}

/// A status change applied to both copies of a donation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub status: Status,
    pub at: DateTime<Utc>,
}

impl DonationRecord {
    /// The copy stored in the school's `donationsReceived`.
    pub fn school_copy(&self) -> DonationRecord {
        DonationRecord {
            school_id: None,
            ..self.clone()
        }
    }

    /// Whether the two copies agree on every field the ledgers must share.
    pub fn matches(&self, other: &DonationRecord) -> bool {
        self.id == other.id
            && self.donor_id == other.donor_id
            && self.status == other.status
            && self.gift.same_value(&other.gift)
    }

    /// The change that produced the current status. `None` while Pending.
    pub fn status_change(&self) -> Option<StatusChange> {
        let at = match self.status {
            Status::Approved => self.approval_date,
            Status::Completed => self.completion_date,
            Status::Pending | Status::Rejected => return None,
        };
        Some(StatusChange {
            status: self.status,
            at: at.unwrap_or(self.date),
        })
    }

    /// Apply a status change, stamping the matching date field.
    pub fn apply(&mut self, change: StatusChange) {
        self.status = change.status;
        match change.status {
            Status::Approved => self.approval_date = Some(change.at),
            Status::Completed => self.completion_date = Some(change.at),
            Status::Pending | Status::Rejected => {}
        }
        if let Gift::Items {
            delivery: Some(delivery),
            ..
        } = &mut self.gift
        {
            delivery.status = change.status;
        }
    }
}

/// Input accepted by the ledger writer when a donor gives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GiftInput {
    Money {
        amount: f64,
    },
    #[serde(rename_all = "camelCase")]
    Items {
        items: Vec<String>,
        preferred_date: Option<String>,
        #[serde(default)]
        address: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDonation {
    pub donor_id: String,
    pub school_id: String,
    #[serde(flatten)]
    pub gift: GiftInput,
}
