use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DonationRecord, Notification};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Donor,
    School,
    Admin,
}

impl Role {
    /// Convert from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "donor" => Some(Role::Donor),
            "school" => Some(Role::School),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Donor => "donor",
            Role::School => "school",
            Role::Admin => "admin",
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_str(value).ok_or_else(|| format!("Invalid role: {}", value))
    }
}

/// Running tally of one donor's gifts to a school.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDonor {
    pub donor_id: String,
    pub donations_made: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonorProfile {
    pub donations_made: Vec<DonationRecord>,
    pub donation_requests_followed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolProfile {
    pub donations_received: Vec<DonationRecord>,
    pub needs: Vec<String>,
    pub active_donors: Vec<ActiveDonor>,
}

/// Role-specific part of an account document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum AccountKind {
    Donor(DonorProfile),
    School(SchoolProfile),
    Admin,
}

/// An account document with its embedded ledgers and inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(flatten)]
    pub kind: AccountKind,
    pub notifications: Vec<Notification>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped by every write to the row.
    #[serde(skip)]
    pub version: i64,
}

impl Account {
    pub fn role(&self) -> Role {
        match self.kind {
            AccountKind::Donor(_) => Role::Donor,
            AccountKind::School(_) => Role::School,
            AccountKind::Admin => Role::Admin,
        }
    }

    pub fn as_donor(&self) -> Option<&DonorProfile> {
        match &self.kind {
            AccountKind::Donor(profile) => Some(profile),
            _ => None,
        }
    }

    pub fn as_donor_mut(&mut self) -> Option<&mut DonorProfile> {
        match &mut self.kind {
            AccountKind::Donor(profile) => Some(profile),
            _ => None,
        }
    }

    pub fn as_school(&self) -> Option<&SchoolProfile> {
        match &self.kind {
            AccountKind::School(profile) => Some(profile),
            _ => None,
        }
    }

    pub fn as_school_mut(&mut self) -> Option<&mut SchoolProfile> {
        match &mut self.kind {
            AccountKind::School(profile) => Some(profile),
            _ => None,
        }
    }
}

/// Data required to register an account in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccount {
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub needs: Vec<String>,
}
