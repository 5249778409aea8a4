//! Per-school tally of donors who have given to it.
//!
//! The tally lives in the school's `activeDonors` and is moved by the same
//! statement that writes the school's ledger (see
//! `AccountRepository::apply_school_event`), so the two never disagree.

use serde::{Deserialize, Serialize};

/// How a school-side write affects the donor tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DonorTally {
    /// Count one more donation from this donor.
    Increment { donor_id: String },
    /// List the donor with a count of one if absent; leave an existing count alone.
    EnsureListed { donor_id: String },
}

impl DonorTally {
    pub fn donor_id(&self) -> &str {
        match self {
            DonorTally::Increment { donor_id } | DonorTally::EnsureListed { donor_id } => donor_id,
        }
    }

    /// Amount added to an existing entry. A new entry always starts at one.
    pub fn step(&self) -> u32 {
        match self {
            DonorTally::Increment { .. } => 1,
            DonorTally::EnsureListed { .. } => 0,
        }
    }
}
