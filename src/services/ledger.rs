//! Dual-ledger writer.
//!
//! Every donation is stored twice: in the donor's `donationsMade` and in the
//! school's `donationsReceived`. The store only guarantees atomicity inside
//! one account document, so each change is two writes in a fixed order:
//!
//! 1. the donor copy (authoritative, used for all later lookups);
//! 2. the school copy.
//!
//! A failure in step 1 leaves nothing behind. A failure (or timeout) in step
//! 2 is returned as `AppError::PartialLedgerWrite` carrying a
//! [`LedgerRepair`] that re-applies step 2 alone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::db::{
    Account, AccountRepository, CreateDonation, Delivery, DonationRecord, Gift, GiftInput, Role,
    Status, StatusChange,
};
use crate::error::{AppError, AppResult};
use crate::services::active_donors::DonorTally;

/// Everything the school document must absorb for one event, applied as a
/// single document write.
///
/// `event_id` keys the write: the donation id when a record is carried,
/// otherwise an id naming the request response. A school absorbs each key
/// at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolWrite {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<DonationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tally: Option<DonorTally>,
}

/// The missing half of a dual write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LedgerRepair {
    ApplySchoolWrite {
        school_id: String,
        write: SchoolWrite,
    },
    SetSchoolStatus {
        school_id: String,
        donation_id: String,
        change: StatusChange,
    },
}

impl LedgerRepair {
    pub fn describe(&self) -> String {
        match self {
            LedgerRepair::ApplySchoolWrite { school_id, write } => match &write.received {
                Some(record) => format!("append of {} to school {}", record.id, school_id),
                None => format!("donor tally update on school {}", school_id),
            },
            LedgerRepair::SetSchoolStatus {
                school_id,
                donation_id,
                change,
            } => format!(
                "status {} for {} on school {}",
                change.status, donation_id, school_id
            ),
        }
    }
}

/// Storage operations the ledger writer needs, each confined to one account
/// document.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    async fn load_account(&self, id: &str) -> AppResult<Option<Account>>;

    async fn find_donor_of_donation(&self, donation_id: &str) -> AppResult<Option<String>>;

    async fn append_donor_copy(&self, donor_id: &str, record: &DonationRecord) -> AppResult<()>;

    /// Move the donor copy to `change.status`, re-checking the transition
    /// against the stored state.
    async fn set_donor_status(
        &self,
        donor_id: &str,
        donation_id: &str,
        change: StatusChange,
    ) -> AppResult<DonationRecord>;

    async fn remove_donor_copy(&self, donor_id: &str, donation_id: &str)
        -> AppResult<DonationRecord>;

    /// Apply a school write once per `event_id`. A replay changes nothing,
    /// except that a carried record may still move the stored copy forward.
    async fn apply_school_write(&self, school_id: &str, write: &SchoolWrite) -> AppResult<()>;

    /// Move the school copy forward to `change.status`. A change that already
    /// holds, or that the transition table does not allow from the stored
    /// status, leaves the copy as it is. `NotFound` when the copy is absent.
    async fn set_school_status(
        &self,
        school_id: &str,
        donation_id: &str,
        change: StatusChange,
    ) -> AppResult<DonationRecord>;
}

pub struct SqliteLedgerStore {
    pool: SqlitePool,
    max_attempts: u32,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool, max_attempts: u32) -> Self {
        Self { pool, max_attempts }
    }
}

const MISSING_DONATION: &str = "Donation not found";

fn donation_not_found(donation_id: &str) -> AppError {
    AppError::NotFound(format!("{}: {}", MISSING_DONATION, donation_id))
}

fn is_missing_donation(err: &AppError) -> bool {
    matches!(err, AppError::NotFound(msg) if msg.starts_with(MISSING_DONATION))
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn load_account(&self, id: &str) -> AppResult<Option<Account>> {
        AccountRepository::find_by_id(&self.pool, id).await
    }

    async fn find_donor_of_donation(&self, donation_id: &str) -> AppResult<Option<String>> {
        AccountRepository::find_donor_of_donation(&self.pool, donation_id).await
    }

    async fn append_donor_copy(&self, donor_id: &str, record: &DonationRecord) -> AppResult<()> {
        if AccountRepository::append_donation_made(&self.pool, donor_id, record).await? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("Donor not found: {}", donor_id)))
        }
    }

    async fn set_donor_status(
        &self,
        donor_id: &str,
        donation_id: &str,
        change: StatusChange,
    ) -> AppResult<DonationRecord> {
        let (_, record) =
            AccountRepository::modify(&self.pool, donor_id, self.max_attempts, |account| {
                let profile = account
                    .as_donor_mut()
                    .ok_or_else(|| AppError::NotFound(format!("Donor not found: {}", donor_id)))?;
                let record = profile
                    .donations_made
                    .iter_mut()
                    .find(|r| r.id == donation_id)
                    .ok_or_else(|| donation_not_found(donation_id))?;
                if !Status::donation_transition_allowed(record.status, change.status) {
                    return Err(AppError::InvalidTransition {
                        from: record.status,
                        to: change.status,
                    });
                }
                record.apply(change);
                Ok(record.clone())
            })
            .await?;
        Ok(record)
    }

    async fn remove_donor_copy(
        &self,
        donor_id: &str,
        donation_id: &str,
    ) -> AppResult<DonationRecord> {
        let (_, removed) =
            AccountRepository::modify(&self.pool, donor_id, self.max_attempts, |account| {
                let profile = account
                    .as_donor_mut()
                    .ok_or_else(|| AppError::NotFound(format!("Donor not found: {}", donor_id)))?;
                let idx = profile
                    .donations_made
                    .iter()
                    .position(|r| r.id == donation_id)
                    .ok_or_else(|| donation_not_found(donation_id))?;
                Ok(profile.donations_made.remove(idx))
            })
            .await?;
        Ok(removed)
    }

    async fn apply_school_write(&self, school_id: &str, write: &SchoolWrite) -> AppResult<()> {
        let copy = write.received.as_ref().map(DonationRecord::school_copy);
        let tally = write.tally.as_ref().map(|t| (t.donor_id(), t.step()));
        if AccountRepository::apply_school_event(
            &self.pool,
            school_id,
            &write.event_id,
            copy.as_ref(),
            tally,
        )
        .await?
        {
            return Ok(());
        }

        tracing::debug!(
            "School {} already absorbed {}; skipping",
            school_id,
            write.event_id
        );
        if let Some(record) = &copy {
            if let Some(change) = record.status_change() {
                self.set_school_status(school_id, &record.id, change).await?;
            }
        }
        Ok(())
    }

    async fn set_school_status(
        &self,
        school_id: &str,
        donation_id: &str,
        change: StatusChange,
    ) -> AppResult<DonationRecord> {
        AccountRepository::update_donation_received(
            &self.pool,
            school_id,
            donation_id,
            self.max_attempts,
            |record| {
                if record.status == change.status {
                    return Ok(false);
                }
                if !Status::donation_transition_allowed(record.status, change.status) {
                    tracing::warn!(
                        "Ignoring stale {} for {} on school {}: copy is already {}",
                        change.status,
                        donation_id,
                        school_id,
                        record.status
                    );
                    return Ok(false);
                }
                record.apply(change);
                Ok(true)
            },
        )
        .await?
        .ok_or_else(|| donation_not_found(donation_id))
    }
}

/// Parse a preferred delivery date given as `YYYY-MM-DD` or RFC 3339.
pub fn parse_preferred_date(raw: &str) -> AppResult<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .map_err(|_| AppError::Validation(format!("Invalid preferred date: {}", raw)))
}

/// Turn the caller's gift into a stored gift and its initial status.
///
/// Money is treated as paid on submission and starts `Completed`; items wait
/// for delivery and start `Pending`.
fn validate_gift(input: &GiftInput, today: NaiveDate) -> AppResult<(Gift, Status)> {
    match input {
        GiftInput::Money { amount } => {
            if !amount.is_finite() || *amount <= 0.0 {
                return Err(AppError::Validation(
                    "Amount must be a positive number".to_string(),
                ));
            }
            Ok((Gift::Money { amount: *amount }, Status::Completed))
        }
        GiftInput::Items {
            items,
            preferred_date,
            address,
        } => {
            if items.is_empty() {
                return Err(AppError::Validation(
                    "At least one item is required".to_string(),
                ));
            }
            let items: Vec<String> = items.iter().map(|i| i.trim().to_string()).collect();
            if items.iter().any(|i| i.is_empty()) {
                return Err(AppError::Validation(
                    "Item names cannot be blank".to_string(),
                ));
            }
            let raw_date = preferred_date
                .as_deref()
                .ok_or_else(|| AppError::Validation("Preferred date is required".to_string()))?;
            let preferred_date = parse_preferred_date(raw_date)?;
            if preferred_date < today {
                return Err(AppError::Validation(
                    "Preferred date cannot be in the past".to_string(),
                ));
            }
            let address = address
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string);

            Ok((
                Gift::Items {
                    items,
                    delivery: Some(Delivery {
                        address,
                        preferred_date,
                        status: Status::Pending,
                    }),
                },
                Status::Pending,
            ))
        }
    }
}

pub struct LedgerWriter {
    store: Arc<dyn LedgerStore>,
    write_timeout: Duration,
}

impl LedgerWriter {
    pub fn new(store: Arc<dyn LedgerStore>, config: &LedgerConfig) -> Self {
        Self {
            store,
            write_timeout: Duration::from_millis(config.write_timeout_ms),
        }
    }

    async fn require_role(&self, id: &str, role: Role) -> AppResult<Account> {
        match self.store.load_account(id).await? {
            Some(account) if account.role() == role => Ok(account),
            Some(_) | None => Err(AppError::NotFound(format!(
                "{} not found: {}",
                match role {
                    Role::Donor => "Donor",
                    Role::School => "School",
                    Role::Admin => "Admin",
                },
                id
            ))),
        }
    }

    /// Run the second half of a dual write under the write deadline.
    async fn run_school_half(&self, repair: &LedgerRepair) -> AppResult<()> {
        match tokio::time::timeout(self.write_timeout, self.apply_repair(repair)).await {
            Ok(res) => res,
            Err(_) => Err(AppError::Internal(anyhow::anyhow!(
                "school write timed out after {:?}",
                self.write_timeout
            ))),
        }
    }

    fn diverged(reference_id: &str, repair: LedgerRepair, err: &AppError) -> AppError {
        tracing::error!(
            "School half of {} failed, ledgers diverge until repaired: {}",
            reference_id,
            err
        );
        AppError::partial(reference_id, repair, err)
    }

    /// Second half of every dual write. Failure or timeout becomes a partial
    /// write error carrying `repair`.
    pub(crate) async fn finish_on_school(
        &self,
        reference_id: &str,
        repair: LedgerRepair,
    ) -> AppResult<()> {
        match self.run_school_half(&repair).await {
            Ok(()) => Ok(()),
            Err(e) => Err(Self::diverged(reference_id, repair, &e)),
        }
    }

    async fn apply_repair(&self, repair: &LedgerRepair) -> AppResult<()> {
        match repair {
            LedgerRepair::ApplySchoolWrite { school_id, write } => {
                self.store.apply_school_write(school_id, write).await
            }
            LedgerRepair::SetSchoolStatus {
                school_id,
                donation_id,
                change,
            } => self
                .store
                .set_school_status(school_id, donation_id, *change)
                .await
                .map(|_| ()),
        }
    }

    /// Re-apply only the missing half of an earlier partial write.
    ///
    /// Safe to call more than once, and safe to call late: a school write is
    /// absorbed once per event key, and a status change never moves the
    /// school copy backwards.
    pub async fn repair(&self, repair: &LedgerRepair) -> AppResult<()> {
        self.apply_repair(repair).await?;
        tracing::info!("Applied ledger repair: {}", repair.describe());
        Ok(())
    }

    /// Record a new donation on both ledgers and return the donor-side copy.
    pub async fn create_donation(&self, input: CreateDonation) -> AppResult<DonationRecord> {
        if input.donor_id.trim().is_empty() {
            return Err(AppError::Validation("donorId is required".to_string()));
        }
        if input.school_id.trim().is_empty() {
            return Err(AppError::Validation("schoolId is required".to_string()));
        }

        let now = Utc::now();
        let (gift, status) = validate_gift(&input.gift, now.date_naive())?;

        self.require_role(&input.donor_id, Role::Donor).await?;
        self.require_role(&input.school_id, Role::School).await?;

        let record = DonationRecord {
            id: Uuid::new_v4().to_string(),
            donor_id: input.donor_id.clone(),
            school_id: Some(input.school_id.clone()),
            gift,
            status,
            date: now,
            approval_date: None,
            completion_date: (status == Status::Completed).then_some(now),
        };

        self.store
            .append_donor_copy(&input.donor_id, &record)
            .await?;

        self.finish_on_school(
            &record.id,
            LedgerRepair::ApplySchoolWrite {
                school_id: input.school_id.clone(),
                write: SchoolWrite {
                    event_id: record.id.clone(),
                    received: Some(record.school_copy()),
                    tally: Some(DonorTally::Increment {
                        donor_id: input.donor_id.clone(),
                    }),
                },
            },
        )
        .await?;

        tracing::info!(
            "Donation {} ({}) from {} to {} recorded as {}",
            record.id,
            record.gift.kind(),
            record.donor_id,
            input.school_id,
            record.status
        );
        Ok(record)
    }

    /// Look a donation up by id in the donor ledgers.
    pub async fn find_donation(&self, donation_id: &str) -> AppResult<DonationRecord> {
        let donor_id = self
            .store
            .find_donor_of_donation(donation_id)
            .await?
            .ok_or_else(|| donation_not_found(donation_id))?;
        let donor = self.require_role(&donor_id, Role::Donor).await?;
        donor
            .as_donor()
            .and_then(|p| p.donations_made.iter().find(|r| r.id == donation_id))
            .cloned()
            .ok_or_else(|| donation_not_found(donation_id))
    }

    /// Move a donation to `new_status` on both ledgers.
    pub async fn transition_donation(
        &self,
        donation_id: &str,
        donor_id: &str,
        new_status: Status,
    ) -> AppResult<DonationRecord> {
        let donor = self.require_role(donor_id, Role::Donor).await?;
        let current = donor
            .as_donor()
            .and_then(|p| p.donations_made.iter().find(|r| r.id == donation_id))
            .ok_or_else(|| donation_not_found(donation_id))?;

        if !Status::donation_transition_allowed(current.status, new_status) {
            return Err(AppError::InvalidTransition {
                from: current.status,
                to: new_status,
            });
        }
        let school_id = current.school_id.clone().ok_or_else(|| {
            AppError::Validation(format!("Donation {} has no school reference", donation_id))
        })?;

        let change = StatusChange {
            status: new_status,
            at: Utc::now(),
        };
        let updated = self
            .store
            .set_donor_status(donor_id, donation_id, change)
            .await?;

        let repair = LedgerRepair::SetSchoolStatus {
            school_id: school_id.clone(),
            donation_id: donation_id.to_string(),
            change,
        };
        match self.run_school_half(&repair).await {
            Ok(()) => {}
            Err(e @ AppError::NotFound(_)) if is_missing_donation(&e) => {
                // The creating write never landed on the school, tally
                // included, so the repair is that write with the record in
                // its new state.
                let full = LedgerRepair::ApplySchoolWrite {
                    school_id,
                    write: SchoolWrite {
                        event_id: donation_id.to_string(),
                        received: Some(updated.school_copy()),
                        tally: Some(DonorTally::Increment {
                            donor_id: donor_id.to_string(),
                        }),
                    },
                };
                return Err(Self::diverged(donation_id, full, &e));
            }
            Err(e) => return Err(Self::diverged(donation_id, repair, &e)),
        }

        tracing::info!(
            "Donation {} moved {} -> {}",
            donation_id,
            current.status,
            new_status
        );
        Ok(updated)
    }

    /// Remove a donation from the donor ledger.
    ///
    /// The school copy is left in place: schools keep their received history
    /// after a donor retracts.
    pub async fn delete_donation(&self, donation_id: &str) -> AppResult<DonationRecord> {
        let donor_id = self
            .store
            .find_donor_of_donation(donation_id)
            .await?
            .ok_or_else(|| donation_not_found(donation_id))?;
        let removed = self
            .store
            .remove_donor_copy(&donor_id, donation_id)
            .await?;
        tracing::info!(
            "Donation {} removed from donor {}; school copy retained",
            donation_id,
            donor_id
        );
        Ok(removed)
    }
}
