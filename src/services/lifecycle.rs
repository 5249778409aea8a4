//! Lifecycle controllers: ownership checks, ledger writes and the
//! notifications each transition emits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::{
    Account, AccountRepository, CreateDonation, CreateDonationRequest, DonationRecord,
    DonationRequest, DonationRequestFilter, NotificationContext, Role, Status,
};
use crate::error::{AppError, AppResult};
use crate::services::ledger::LedgerWriter;
use crate::services::notifications::{FanoutReport, NotificationDispatcher, NotificationKind};
use crate::services::requests::RequestBook;

/// Caller identity as resolved by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub account_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(account_id: impl Into<String>, role: Role) -> Self {
        Self {
            account_id: account_id.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admin, or the account itself acting with the expected role.
    fn acts_for(&self, account_id: &str, role: Role) -> bool {
        self.is_admin() || (self.role == role && self.account_id == account_id)
    }

    fn require(&self, allowed: bool) -> AppResult<()> {
        if allowed {
            Ok(())
        } else {
            tracing::debug!(
                "Denied {} {} for this operation",
                self.role.as_str(),
                self.account_id
            );
            Err(AppError::Forbidden)
        }
    }
}

/// Date range for a ledger read. Both ends inclusive.
#[derive(Debug, Clone)]
pub struct LedgerQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub struct Lifecycle {
    pool: SqlitePool,
    ledger: Arc<LedgerWriter>,
    requests: RequestBook,
    dispatcher: NotificationDispatcher,
}

impl Lifecycle {
    pub fn new(
        pool: SqlitePool,
        ledger: Arc<LedgerWriter>,
        requests: RequestBook,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            pool,
            ledger,
            requests,
            dispatcher,
        }
    }

    /// Display name for messages. Falls back to the id; notifications never
    /// fail the operation that emits them.
    async fn name_of(&self, account_id: &str) -> String {
        match AccountRepository::find_by_id(&self.pool, account_id).await {
            Ok(Some(account)) => account.name,
            Ok(None) => account_id.to_string(),
            Err(e) => {
                tracing::warn!("Could not load name of {}: {}", account_id, e);
                account_id.to_string()
            }
        }
    }

    pub async fn create_donation(
        &self,
        actor: &Actor,
        input: CreateDonation,
    ) -> AppResult<DonationRecord> {
        actor.require(actor.acts_for(&input.donor_id, Role::Donor))?;

        let school_id = input.school_id.clone();
        let record = self.ledger.create_donation(input).await?;

        let donor_name = self.name_of(&record.donor_id).await;
        let school_name = self.name_of(&school_id).await;
        self.dispatcher
            .notify(
                &school_id,
                NotificationKind::DonationReceived,
                &format!(
                    "{} donated {} to {}",
                    donor_name,
                    record.gift.describe(),
                    school_name
                ),
                NotificationContext {
                    donation_id: Some(record.id.clone()),
                    donor_id: Some(record.donor_id.clone()),
                    donor_name: Some(donor_name),
                    ..Default::default()
                },
            )
            .await;
        Ok(record)
    }

    /// Approve or complete a donation on behalf of the receiving school.
    pub async fn transition_donation(
        &self,
        actor: &Actor,
        donation_id: &str,
        new_status: Status,
    ) -> AppResult<DonationRecord> {
        let kind = match new_status {
            Status::Approved => NotificationKind::Approval,
            Status::Completed => NotificationKind::Completion,
            Status::Pending | Status::Rejected => {
                return Err(AppError::Validation(format!(
                    "Donations can only be approved or completed, not {}",
                    new_status
                )))
            }
        };

        let current = self.ledger.find_donation(donation_id).await?;
        let school_id = current.school_id.clone().unwrap_or_default();
        actor.require(actor.acts_for(&school_id, Role::School))?;

        let updated = self
            .ledger
            .transition_donation(donation_id, &current.donor_id, new_status)
            .await?;

        let school_name = self.name_of(&school_id).await;
        self.dispatcher
            .notify(
                &updated.donor_id,
                kind,
                &format!(
                    "Your donation of {} to {} was {}",
                    updated.gift.describe(),
                    school_name,
                    new_status.as_str().to_lowercase()
                ),
                NotificationContext {
                    donation_id: Some(updated.id.clone()),
                    school_id: Some(school_id),
                    school_name: Some(school_name),
                    ..Default::default()
                },
            )
            .await;
        Ok(updated)
    }

    pub async fn approve_donation(
        &self,
        actor: &Actor,
        donation_id: &str,
    ) -> AppResult<DonationRecord> {
        self.transition_donation(actor, donation_id, Status::Approved)
            .await
    }

    pub async fn complete_donation(
        &self,
        actor: &Actor,
        donation_id: &str,
    ) -> AppResult<DonationRecord> {
        self.transition_donation(actor, donation_id, Status::Completed)
            .await
    }

    pub async fn delete_donation(&self, actor: &Actor, donation_id: &str) -> AppResult<()> {
        let current = self.ledger.find_donation(donation_id).await?;
        actor.require(actor.acts_for(&current.donor_id, Role::Donor))?;

        let removed = self.ledger.delete_donation(donation_id).await?;

        if let Some(school_id) = removed.school_id.as_deref() {
            let donor_name = self.name_of(&removed.donor_id).await;
            self.dispatcher
                .notify(
                    school_id,
                    NotificationKind::DonationDeleted,
                    &format!(
                        "{} withdrew their donation of {}",
                        donor_name,
                        removed.gift.describe()
                    ),
                    NotificationContext {
                        donation_id: Some(removed.id.clone()),
                        donor_id: Some(removed.donor_id.clone()),
                        donor_name: Some(donor_name),
                        ..Default::default()
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Create a request and announce it to every donor.
    pub async fn create_request(
        &self,
        actor: &Actor,
        input: CreateDonationRequest,
    ) -> AppResult<(DonationRequest, FanoutReport)> {
        actor.require(actor.acts_for(&input.school_id, Role::School))?;

        let request = self.requests.create_request(input).await?;
        let school_name = self.name_of(&request.school_id).await;
        let needs = request.needs_label();
        let context = NotificationContext {
            request_id: Some(request.id.clone()),
            school_id: Some(request.school_id.clone()),
            school_name: Some(school_name.clone()),
            ..Default::default()
        };

        self.dispatcher
            .notify(
                &request.school_id,
                NotificationKind::RequestSubmission,
                &format!("Your donation request for {} was submitted", needs),
                context.clone(),
            )
            .await;
        let report = self
            .dispatcher
            .notify_broadcast(
                Role::Donor,
                NotificationKind::NewDonationRequest,
                &format!("{} is asking for {}", school_name, needs),
                context,
            )
            .await;

        Ok((request, report))
    }

    pub async fn respond_to_request(
        &self,
        actor: &Actor,
        request_id: &str,
        donor_id: &str,
        response: Status,
    ) -> AppResult<DonationRequest> {
        actor.require(actor.acts_for(donor_id, Role::Donor))?;

        let request = self
            .requests
            .respond_to_request(request_id, donor_id, response)
            .await?;

        let donor_name = self.name_of(donor_id).await;
        self.dispatcher
            .notify(
                &request.school_id,
                NotificationKind::RequestResponse,
                &format!(
                    "{} marked your request for {} as {}",
                    donor_name,
                    request.needs_label(),
                    response.as_str().to_lowercase()
                ),
                NotificationContext {
                    request_id: Some(request.id.clone()),
                    donor_id: Some(donor_id.to_string()),
                    donor_name: Some(donor_name),
                    ..Default::default()
                },
            )
            .await;
        Ok(request)
    }

    /// Approve, complete or reject a request. Approval and rejection are
    /// admin decisions; the owning school may also complete.
    pub async fn transition_request(
        &self,
        actor: &Actor,
        request_id: &str,
        new_status: Status,
    ) -> AppResult<DonationRequest> {
        let current = self.requests.find(request_id).await?;
        let kind = match new_status {
            Status::Approved => {
                actor.require(actor.is_admin())?;
                NotificationKind::RequestApproval
            }
            Status::Rejected => {
                actor.require(actor.is_admin())?;
                NotificationKind::RequestRejection
            }
            Status::Completed => {
                actor.require(actor.acts_for(&current.school_id, Role::School))?;
                NotificationKind::RequestCompletion
            }
            Status::Pending => {
                return Err(AppError::Validation(
                    "Requests cannot be moved back to Pending".to_string(),
                ))
            }
        };

        let request = self
            .requests
            .transition_request(request_id, new_status)
            .await?;

        let school_name = self.name_of(&request.school_id).await;
        let message = format!(
            "Donation request for {} at {} was {}",
            request.needs_label(),
            school_name,
            new_status.as_str().to_lowercase()
        );
        let context = NotificationContext {
            request_id: Some(request.id.clone()),
            school_id: Some(request.school_id.clone()),
            school_name: Some(school_name),
            donor_id: request.donor_id.clone(),
            ..Default::default()
        };

        self.dispatcher
            .notify(&request.school_id, kind, &message, context.clone())
            .await;
        if let Some(donor_id) = request.donor_id.as_deref() {
            self.dispatcher.notify(donor_id, kind, &message, context).await;
        }
        Ok(request)
    }

    pub async fn delete_request(&self, actor: &Actor, request_id: &str) -> AppResult<()> {
        let current = self.requests.find(request_id).await?;
        actor.require(actor.acts_for(&current.school_id, Role::School))?;
        self.requests.delete_request(request_id).await
    }

    pub async fn follow_request(&self, actor: &Actor, request_id: &str) -> AppResult<Vec<String>> {
        actor.require(actor.role == Role::Donor)?;
        self.requests
            .follow_request(&actor.account_id, request_id)
            .await
    }

    pub async fn list_requests(
        &self,
        filter: &DonationRequestFilter,
    ) -> AppResult<Vec<DonationRequest>> {
        self.requests.list(filter).await
    }

    /// An account's own ledger, `donationsMade` for donors and
    /// `donationsReceived` for schools, restricted to a date range.
    pub async fn account_ledger(
        &self,
        actor: &Actor,
        account_id: &str,
        query: &LedgerQuery,
    ) -> AppResult<Vec<DonationRecord>> {
        actor.require(actor.is_admin() || actor.account_id == account_id)?;
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(AppError::Validation(
                    "Date range start is after its end".to_string(),
                ));
            }
        }

        let account: Account = AccountRepository::find_by_id(&self.pool, account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account not found: {}", account_id)))?;
        let records = match (account.as_donor(), account.as_school()) {
            (Some(donor), _) => donor.donations_made.clone(),
            (_, Some(school)) => school.donations_received.clone(),
            (None, None) => {
                return Err(AppError::Validation(
                    "Admin accounts have no ledger".to_string(),
                ))
            }
        };

        Ok(records
            .into_iter()
            .filter(|r| query.from.map_or(true, |from| r.date >= from))
            .filter(|r| query.to.map_or(true, |to| r.date <= to))
            .collect())
    }
}
