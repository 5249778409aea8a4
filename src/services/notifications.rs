use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::FanoutConfig;
use crate::db::{AccountRepository, Notification, NotificationContext, Role};
use crate::error::{AppError, AppResult};

/// Notification tags written by the donation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    DonationReceived,
    Approval,
    Completion,
    DonationDeleted,
    RequestSubmission,
    NewDonationRequest,
    RequestResponse,
    RequestApproval,
    RequestCompletion,
    RequestRejection,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::DonationReceived => "donation_received",
            NotificationKind::Approval => "approval",
            NotificationKind::Completion => "completion",
            NotificationKind::DonationDeleted => "donation_deleted",
            NotificationKind::RequestSubmission => "request_submission",
            NotificationKind::NewDonationRequest => "new_donation_request",
            NotificationKind::RequestResponse => "request_response",
            NotificationKind::RequestApproval => "request_approval",
            NotificationKind::RequestCompletion => "request_completion",
            NotificationKind::RequestRejection => "request_rejection",
        }
    }
}

/// Where notifications are appended. The production implementation writes
/// into the account documents; tests substitute failing inboxes.
#[async_trait]
pub trait InboxStore: Send + Sync + 'static {
    /// Append to the end of the account's inbox.
    async fn append(&self, account_id: &str, notification: &Notification) -> AppResult<()>;

    /// Ids of every account with the given role.
    async fn recipients(&self, role: Role) -> AppResult<Vec<String>>;
}

pub struct SqliteInbox {
    pool: SqlitePool,
}

impl SqliteInbox {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InboxStore for SqliteInbox {
    async fn append(&self, account_id: &str, notification: &Notification) -> AppResult<()> {
        if AccountRepository::append_notification(&self.pool, account_id, notification).await? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("Account not found: {}", account_id)))
        }
    }

    async fn recipients(&self, role: Role) -> AppResult<Vec<String>> {
        AccountRepository::list_ids_by_role(&self.pool, role).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedDelivery {
    pub account_id: String,
    pub error: String,
}

/// Outcome of a broadcast. Failures are reported here and in the logs only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanoutReport {
    pub recipients: usize,
    pub delivered: usize,
    pub failed: Vec<FailedDelivery>,
}

/// Appends notifications to account inboxes on behalf of the lifecycle.
///
/// Delivery is best-effort: nothing here returns an error to the caller.
/// Each append is retried with exponential backoff; a missing recipient is
/// not retried.
pub struct NotificationDispatcher {
    inbox: Arc<dyn InboxStore>,
    config: FanoutConfig,
}

impl NotificationDispatcher {
    pub fn new(inbox: Arc<dyn InboxStore>, config: FanoutConfig) -> Self {
        Self { inbox, config }
    }

    fn build(kind: NotificationKind, message: &str, context: &NotificationContext) -> Notification {
        Notification {
            id: Uuid::new_v4().to_string(),
            message: message.to_string(),
            notification_type: kind.as_str().to_string(),
            date: Utc::now(),
            read: false,
            context: context.clone(),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        // min(max_backoff, initial_backoff * 2^attempt)
        let mut delay = self.config.initial_backoff_ms;
        for _ in 0..attempt {
            delay = delay.saturating_mul(2);
            if delay >= self.config.max_backoff_ms {
                delay = self.config.max_backoff_ms;
                break;
            }
        }
        Duration::from_millis(delay.min(self.config.max_backoff_ms))
    }

    async fn deliver(&self, account_id: &str, notification: &Notification) -> AppResult<()> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.inbox.append(account_id, notification).await {
                Ok(()) => return Ok(()),
                Err(AppError::NotFound(msg)) => {
                    return Err(AppError::NotificationDelivery(msg));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(AppError::NotificationDelivery(format!(
                            "{} after {} attempt(s)",
                            e, attempt
                        )));
                    }
                    let delay = self.backoff(attempt - 1);
                    tracing::debug!(
                        "Inbox append for {} failed (attempt {}/{}), retrying in {:?}: {}",
                        account_id,
                        attempt,
                        max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Append one notification to `target`'s inbox.
    pub async fn notify(
        &self,
        target: &str,
        kind: NotificationKind,
        message: &str,
        context: NotificationContext,
    ) {
        let notification = Self::build(kind, message, &context);
        match self.deliver(target, &notification).await {
            Ok(()) => tracing::debug!("Notified {} ({})", target, kind.as_str()),
            Err(e) => tracing::warn!(
                "Dropping {} notification for {}: {}",
                kind.as_str(),
                target,
                e
            ),
        }
    }

    /// Fan one event out to every account with `role`.
    ///
    /// Recipients are written to independently with at most
    /// `fanout.concurrency` appends in flight; one failed recipient does not
    /// stop the others.
    pub async fn notify_broadcast(
        &self,
        role: Role,
        kind: NotificationKind,
        message: &str,
        context: NotificationContext,
    ) -> FanoutReport {
        let recipients = match self.inbox.recipients(role).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(
                    "Could not list {} recipients for {} broadcast: {}",
                    role.as_str(),
                    kind.as_str(),
                    e
                );
                return FanoutReport::default();
            }
        };

        let total = recipients.len();
        let results: Vec<(String, AppResult<()>)> = stream::iter(recipients)
            .map(|account_id| {
                let notification = Self::build(kind, message, &context);
                async move {
                    let res = self.deliver(&account_id, &notification).await;
                    (account_id, res)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = FanoutReport {
            recipients: total,
            ..Default::default()
        };
        for (account_id, res) in results {
            match res {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        "Broadcast {} to {} failed: {}",
                        kind.as_str(),
                        account_id,
                        e
                    );
                    report.failed.push(FailedDelivery {
                        account_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            "Broadcast {} to {} {} account(s): {} delivered, {} failed",
            kind.as_str(),
            total,
            role.as_str(),
            report.delivered,
            report.failed.len()
        );
        report
    }
}

/// Inbox reads and read-marking for the account owner.
pub struct InboxService;

impl InboxService {
    /// Most recent first. Storage keeps the oldest first.
    pub async fn list(
        pool: &SqlitePool,
        account_id: &str,
        unread_only: bool,
    ) -> AppResult<Vec<Notification>> {
        let account = AccountRepository::find_by_id(pool, account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account not found: {}", account_id)))?;

        Ok(account
            .notifications
            .into_iter()
            .rev()
            .filter(|n| !unread_only || !n.read)
            .collect())
    }

    pub async fn mark_read(
        pool: &SqlitePool,
        account_id: &str,
        notification_id: &str,
        max_attempts: u32,
    ) -> AppResult<Notification> {
        let (_, notification) =
            AccountRepository::modify(pool, account_id, max_attempts, |account| {
                let entry = account
                    .notifications
                    .iter_mut()
                    .find(|n| n.id == notification_id)
                    .ok_or_else(|| {
                        AppError::NotFound(format!("Notification not found: {}", notification_id))
                    })?;
                entry.read = true;
                Ok(entry.clone())
            })
            .await?;

        Ok(notification)
    }
}
