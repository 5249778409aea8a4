use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::{
    AccountRepository, CreateDonationRequest, DonationRecord, DonationRequest,
    DonationRequestFilter, DonationRequestRepository, DonorResponse, Gift, Role, Status,
};
use crate::error::{AppError, AppResult};
use crate::services::active_donors::DonorTally;
use crate::services::ledger::{LedgerRepair, LedgerWriter, SchoolWrite};

fn request_not_found(id: &str) -> AppError {
    AppError::NotFound(format!("Donation request not found: {}", id))
}

/// Donation request documents and their per-donor response sub-ledger.
pub struct RequestBook {
    pool: SqlitePool,
    ledger: Arc<LedgerWriter>,
    max_attempts: u32,
}

impl RequestBook {
    pub fn new(pool: SqlitePool, ledger: Arc<LedgerWriter>, max_attempts: u32) -> Self {
        Self {
            pool,
            ledger,
            max_attempts,
        }
    }

    pub async fn find(&self, request_id: &str) -> AppResult<DonationRequest> {
        DonationRequestRepository::find_by_id(&self.pool, request_id)
            .await?
            .ok_or_else(|| request_not_found(request_id))
    }

    pub async fn list(&self, filter: &DonationRequestFilter) -> AppResult<Vec<DonationRequest>> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(AppError::Validation(
                    "Date range start is after its end".to_string(),
                ));
            }
        }
        DonationRequestRepository::list(&self.pool, filter).await
    }

    pub async fn create_request(
        &self,
        mut input: CreateDonationRequest,
    ) -> AppResult<DonationRequest> {
        input.donation_needs = input
            .donation_needs
            .into_iter()
            .map(|n| n.trim().to_string())
            .collect();
        if input.donation_needs.is_empty() {
            return Err(AppError::Validation(
                "At least one donation need is required".to_string(),
            ));
        }
        if input.donation_needs.iter().any(|n| n.is_empty()) {
            return Err(AppError::Validation(
                "Donation needs cannot be blank".to_string(),
            ));
        }
        input.custom_request = input
            .custom_request
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        match AccountRepository::find_by_id(&self.pool, &input.school_id).await? {
            Some(account) if account.role() == Role::School => {}
            _ => {
                return Err(AppError::NotFound(format!(
                    "School not found: {}",
                    input.school_id
                )))
            }
        }

        let request = DonationRequestRepository::create(&self.pool, input).await?;
        tracing::info!(
            "Donation request {} created for school {}",
            request.id,
            request.school_id
        );
        Ok(request)
    }

    /// Record a donor's response and mirror it on the school.
    ///
    /// The request document is written first. An `Approved` response then
    /// counts the donor on the school; a `Completed` response also appends a
    /// received record labelled with the request's first need. A failure on
    /// the school side is a partial write like any other dual write.
    pub async fn respond_to_request(
        &self,
        request_id: &str,
        donor_id: &str,
        response: Status,
    ) -> AppResult<DonationRequest> {
        if !matches!(response, Status::Approved | Status::Completed) {
            return Err(AppError::Validation(format!(
                "Response must be Approved or Completed, got {}",
                response
            )));
        }
        match AccountRepository::find_by_id(&self.pool, donor_id).await? {
            Some(account) if account.role() == Role::Donor => {}
            _ => return Err(AppError::NotFound(format!("Donor not found: {}", donor_id))),
        }

        let now = Utc::now();
        let (request, previous) =
            DonationRequestRepository::modify(&self.pool, request_id, self.max_attempts, |req| {
                if req.status.is_terminal() {
                    return Err(AppError::InvalidTransition {
                        from: req.status,
                        to: response,
                    });
                }
                let previous = match req.donors.iter_mut().find(|d| d.donor_id == donor_id) {
                    Some(entry) => {
                        if !Status::response_transition_allowed(entry.status, response) {
                            return Err(AppError::InvalidTransition {
                                from: entry.status,
                                to: response,
                            });
                        }
                        let previous = entry.status;
                        entry.status = response;
                        entry.date = now;
                        Some(previous)
                    }
                    None => {
                        req.donors.push(DonorResponse {
                            donor_id: donor_id.to_string(),
                            status: response,
                            date: now,
                        });
                        None
                    }
                };
                if req.donor_id.is_none() {
                    req.donor_id = Some(donor_id.to_string());
                }
                Ok(previous)
            })
            .await?;

        let write = match response {
            Status::Completed => {
                let record_id = Uuid::new_v4().to_string();
                SchoolWrite {
                    event_id: record_id.clone(),
                    received: Some(DonationRecord {
                        id: record_id,
                        donor_id: donor_id.to_string(),
                        school_id: None,
                        gift: Gift::Items {
                            items: request.donation_needs.iter().take(1).cloned().collect(),
                            delivery: None,
                        },
                        status: Status::Completed,
                        date: now,
                        approval_date: None,
                        completion_date: Some(now),
                    }),
                    // An earlier Approved response already counted this donor.
                    tally: Some(if previous == Some(Status::Approved) {
                        DonorTally::EnsureListed {
                            donor_id: donor_id.to_string(),
                        }
                    } else {
                        DonorTally::Increment {
                            donor_id: donor_id.to_string(),
                        }
                    }),
                }
            }
            // A donor's entry reaches Approved at most once per request.
            _ => SchoolWrite {
                event_id: format!("{}:{}:approved", request.id, donor_id),
                received: None,
                tally: Some(DonorTally::Increment {
                    donor_id: donor_id.to_string(),
                }),
            },
        };

        self.ledger
            .finish_on_school(
                &request.id,
                LedgerRepair::ApplySchoolWrite {
                    school_id: request.school_id.clone(),
                    write,
                },
            )
            .await?;

        tracing::info!(
            "Donor {} responded {} to request {}",
            donor_id,
            response,
            request.id
        );
        Ok(request)
    }

    pub async fn transition_request(
        &self,
        request_id: &str,
        new_status: Status,
    ) -> AppResult<DonationRequest> {
        if new_status == Status::Pending {
            return Err(AppError::Validation(
                "Requests cannot be moved back to Pending".to_string(),
            ));
        }

        let now = Utc::now();
        let (request, from) =
            DonationRequestRepository::modify(&self.pool, request_id, self.max_attempts, |req| {
                let from = req.status;
                if !Status::request_transition_allowed(from, new_status) {
                    return Err(AppError::InvalidTransition {
                        from,
                        to: new_status,
                    });
                }
                req.status = new_status;
                match new_status {
                    Status::Approved => req.request_approval_date = Some(now),
                    Status::Completed => req.request_completion_date = Some(now),
                    Status::Rejected => req.request_rejection_date = Some(now),
                    Status::Pending => {}
                }
                Ok(from)
            })
            .await?;

        if from == Status::Pending && new_status == Status::Completed {
            tracing::warn!(
                "Request {} completed without approval; accepted for compatibility",
                request.id
            );
        }
        tracing::info!("Request {} moved {} -> {}", request.id, from, new_status);
        Ok(request)
    }

    pub async fn delete_request(&self, request_id: &str) -> AppResult<()> {
        if !DonationRequestRepository::delete(&self.pool, request_id).await? {
            return Err(request_not_found(request_id));
        }
        tracing::info!("Request {} deleted", request_id);
        Ok(())
    }

    /// Add the request to the donor's followed list. Following twice is a
    /// no-op.
    pub async fn follow_request(&self, donor_id: &str, request_id: &str) -> AppResult<Vec<String>> {
        self.find(request_id).await?;

        let (_, followed) =
            AccountRepository::modify(&self.pool, donor_id, self.max_attempts, |account| {
                let profile = account
                    .as_donor_mut()
                    .ok_or_else(|| AppError::NotFound(format!("Donor not found: {}", donor_id)))?;
                if !profile
                    .donation_requests_followed
                    .iter()
                    .any(|id| id == request_id)
                {
                    profile
                        .donation_requests_followed
                        .push(request_id.to_string());
                }
                Ok(profile.donation_requests_followed.clone())
            })
            .await?;
        Ok(followed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ledger::tests::FailingSchoolSide;
    use crate::services::ledger::{LedgerStore, SqliteLedgerStore};
    use crate::test_support::{create_account, load, test_config, test_pool};
    use std::sync::atomic::Ordering;

    fn book_with(pool: &SqlitePool, store: Arc<dyn LedgerStore>) -> RequestBook {
        let config = test_config();
        RequestBook::new(
            pool.clone(),
            Arc::new(LedgerWriter::new(store, &config.ledger)),
            3,
        )
    }

    fn book(pool: &SqlitePool) -> RequestBook {
        book_with(pool, Arc::new(SqliteLedgerStore::new(pool.clone(), 3)))
    }

    fn needs(school_id: &str, needs: &[&str]) -> CreateDonationRequest {
        CreateDonationRequest {
            school_id: school_id.to_string(),
            donation_needs: needs.iter().map(|s| s.to_string()).collect(),
            custom_request: None,
        }
    }

    #[tokio::test]
    async fn create_validates_needs_and_school() {
        let pool = test_pool().await;
        let school = create_account(&pool, "Hill", Role::School).await;
        let donor = create_account(&pool, "Ana", Role::Donor).await;
        let book = book(&pool);

        assert!(matches!(
            book.create_request(needs(&school.id, &[])).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            book.create_request(needs(&school.id, &[" "])).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            book.create_request(needs(&donor.id, &["Books"])).await,
            Err(AppError::NotFound(_))
        ));

        let request = book
            .create_request(needs(&school.id, &[" Books ", "Desks"]))
            .await
            .unwrap();
        assert_eq!(request.status, Status::Pending);
        assert_eq!(request.donation_needs, vec!["Books", "Desks"]);
        assert!(request.donors.is_empty());
    }

    #[tokio::test]
    async fn approve_then_complete_stamps_dates() {
        let pool = test_pool().await;
        let school = create_account(&pool, "Hill", Role::School).await;
        let book = book(&pool);

        let request = book
            .create_request(needs(&school.id, &["Books", "Desks"]))
            .await
            .unwrap();
        book.transition_request(&request.id, Status::Approved)
            .await
            .unwrap();
        let done = book
            .transition_request(&request.id, Status::Completed)
            .await
            .unwrap();

        assert_eq!(done.status, Status::Completed);
        assert!(done.request_approval_date.is_some());
        assert!(done.request_completion_date.unwrap() >= done.request_approval_date.unwrap());
    }

    #[tokio::test]
    async fn transitions_are_not_idempotent() {
        let pool = test_pool().await;
        let school = create_account(&pool, "Hill", Role::School).await;
        let book = book(&pool);

        let request = book
            .create_request(needs(&school.id, &["Books"]))
            .await
            .unwrap();
        book.transition_request(&request.id, Status::Approved)
            .await
            .unwrap();
        let before = book.find(&request.id).await.unwrap();

        let err = book
            .transition_request(&request.id, Status::Approved)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: Status::Approved,
                to: Status::Approved
            }
        ));
        assert_eq!(book.find(&request.id).await.unwrap(), before);

        book.transition_request(&request.id, Status::Rejected)
            .await
            .unwrap();
        for target in [Status::Approved, Status::Completed, Status::Rejected] {
            assert!(matches!(
                book.transition_request(&request.id, target).await,
                Err(AppError::InvalidTransition { .. })
            ));
        }
        assert!(matches!(
            book.transition_request(&request.id, Status::Pending).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn pending_to_completed_is_tolerated() {
        let pool = test_pool().await;
        let school = create_account(&pool, "Hill", Role::School).await;
        let book = book(&pool);

        let request = book
            .create_request(needs(&school.id, &["Books"]))
            .await
            .unwrap();
        let done = book
            .transition_request(&request.id, Status::Completed)
            .await
            .unwrap();
        assert_eq!(done.status, Status::Completed);
        assert!(done.request_approval_date.is_none());
    }

    #[tokio::test]
    async fn responses_update_request_and_school() {
        let pool = test_pool().await;
        let school = create_account(&pool, "Hill", Role::School).await;
        let first = create_account(&pool, "Ana", Role::Donor).await;
        let second = create_account(&pool, "Ben", Role::Donor).await;
        let book = book(&pool);

        let request = book
            .create_request(needs(&school.id, &["Books", "Desks"]))
            .await
            .unwrap();

        let after = book
            .respond_to_request(&request.id, &first.id, Status::Approved)
            .await
            .unwrap();
        assert_eq!(after.donor_id.as_deref(), Some(first.id.as_str()));
        book.respond_to_request(&request.id, &second.id, Status::Completed)
            .await
            .unwrap();
        let after = book
            .respond_to_request(&request.id, &first.id, Status::Completed)
            .await
            .unwrap();

        assert_eq!(after.donor_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(after.donors.len(), 2);
        assert!(after.donors.iter().all(|d| d.status == Status::Completed));

        let school_account = load(&pool, &school.id).await;
        let profile = school_account.as_school().unwrap();
        assert_eq!(profile.donations_received.len(), 2);
        for record in &profile.donations_received {
            assert!(record.school_id.is_none());
            assert_eq!(record.status, Status::Completed);
            assert_eq!(
                record.gift,
                Gift::Items {
                    items: vec!["Books".to_string()],
                    delivery: None
                }
            );
        }
        // Approved then Completed by the same donor counts once.
        assert_eq!(profile.active_donors.len(), 2);
        assert!(profile.active_donors.iter().all(|d| d.donations_made == 1));

        let err = book
            .respond_to_request(&request.id, &first.id, Status::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn responses_to_closed_requests_fail() {
        let pool = test_pool().await;
        let school = create_account(&pool, "Hill", Role::School).await;
        let donor = create_account(&pool, "Ana", Role::Donor).await;
        let book = book(&pool);

        let request = book
            .create_request(needs(&school.id, &["Books"]))
            .await
            .unwrap();
        book.transition_request(&request.id, Status::Rejected)
            .await
            .unwrap();

        assert!(matches!(
            book.respond_to_request(&request.id, &donor.id, Status::Approved)
                .await,
            Err(AppError::InvalidTransition { .. })
        ));
        assert!(matches!(
            book.respond_to_request(&request.id, &donor.id, Status::Rejected)
                .await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            book.respond_to_request(&request.id, &school.id, Status::Approved)
                .await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_school_side_of_response_is_partial() {
        let pool = test_pool().await;
        let school = create_account(&pool, "Hill", Role::School).await;
        let donor = create_account(&pool, "Ana", Role::Donor).await;
        let store = Arc::new(FailingSchoolSide::new(pool.clone()));
        let book = book_with(&pool, store.clone());

        let request = book
            .create_request(needs(&school.id, &["Books"]))
            .await
            .unwrap();
        store.school_failures.store(1, Ordering::SeqCst);

        let err = book
            .respond_to_request(&request.id, &donor.id, Status::Approved)
            .await
            .unwrap_err();
        let partial = match err {
            AppError::PartialLedgerWrite(p) => p,
            other => panic!("expected partial write, got {:?}", other),
        };
        assert_eq!(partial.donation_id, request.id);
        assert_eq!(book.find(&request.id).await.unwrap().donors.len(), 1);
        assert!(load(&pool, &school.id)
            .await
            .as_school()
            .unwrap()
            .active_donors
            .is_empty());

        book.ledger.repair(&partial.repair).await.unwrap();
        book.ledger.repair(&partial.repair).await.unwrap();
        assert_eq!(
            load(&pool, &school.id).await.as_school().unwrap().active_donors[0].donations_made,
            1
        );
    }

    #[tokio::test]
    async fn delete_and_follow() {
        let pool = test_pool().await;
        let school = create_account(&pool, "Hill", Role::School).await;
        let donor = create_account(&pool, "Ana", Role::Donor).await;
        let book = book(&pool);

        let request = book
            .create_request(needs(&school.id, &["Books"]))
            .await
            .unwrap();
        book.follow_request(&donor.id, &request.id).await.unwrap();
        let followed = book.follow_request(&donor.id, &request.id).await.unwrap();
        assert_eq!(followed, vec![request.id.clone()]);
        assert!(matches!(
            book.follow_request(&school.id, &request.id).await,
            Err(AppError::NotFound(_))
        ));

        book.delete_request(&request.id).await.unwrap();
        assert!(matches!(
            book.delete_request(&request.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            book.follow_request(&donor.id, &request.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_by_school_and_status() {
        let pool = test_pool().await;
        let hill = create_account(&pool, "Hill", Role::School).await;
        let vale = create_account(&pool, "Vale", Role::School).await;
        let book = book(&pool);

        let a = book.create_request(needs(&hill.id, &["Books"])).await.unwrap();
        book.create_request(needs(&hill.id, &["Desks"])).await.unwrap();
        book.create_request(needs(&vale.id, &["Chalk"])).await.unwrap();
        book.transition_request(&a.id, Status::Approved).await.unwrap();

        let hill_only = book
            .list(&DonationRequestFilter {
                school_id: Some(hill.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hill_only.len(), 2);

        let approved = book
            .list(&DonationRequestFilter {
                status: Some(Status::Approved),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].id, a.id);

        let now = Utc::now();
        let backwards = book
            .list(&DonationRequestFilter {
                from: Some(now),
                to: Some(now - chrono::Duration::days(1)),
                ..Default::default()
            })
            .await;
        assert!(matches!(backwards, Err(AppError::Validation(_))));
    }
}
