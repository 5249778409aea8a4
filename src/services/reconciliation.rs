//! Ledger reconciliation sweep.
//!
//! Compares every donor-side record that points at a school with the school's
//! `donationsReceived` and reports where the two ledgers disagree. Donor copies
//! are authoritative: repairs always bring the school copy in line with them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::{AccountRepository, DonationRecord, Role};
use crate::error::{AppError, AppResult};
use crate::services::active_donors::DonorTally;
use crate::services::ledger::{LedgerRepair, LedgerWriter, SchoolWrite};

/// Result of checking one school.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub school_id: String,
    pub checked_at: DateTime<Utc>,
    /// Donor-side records pointing at this school.
    pub donor_records: usize,
    /// Records in the school's `donationsReceived`.
    pub school_records: usize,
    pub issues: Vec<ReconciliationIssue>,
    /// Repairs applied during this run.
    pub repaired: usize,
}

impl ReconciliationReport {
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    pub fn issues_of_type(&self, issue_type: IssueType) -> Vec<&ReconciliationIssue> {
        self.issues
            .iter()
            .filter(|i| i.issue_type == issue_type)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationIssue {
    pub issue_type: IssueType,
    pub donation_id: String,
    pub description: String,
    pub severity: Severity,
    /// Present when the issue can be fixed by re-applying the school half.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair: Option<LedgerRepair>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    /// Donor copy exists, school copy does not.
    MissingSchoolCopy,
    /// Both copies exist with different status.
    StatusMismatch,
    /// School copy with no donor copy: a deleted donation or a completed
    /// request response.
    OrphanedSchoolCopy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

fn missing_copy_repair(school_id: &str, record: &DonationRecord) -> LedgerRepair {
    LedgerRepair::ApplySchoolWrite {
        school_id: school_id.to_string(),
        write: SchoolWrite {
            event_id: record.id.clone(),
            received: Some(record.school_copy()),
            tally: Some(DonorTally::Increment {
                donor_id: record.donor_id.clone(),
            }),
        },
    }
}

/// `None` for a Pending donor copy: the school copy cannot be moved back.
fn status_repair(school_id: &str, record: &DonationRecord) -> Option<LedgerRepair> {
    record
        .status_change()
        .map(|change| LedgerRepair::SetSchoolStatus {
            school_id: school_id.to_string(),
            donation_id: record.id.clone(),
            change,
        })
}

#[derive(Clone)]
pub struct Reconciler {
    pool: SqlitePool,
    ledger: Arc<LedgerWriter>,
}

impl Reconciler {
    pub fn new(pool: SqlitePool, ledger: Arc<LedgerWriter>) -> Self {
        Self { pool, ledger }
    }

    /// Check one school. With `repair`, repairable issues are fixed in place.
    pub async fn reconcile_school(
        &self,
        school_id: &str,
        repair: bool,
    ) -> AppResult<ReconciliationReport> {
        let school = AccountRepository::find_by_id(&self.pool, school_id)
            .await?
            .filter(|a| a.role() == Role::School)
            .ok_or_else(|| AppError::NotFound(format!("School not found: {}", school_id)))?;
        let received: HashMap<&str, &DonationRecord> = school
            .as_school()
            .map(|p| {
                p.donations_received
                    .iter()
                    .map(|r| (r.id.as_str(), r))
                    .collect()
            })
            .unwrap_or_default();

        let donors = AccountRepository::find_donors_of_school(&self.pool, school_id).await?;
        let made: Vec<&DonationRecord> = donors
            .iter()
            .filter_map(|d| d.as_donor())
            .flat_map(|p| p.donations_made.iter())
            .filter(|r| r.school_id.as_deref() == Some(school_id))
            .collect();

        let mut issues = Vec::new();
        for record in &made {
            match received.get(record.id.as_str()) {
                None => issues.push(ReconciliationIssue {
                    issue_type: IssueType::MissingSchoolCopy,
                    donation_id: record.id.clone(),
                    description: format!(
                        "Donation {} from {} has no school copy",
                        record.id, record.donor_id
                    ),
                    severity: Severity::Error,
                    repair: Some(missing_copy_repair(school_id, record)),
                }),
                Some(copy) if copy.status != record.status => {
                    issues.push(ReconciliationIssue {
                        issue_type: IssueType::StatusMismatch,
                        donation_id: record.id.clone(),
                        description: format!(
                            "Donation {} is {} for the donor but {} for the school",
                            record.id, record.status, copy.status
                        ),
                        severity: Severity::Warning,
                        repair: status_repair(school_id, record),
                    })
                }
                Some(_) => {}
            }
        }

        let donor_ids: HashSet<&str> =
            made.iter().map(|r| r.id.as_str()).collect();
        for (id, copy) in &received {
            if !donor_ids.contains(id) {
                issues.push(ReconciliationIssue {
                    issue_type: IssueType::OrphanedSchoolCopy,
                    donation_id: id.to_string(),
                    description: format!(
                        "School copy {} from {} has no donor copy",
                        id, copy.donor_id
                    ),
                    severity: Severity::Info,
                    repair: None,
                });
            }
        }
        issues.sort_by(|a, b| a.donation_id.cmp(&b.donation_id));

        let mut repaired = 0;
        if repair {
            for issue in issues.iter().filter(|i| i.repair.is_some()) {
                // The snapshot above may be stale; repair from the donor copy
                // as it is now.
                let current = match self.ledger.find_donation(&issue.donation_id).await {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::info!(
                            "Skipping repair of {} on school {}: {}",
                            issue.donation_id,
                            school_id,
                            e
                        );
                        continue;
                    }
                };
                let fix = match issue.issue_type {
                    IssueType::MissingSchoolCopy => Some(missing_copy_repair(school_id, &current)),
                    IssueType::StatusMismatch => status_repair(school_id, &current),
                    IssueType::OrphanedSchoolCopy => None,
                };
                let Some(fix) = fix else { continue };
                match self.ledger.repair(&fix).await {
                    Ok(()) => repaired += 1,
                    Err(e) => tracing::warn!(
                        "Repair of {} on school {} failed: {}",
                        issue.donation_id,
                        school_id,
                        e
                    ),
                }
            }
        }

        let report = ReconciliationReport {
            school_id: school_id.to_string(),
            checked_at: Utc::now(),
            donor_records: made.len(),
            school_records: received.len(),
            issues,
            repaired,
        };
        if report
            .issues
            .iter()
            .any(|i| i.severity != Severity::Info)
        {
            tracing::warn!(
                "School {} ledgers diverge: {} issue(s), {} repaired",
                school_id,
                report.issues.len(),
                report.repaired
            );
        }
        Ok(report)
    }

    /// Sweep every school. A school that cannot be checked is logged and
    /// skipped.
    pub async fn reconcile_all(&self, repair: bool) -> AppResult<Vec<ReconciliationReport>> {
        let schools = AccountRepository::list_ids_by_role(&self.pool, Role::School).await?;
        let mut reports = Vec::with_capacity(schools.len());
        for school_id in schools {
            match self.reconcile_school(&school_id, repair).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!("Reconciliation of school {} failed: {}", school_id, e),
            }
        }
        tracing::info!(
            "Reconciled {} school(s), {} with issues",
            reports.len(),
            reports.iter().filter(|r| r.has_issues()).count()
        );
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateDonation, GiftInput, Status};
    use crate::services::ledger::tests::FailingSchoolSide;
    use crate::services::ledger::{LedgerStore, SqliteLedgerStore};
    use crate::test_support::{create_account, load, test_config, test_pool};
    use std::sync::atomic::Ordering;

    fn writer(store: Arc<dyn LedgerStore>) -> Arc<LedgerWriter> {
        Arc::new(LedgerWriter::new(store, &test_config().ledger))
    }

    fn money(donor: &str, school: &str) -> CreateDonation {
        CreateDonation {
            donor_id: donor.to_string(),
            school_id: school.to_string(),
            gift: GiftInput::Money { amount: 10.0 },
        }
    }

    #[tokio::test]
    async fn consistent_ledgers_report_nothing() {
        let pool = test_pool().await;
        let donor = create_account(&pool, "Ana", Role::Donor).await;
        let school = create_account(&pool, "Hill", Role::School).await;
        let ledger = writer(Arc::new(SqliteLedgerStore::new(pool.clone(), 3)));
        ledger.create_donation(money(&donor.id, &school.id)).await.unwrap();

        let report = Reconciler::new(pool.clone(), ledger)
            .reconcile_school(&school.id, false)
            .await
            .unwrap();
        assert!(!report.has_issues());
        assert_eq!(report.donor_records, 1);
        assert_eq!(report.school_records, 1);
    }

    #[tokio::test]
    async fn missing_copy_is_found_and_repaired() {
        let pool = test_pool().await;
        let donor = create_account(&pool, "Ana", Role::Donor).await;
        let school = create_account(&pool, "Hill", Role::School).await;
        let store = Arc::new(FailingSchoolSide::new(pool.clone()));
        store.school_failures.store(1, Ordering::SeqCst);
        let ledger = writer(store);
        assert!(ledger.create_donation(money(&donor.id, &school.id)).await.is_err());

        let reconciler = Reconciler::new(pool.clone(), ledger);
        let report = reconciler.reconcile_school(&school.id, false).await.unwrap();
        assert_eq!(report.issues_of_type(IssueType::MissingSchoolCopy).len(), 1);
        assert_eq!(report.repaired, 0);

        let report = reconciler.reconcile_school(&school.id, true).await.unwrap();
        assert_eq!(report.repaired, 1);

        let after = reconciler.reconcile_school(&school.id, false).await.unwrap();
        assert!(!after.has_issues());
        let profile = load(&pool, &school.id).await;
        assert_eq!(profile.as_school().unwrap().active_donors[0].donations_made, 1);
    }

    #[tokio::test]
    async fn status_mismatch_and_orphans() {
        let pool = test_pool().await;
        let donor = create_account(&pool, "Ana", Role::Donor).await;
        let school = create_account(&pool, "Hill", Role::School).await;
        let store = Arc::new(FailingSchoolSide::new(pool.clone()));
        let ledger = writer(store.clone());

        let tomorrow = (Utc::now().date_naive() + chrono::Duration::days(1)).to_string();
        let pending = ledger
            .create_donation(CreateDonation {
                donor_id: donor.id.clone(),
                school_id: school.id.clone(),
                gift: GiftInput::Items {
                    items: vec!["Desks".to_string()],
                    preferred_date: Some(tomorrow),
                    address: None,
                },
            })
            .await
            .unwrap();
        let deleted = ledger.create_donation(money(&donor.id, &school.id)).await.unwrap();
        ledger.delete_donation(&deleted.id).await.unwrap();

        store.school_failures.store(1, Ordering::SeqCst);
        assert!(ledger
            .transition_donation(&pending.id, &donor.id, Status::Approved)
            .await
            .is_err());

        let reconciler = Reconciler::new(pool.clone(), ledger);
        let reports = reconciler.reconcile_all(true).await.unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.issues_of_type(IssueType::StatusMismatch).len(), 1);
        let orphans = report.issues_of_type(IssueType::OrphanedSchoolCopy);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].donation_id, deleted.id);
        assert!(orphans[0].repair.is_none());
        assert_eq!(report.repaired, 1);

        let school_copy = load(&pool, &school.id)
            .await
            .as_school()
            .unwrap()
            .donations_received
            .iter()
            .find(|r| r.id == pending.id)
            .cloned()
            .unwrap();
        assert_eq!(school_copy.status, Status::Approved);
    }

    #[tokio::test]
    async fn non_school_is_not_found() {
        let pool = test_pool().await;
        let donor = create_account(&pool, "Ana", Role::Donor).await;
        let ledger = writer(Arc::new(SqliteLedgerStore::new(pool.clone(), 3)));
        let res = Reconciler::new(pool, ledger)
            .reconcile_school(&donor.id, false)
            .await;
        assert!(matches!(res, Err(AppError::NotFound(_))));
    }
}
