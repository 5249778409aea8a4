use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::*;
use crate::error::{AppError, AppResult};

// ============================================================================
// Account Repository
// ============================================================================

/// Account documents.
///
/// Implementation notes:
/// - Appends to an embedded array are one `json_insert(col, '$[#]', ...)`
///   statement, atomic within the row, so two appends never lose each other.
/// - School-side ledger writes are one keyed statement
///   ([`AccountRepository::apply_school_event`]) or an element-level
///   compare-and-swap on a single received record
///   ([`AccountRepository::update_donation_received`]), so concurrent
///   donations to one school never contend on the whole row.
/// - Everything else goes through [`AccountRepository::modify`], a
///   compare-and-swap on the `version` column. Appends bump `version` as
///   well, so a racing CAS re-reads instead of overwriting them.
pub struct AccountRepository;

const SELECT_ACCOUNT: &str = r#"
    SELECT
        id, name, email, role,
        notifications, donations_made, donation_requests_followed,
        donations_received, needs, active_donors,
        version, created_at, updated_at
    FROM accounts
"#;

fn decode<T: serde::de::DeserializeOwned>(row: &SqliteRow, column: &str) -> AppResult<T> {
    let raw: String = row.get(column);
    Ok(serde_json::from_str(&raw)?)
}

fn account_from_row(row: &SqliteRow) -> AppResult<Account> {
    let role_raw: String = row.get("role");
    let role = Role::from_str(&role_raw)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Unknown account role: {}", role_raw)))?;

    let kind = match role {
        Role::Donor => AccountKind::Donor(DonorProfile {
            donations_made: decode(row, "donations_made")?,
            donation_requests_followed: decode(row, "donation_requests_followed")?,
        }),
        Role::School => AccountKind::School(SchoolProfile {
            donations_received: decode(row, "donations_received")?,
            needs: decode(row, "needs")?,
            active_donors: decode(row, "active_donors")?,
        }),
        Role::Admin => AccountKind::Admin,
    };

    Ok(Account {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        kind,
        notifications: decode(row, "notifications")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        version: row.get("version"),
    })
}

/// Embedded arrays serialized for a full-document write.
struct DocumentColumns {
    notifications: String,
    donations_made: String,
    donation_requests_followed: String,
    donations_received: String,
    needs: String,
    active_donors: String,
}

impl DocumentColumns {
    fn of(account: &Account) -> AppResult<Self> {
        let empty = "[]".to_string();
        let (donor, school) = match &account.kind {
            AccountKind::Donor(p) => (Some(p), None),
            AccountKind::School(p) => (None, Some(p)),
            AccountKind::Admin => (None, None),
        };

        Ok(DocumentColumns {
            notifications: serde_json::to_string(&account.notifications)?,
            donations_made: match donor {
                Some(p) => serde_json::to_string(&p.donations_made)?,
                None => empty.clone(),
            },
            donation_requests_followed: match donor {
                Some(p) => serde_json::to_string(&p.donation_requests_followed)?,
                None => empty.clone(),
            },
            donations_received: match school {
                Some(p) => serde_json::to_string(&p.donations_received)?,
                None => empty.clone(),
            },
            needs: match school {
                Some(p) => serde_json::to_string(&p.needs)?,
                None => empty.clone(),
            },
            active_donors: match school {
                Some(p) => serde_json::to_string(&p.active_donors)?,
                None => empty,
            },
        })
    }
}

impl AccountRepository {
    pub async fn create(pool: &SqlitePool, account: CreateAccount) -> AppResult<Account> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let needs = serde_json::to_string(&account.needs)?;

        let row = sqlx::query(
            r#"
            INSERT INTO accounts (id, name, email, role, needs, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING
                id, name, email, role,
                notifications, donations_made, donation_requests_followed,
                donations_received, needs, active_donors,
                version, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(account.name)
        .bind(&account.email)
        .bind(account.role.as_str())
        .bind(needs)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict(format!("Email already registered: {}", account.email))
            }
            _ => AppError::Database(e),
        })?;

        account_from_row(&row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Account>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_ACCOUNT))
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn find_by_email(pool: &SqlitePool, email: &str) -> AppResult<Option<Account>> {
        let row = sqlx::query(&format!("{} WHERE email = ?", SELECT_ACCOUNT))
            .bind(email)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        row.as_ref().map(account_from_row).transpose()
    }

    /// Ids of every account with the given role, oldest first.
    pub async fn list_ids_by_role(pool: &SqlitePool, role: Role) -> AppResult<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM accounts WHERE role = ? ORDER BY created_at ASC")
            .bind(role.as_str())
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    /// Donor accounts holding at least one donation made to `school_id`.
    pub async fn find_donors_of_school(
        pool: &SqlitePool,
        school_id: &str,
    ) -> AppResult<Vec<Account>> {
        let rows = sqlx::query(&format!(
            r#"{}
            WHERE role = 'donor'
              AND EXISTS (
                SELECT 1 FROM json_each(accounts.donations_made) AS j
                WHERE json_extract(j.value, '$.schoolId') = ?
              )
            "#,
            SELECT_ACCOUNT
        ))
        .bind(school_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        rows.iter().map(account_from_row).collect()
    }

    /// Locate the donor whose ledger holds the given donation.
    pub async fn find_donor_of_donation(
        pool: &SqlitePool,
        donation_id: &str,
    ) -> AppResult<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT a.id AS id
            FROM accounts AS a, json_each(a.donations_made) AS j
            WHERE a.role = 'donor'
              AND json_extract(j.value, '$.id') = ?
            LIMIT 1
            "#,
        )
        .bind(donation_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.map(|r| r.get("id")))
    }

    /// Atomically append a record to a donor's `donationsMade`.
    ///
    /// Returns false when no donor account with that id exists.
    pub async fn append_donation_made(
        pool: &SqlitePool,
        donor_id: &str,
        record: &DonationRecord,
    ) -> AppResult<bool> {
        let json = serde_json::to_string(record)?;
        let res = sqlx::query(
            r#"
            UPDATE accounts
            SET donations_made = json_insert(donations_made, '$[#]', json(?)),
                version = version + 1,
                updated_at = ?
            WHERE id = ? AND role = 'donor'
            "#,
        )
        .bind(json)
        .bind(Utc::now())
        .bind(donor_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(res.rows_affected() == 1)
    }

    /// Atomically append a notification to an account's inbox.
    pub async fn append_notification(
        pool: &SqlitePool,
        account_id: &str,
        notification: &Notification,
    ) -> AppResult<bool> {
        let json = serde_json::to_string(notification)?;
        let res = sqlx::query(
            r#"
            UPDATE accounts
            SET notifications = json_insert(notifications, '$[#]', json(?)),
                version = version + 1,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(json)
        .bind(Utc::now())
        .bind(account_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(res.rows_affected() == 1)
    }

    pub async fn role_of(pool: &SqlitePool, id: &str) -> AppResult<Option<Role>> {
        let row = sqlx::query("SELECT role FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(row.and_then(|r| Role::from_str(&r.get::<String, _>("role"))))
    }

    /// Apply one school-side ledger event in a single statement.
    ///
    /// Appends `record` to `donationsReceived` and moves the donor tally by
    /// `tally = (donor_id, step)`: an existing entry grows by `step`, a
    /// missing one is listed with a count of one. The event key is recorded
    /// in the same statement.
    ///
    /// Returns false, changing nothing, when `event_id` was already applied or
    /// `record` is already present. `NotFound` when `school_id` is not a
    /// school.
    pub async fn apply_school_event(
        pool: &SqlitePool,
        school_id: &str,
        event_id: &str,
        record: Option<&DonationRecord>,
        tally: Option<(&str, u32)>,
    ) -> AppResult<bool> {
        let record_json = record.map(serde_json::to_string).transpose()?;
        let (tally_donor, tally_step) = match tally {
            Some((donor_id, step)) => (Some(donor_id), i64::from(step)),
            None => (None, 0),
        };

        let res = sqlx::query(
            r#"
            UPDATE accounts
            SET donations_received = CASE
                    WHEN ?3 IS NULL THEN donations_received
                    ELSE json_insert(donations_received, '$[#]', json(?3))
                END,
                active_donors = CASE
                    WHEN ?4 IS NULL THEN active_donors
                    WHEN EXISTS (
                        SELECT 1 FROM json_each(accounts.active_donors) AS d
                        WHERE json_extract(d.value, '$.donorId') = ?4
                    ) THEN (
                        SELECT json_set(
                            accounts.active_donors,
                            d.fullkey || '.donationsMade',
                            json_extract(d.value, '$.donationsMade') + ?5
                        )
                        FROM json_each(accounts.active_donors) AS d
                        WHERE json_extract(d.value, '$.donorId') = ?4
                        LIMIT 1
                    )
                    ELSE json_insert(
                        active_donors, '$[#]',
                        json_object('donorId', ?4, 'donationsMade', 1)
                    )
                END,
                applied_events = json_insert(applied_events, '$[#]', ?2),
                version = version + 1,
                updated_at = ?6
            WHERE id = ?1
              AND role = 'school'
              AND NOT EXISTS (
                SELECT 1 FROM json_each(accounts.applied_events) AS e
                WHERE e.value = ?2
              )
              AND NOT EXISTS (
                SELECT 1 FROM json_each(accounts.donations_received) AS r
                WHERE json_extract(r.value, '$.id') = json_extract(?3, '$.id')
              )
            "#,
        )
        .bind(school_id)
        .bind(event_id)
        .bind(record_json)
        .bind(tally_donor)
        .bind(tally_step)
        .bind(Utc::now())
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        if res.rows_affected() == 1 {
            return Ok(true);
        }
        match Self::role_of(pool, school_id).await? {
            Some(Role::School) => Ok(false),
            _ => Err(AppError::NotFound(format!("School not found: {}", school_id))),
        }
    }

    /// Compare-and-swap on one record of a school's `donationsReceived`.
    ///
    /// `apply` returns whether it changed the record; an unchanged record is
    /// not written. The write only lands while the stored record still has
    /// the status `apply` saw, so appends elsewhere in the array never force
    /// a retry. `Ok(None)` when the school holds no record with that id.
    pub async fn update_donation_received<F>(
        pool: &SqlitePool,
        school_id: &str,
        donation_id: &str,
        max_attempts: u32,
        mut apply: F,
    ) -> AppResult<Option<DonationRecord>>
    where
        F: FnMut(&mut DonationRecord) -> AppResult<bool>,
    {
        for attempt in 1..=max_attempts.max(1) {
            let row = sqlx::query(
                r#"
                SELECT r.fullkey AS path, r.value AS record
                FROM accounts AS a, json_each(a.donations_received) AS r
                WHERE a.id = ? AND a.role = 'school'
                  AND json_extract(r.value, '$.id') = ?
                LIMIT 1
                "#,
            )
            .bind(school_id)
            .bind(donation_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

            let Some(row) = row else {
                return match Self::role_of(pool, school_id).await? {
                    Some(Role::School) => Ok(None),
                    _ => Err(AppError::NotFound(format!("School not found: {}", school_id))),
                };
            };
            let path: String = row.get("path");
            let mut record: DonationRecord = serde_json::from_str(&row.get::<String, _>("record"))?;
            let seen_status = record.status;

            if !apply(&mut record)? {
                return Ok(Some(record));
            }

            let res = sqlx::query(
                r#"
                UPDATE accounts
                SET donations_received = json_set(donations_received, ?1, json(?2)),
                    version = version + 1,
                    updated_at = ?3
                WHERE id = ?4
                  AND json_extract(donations_received, ?1 || '.id') = ?5
                  AND json_extract(donations_received, ?1 || '.status') = ?6
                "#,
            )
            .bind(&path)
            .bind(serde_json::to_string(&record)?)
            .bind(Utc::now())
            .bind(school_id)
            .bind(donation_id)
            .bind(seen_status.as_str())
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

            if res.rows_affected() == 1 {
                return Ok(Some(record));
            }

            tracing::debug!(
                "Record {} on school {} changed underneath write (attempt {}/{}), retrying",
                donation_id,
                school_id,
                attempt,
                max_attempts
            );
        }

        Err(AppError::Conflict(format!(
            "Donation {} on school {} is being modified concurrently",
            donation_id, school_id
        )))
    }

    /// Read-modify-write of one account document under optimistic concurrency.
    ///
    /// `apply` runs against a fresh copy on every attempt; an error from it
    /// aborts without writing. Gives up with `Conflict` after `max_attempts`
    /// lost races.
    pub async fn modify<T, F>(
        pool: &SqlitePool,
        id: &str,
        max_attempts: u32,
        mut apply: F,
    ) -> AppResult<(Account, T)>
    where
        F: FnMut(&mut Account) -> AppResult<T>,
    {
        for attempt in 1..=max_attempts.max(1) {
            let mut account = Self::find_by_id(pool, id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Account not found: {}", id)))?;
            let expected_version = account.version;

            let out = apply(&mut account)?;

            let now = Utc::now();
            let cols = DocumentColumns::of(&account)?;
            let res = sqlx::query(
                r#"
                UPDATE accounts
                SET notifications = ?,
                    donations_made = ?,
                    donation_requests_followed = ?,
                    donations_received = ?,
                    needs = ?,
                    active_donors = ?,
                    version = version + 1,
                    updated_at = ?
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(cols.notifications)
            .bind(cols.donations_made)
            .bind(cols.donation_requests_followed)
            .bind(cols.donations_received)
            .bind(cols.needs)
            .bind(cols.active_donors)
            .bind(now)
            .bind(id)
            .bind(expected_version)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

            if res.rows_affected() == 1 {
                account.version = expected_version + 1;
                account.updated_at = now;
                return Ok((account, out));
            }

            tracing::debug!(
                "Account {} changed underneath write (attempt {}/{}), retrying",
                id,
                attempt,
                max_attempts
            );
        }

        tracing::warn!("Giving up on account {} after {} conflicting writes", id, max_attempts);
        Err(AppError::Conflict(format!(
            "Account {} is being modified concurrently",
            id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{create_account, test_pool};

    fn note(id: &str) -> Notification {
        Notification {
            id: id.to_string(),
            message: "hello".to_string(),
            notification_type: "test".to_string(),
            date: Utc::now(),
            read: false,
            context: NotificationContext::default(),
        }
    }

    #[tokio::test]
    async fn create_and_load_roles() {
        let pool = test_pool().await;
        let school = create_account(&pool, "Hill School", Role::School).await;
        let loaded = AccountRepository::find_by_id(&pool, &school.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.role(), Role::School);
        assert!(loaded.as_school().unwrap().donations_received.is_empty());
        assert!(loaded.as_donor().is_none());

        let by_email = AccountRepository::find_by_email(&pool, &school.email)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_email.id, school.id);
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let pool = test_pool().await;
        let first = create_account(&pool, "Ana", Role::Donor).await;
        let err = AccountRepository::create(
            &pool,
            CreateAccount {
                name: "Other".to_string(),
                email: first.email.clone(),
                role: Role::Donor,
                needs: vec![],
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn appends_keep_order_and_bump_version() {
        let pool = test_pool().await;
        let donor = create_account(&pool, "Ana", Role::Donor).await;

        for i in 0..3 {
            assert!(
                AccountRepository::append_notification(&pool, &donor.id, &note(&i.to_string()))
                    .await
                    .unwrap()
            );
        }

        let loaded = AccountRepository::find_by_id(&pool, &donor.id)
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<_> = loaded.notifications.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
        assert_eq!(loaded.version, donor.version + 3);
    }

    #[tokio::test]
    async fn append_to_missing_account_reports_false() {
        let pool = test_pool().await;
        assert!(!AccountRepository::append_notification(&pool, "nobody", &note("x"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn modify_aborts_without_writing_on_error() {
        let pool = test_pool().await;
        let donor = create_account(&pool, "Ana", Role::Donor).await;

        let res: AppResult<(Account, ())> =
            AccountRepository::modify(&pool, &donor.id, 3, |account| {
                account.notifications.push(note("never"));
                Err(AppError::Validation("nope".to_string()))
            })
            .await;
        assert!(matches!(res, Err(AppError::Validation(_))));

        let loaded = AccountRepository::find_by_id(&pool, &donor.id)
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.notifications.is_empty());
        assert_eq!(loaded.version, donor.version);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn modify_retries_when_an_append_races() {
        let pool = test_pool().await;
        let donor = create_account(&pool, "Ana", Role::Donor).await;

        let racer = pool.clone();
        let donor_id = donor.id.clone();
        let mut attempts = 0;
        let (account, _) = AccountRepository::modify(&pool, &donor.id, 3, |account| {
            attempts += 1;
            if attempts == 1 {
                // An append lands between our read and our write.
                let racer = racer.clone();
                let donor_id = donor_id.clone();
                tokio::task::block_in_place(|| {
                    tokio::runtime::Handle::current().block_on(async move {
                        AccountRepository::append_notification(&racer, &donor_id, &note("race"))
                            .await
                            .unwrap();
                    })
                });
            }
            if let Some(profile) = account.as_donor_mut() {
                profile.donation_requests_followed.push("req".to_string());
            }
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(account.notifications.len(), 1);
        assert_eq!(account.notifications[0].id, "race");
        assert_eq!(
            account.as_donor().unwrap().donation_requests_followed,
            vec!["req".to_string()]
        );
    }

    fn received(id: &str) -> DonationRecord {
        DonationRecord {
            id: id.to_string(),
            donor_id: "donor-1".to_string(),
            school_id: None,
            gift: Gift::Money { amount: 10.0 },
            status: Status::Pending,
            date: Utc::now(),
            approval_date: None,
            completion_date: None,
        }
    }

    #[tokio::test]
    async fn school_event_applies_once() {
        let pool = test_pool().await;
        let school = create_account(&pool, "Hill", Role::School).await;
        let record = received("don-1");

        assert!(AccountRepository::apply_school_event(
            &pool,
            &school.id,
            "don-1",
            Some(&record),
            Some(("donor-1", 1)),
        )
        .await
        .unwrap());
        // Same record under another key is still not appended twice.
        assert!(!AccountRepository::apply_school_event(
            &pool,
            &school.id,
            "other-key",
            Some(&record),
            Some(("donor-1", 1)),
        )
        .await
        .unwrap());

        let loaded = AccountRepository::find_by_id(&pool, &school.id)
            .await
            .unwrap()
            .unwrap();
        let profile = loaded.as_school().unwrap();
        assert_eq!(profile.donations_received, vec![record]);
        assert_eq!(profile.active_donors.len(), 1);
        assert_eq!(profile.active_donors[0].donations_made, 1);
        assert_eq!(loaded.version, school.version + 1);

        let donor = create_account(&pool, "Ana", Role::Donor).await;
        let err = AccountRepository::apply_school_event(&pool, &donor.id, "e", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn received_record_update_touches_only_that_record() {
        let pool = test_pool().await;
        let school = create_account(&pool, "Hill", Role::School).await;
        for id in ["a", "b"] {
            AccountRepository::apply_school_event(&pool, &school.id, id, Some(&received(id)), None)
                .await
                .unwrap();
        }

        let updated = AccountRepository::update_donation_received(&pool, &school.id, "b", 3, |r| {
            r.status = Status::Approved;
            Ok(true)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.status, Status::Approved);

        let loaded = AccountRepository::find_by_id(&pool, &school.id)
            .await
            .unwrap()
            .unwrap();
        let records = &loaded.as_school().unwrap().donations_received;
        assert_eq!(records[0].id, "a");
        assert_eq!(records[0].status, Status::Pending);
        assert_eq!(records[1].status, Status::Approved);

        assert!(AccountRepository::update_donation_received(&pool, &school.id, "zzz", 3, |_| {
            Ok(true)
        })
        .await
        .unwrap()
        .is_none());
        let err = AccountRepository::update_donation_received(&pool, "nobody", "a", 3, |_| Ok(true))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn finds_donor_by_donation_id() {
        let pool = test_pool().await;
        let donor = create_account(&pool, "Ana", Role::Donor).await;
        let record = DonationRecord {
            id: "don-1".to_string(),
            donor_id: donor.id.clone(),
            school_id: Some("school-1".to_string()),
            gift: Gift::Money { amount: 10.0 },
            status: Status::Completed,
            date: Utc::now(),
            approval_date: None,
            completion_date: None,
        };
        assert!(AccountRepository::append_donation_made(&pool, &donor.id, &record)
            .await
            .unwrap());

        let found = AccountRepository::find_donor_of_donation(&pool, "don-1")
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some(donor.id.as_str()));
        assert!(AccountRepository::find_donor_of_donation(&pool, "don-2")
            .await
            .unwrap()
            .is_none());

        let donors = AccountRepository::find_donors_of_school(&pool, "school-1")
            .await
            .unwrap();
        assert_eq!(donors.len(), 1);
    }
}
