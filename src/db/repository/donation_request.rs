use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::*;
use crate::error::{AppError, AppResult};

// ============================================================================
// Donation Request Repository
// ============================================================================

pub struct DonationRequestRepository;

const SELECT_REQUEST: &str = r#"
    SELECT
        id, school_id, donor_id, donation_needs, custom_request, status, donors,
        request_approval_date, request_completion_date, request_rejection_date,
        date, version
    FROM donation_requests
"#;

fn request_from_row(row: &SqliteRow) -> AppResult<DonationRequest> {
    let status_raw: String = row.get("status");
    let status = Status::from_str(&status_raw).ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("Unknown request status: {}", status_raw))
    })?;
    let needs: String = row.get("donation_needs");
    let donors: String = row.get("donors");

    Ok(DonationRequest {
        id: row.get("id"),
        school_id: row.get("school_id"),
        donor_id: row.get("donor_id"),
        donation_needs: serde_json::from_str(&needs)?,
        custom_request: row.get("custom_request"),
        status,
        donors: serde_json::from_str(&donors)?,
        request_approval_date: row.get("request_approval_date"),
        request_completion_date: row.get("request_completion_date"),
        request_rejection_date: row.get("request_rejection_date"),
        date: row.get("date"),
        version: row.get("version"),
    })
}

impl DonationRequestRepository {
    pub async fn create(
        pool: &SqlitePool,
        request: CreateDonationRequest,
    ) -> AppResult<DonationRequest> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let needs = serde_json::to_string(&request.donation_needs)?;

        let row = sqlx::query(
            r#"
            INSERT INTO donation_requests (
                id, school_id, donor_id, donation_needs, custom_request,
                status, donors, date, version
            )
            VALUES (?, ?, NULL, ?, ?, ?, '[]', ?, 0)
            RETURNING
                id, school_id, donor_id, donation_needs, custom_request, status, donors,
                request_approval_date, request_completion_date, request_rejection_date,
                date, version
            "#,
        )
        .bind(id)
        .bind(request.school_id)
        .bind(needs)
        .bind(request.custom_request)
        .bind(Status::Pending.as_str())
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        request_from_row(&row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<DonationRequest>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_REQUEST))
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        row.as_ref().map(request_from_row).transpose()
    }

    /// Requests matching the optional filters, newest first.
    pub async fn list(
        pool: &SqlitePool,
        filter: &DonationRequestFilter,
    ) -> AppResult<Vec<DonationRequest>> {
        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query(&format!(
            r#"{}
            WHERE (? IS NULL OR school_id = ?)
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR julianday(date) >= julianday(?))
              AND (? IS NULL OR julianday(date) <= julianday(?))
            ORDER BY julianday(date) DESC
            "#,
            SELECT_REQUEST
        ))
        .bind(filter.school_id.as_deref())
        .bind(filter.school_id.as_deref())
        .bind(status)
        .bind(status)
        .bind(filter.from)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.to)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        rows.iter().map(request_from_row).collect()
    }

    /// Compare-and-swap update of a request document. Same contract as
    /// `AccountRepository::modify`.
    pub async fn modify<T, F>(
        pool: &SqlitePool,
        id: &str,
        max_attempts: u32,
        mut apply: F,
    ) -> AppResult<(DonationRequest, T)>
    where
        F: FnMut(&mut DonationRequest) -> AppResult<T>,
    {
        for attempt in 1..=max_attempts.max(1) {
            let mut request = Self::find_by_id(pool, id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Donation request not found: {}", id)))?;
            let expected_version = request.version;

            let out = apply(&mut request)?;

            let res = sqlx::query(
                r#"
                UPDATE donation_requests
                SET donor_id = ?,
                    donation_needs = ?,
                    custom_request = ?,
                    status = ?,
                    donors = ?,
                    request_approval_date = ?,
                    request_completion_date = ?,
                    request_rejection_date = ?,
                    version = version + 1
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(request.donor_id.as_deref())
            .bind(serde_json::to_string(&request.donation_needs)?)
            .bind(request.custom_request.as_deref())
            .bind(request.status.as_str())
            .bind(serde_json::to_string(&request.donors)?)
            .bind(request.request_approval_date)
            .bind(request.request_completion_date)
            .bind(request.request_rejection_date)
            .bind(id)
            .bind(expected_version)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

            if res.rows_affected() == 1 {
                request.version = expected_version + 1;
                return Ok((request, out));
            }

            tracing::debug!(
                "Donation request {} changed underneath write (attempt {}/{}), retrying",
                id,
                attempt,
                max_attempts
            );
        }

        Err(AppError::Conflict(format!(
            "Donation request {} is being modified concurrently",
            id
        )))
    }

    /// Hard delete. Returns false when nothing was deleted.
    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM donation_requests WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(res.rows_affected() > 0)
    }
}
