use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::db::DonationRecord;
use crate::error::AppResult;
use crate::routes::identity::CurrentActor;
use crate::services::lifecycle::LedgerQuery;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/:id/ledger", get(account_ledger))
}

#[derive(Debug, Deserialize)]
pub struct LedgerRangeQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// `donationsMade` for a donor, `donationsReceived` for a school.
async fn account_ledger(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
    Query(range): Query<LedgerRangeQuery>,
) -> AppResult<Json<Vec<DonationRecord>>> {
    let records = state
        .lifecycle
        .account_ledger(
            &actor,
            &id,
            &LedgerQuery {
                from: range.from,
                to: range.to,
            },
        )
        .await?;
    Ok(Json(records))
}
