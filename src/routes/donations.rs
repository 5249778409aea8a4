use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post},
    Json, Router,
};
use serde::Deserialize;

use crate::db::{CreateDonation, DonationRecord, Status};
use crate::error::AppResult;
use crate::routes::identity::CurrentActor;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_donation))
        .route("/:id/status", post(transition_donation))
        .route("/:id", delete(delete_donation))
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: Status,
}

async fn create_donation(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Json(body): Json<CreateDonation>,
) -> AppResult<(StatusCode, Json<DonationRecord>)> {
    let record = state.lifecycle.create_donation(&actor, body).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn transition_donation(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> AppResult<Json<DonationRecord>> {
    let record = state
        .lifecycle
        .transition_donation(&actor, &id, body.status)
        .await?;
    Ok(Json(record))
}

async fn delete_donation(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.lifecycle.delete_donation(&actor, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
