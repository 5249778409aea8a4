use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{CreateDonationRequest, DonationRequest, DonationRequestFilter, Status};
use crate::error::AppResult;
use crate::routes::donations::StatusBody;
use crate::routes::identity::CurrentActor;
use crate::services::notifications::FanoutReport;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_requests).post(create_request))
        .route("/:id/respond", post(respond_to_request))
        .route("/:id/status", post(transition_request))
        .route("/:id/follow", post(follow_request))
        .route("/:id", delete(delete_request))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequestsQuery {
    pub school_id: Option<String>,
    pub status: Option<Status>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreatedRequest {
    pub request: DonationRequest,
    pub fanout: FanoutReport,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondBody {
    /// Defaults to the caller. Admins may answer on a donor's behalf.
    pub donor_id: Option<String>,
    pub status: Status,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowResponse {
    pub donation_requests_followed: Vec<String>,
}

async fn list_requests(
    State(state): State<Arc<AppState>>,
    CurrentActor(_actor): CurrentActor,
    Query(query): Query<ListRequestsQuery>,
) -> AppResult<Json<Vec<DonationRequest>>> {
    let filter = DonationRequestFilter {
        school_id: query.school_id,
        status: query.status,
        from: query.from,
        to: query.to,
    };
    Ok(Json(state.lifecycle.list_requests(&filter).await?))
}

async fn create_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Json(body): Json<CreateDonationRequest>,
) -> AppResult<(StatusCode, Json<CreatedRequest>)> {
    let (request, fanout) = state.lifecycle.create_request(&actor, body).await?;
    Ok((StatusCode::CREATED, Json(CreatedRequest { request, fanout })))
}

async fn respond_to_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
    Json(body): Json<RespondBody>,
) -> AppResult<Json<DonationRequest>> {
    let donor_id = body
        .donor_id
        .unwrap_or_else(|| actor.account_id.clone());
    let request = state
        .lifecycle
        .respond_to_request(&actor, &id, &donor_id, body.status)
        .await?;
    Ok(Json(request))
}

async fn transition_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> AppResult<Json<DonationRequest>> {
    let request = state
        .lifecycle
        .transition_request(&actor, &id, body.status)
        .await?;
    Ok(Json(request))
}

async fn follow_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
) -> AppResult<Json<FollowResponse>> {
    let followed = state.lifecycle.follow_request(&actor, &id).await?;
    Ok(Json(FollowResponse {
        donation_requests_followed: followed,
    }))
}

async fn delete_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.lifecycle.delete_request(&actor, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
