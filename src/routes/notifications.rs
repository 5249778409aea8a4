use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::db::Notification;
use crate::error::AppResult;
use crate::routes::identity::CurrentActor;
use crate::services::notifications::InboxService;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_notifications))
        .route("/:id/read", post(mark_read))
}

#[derive(Debug, Deserialize)]
pub struct ListNotificationsQuery {
    #[serde(default)]
    pub unread_only: bool,
}

/// The caller's inbox, most recent first.
async fn list_notifications(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Query(query): Query<ListNotificationsQuery>,
) -> AppResult<Json<Vec<Notification>>> {
    let items = InboxService::list(&state.db, &actor.account_id, query.unread_only).await?;
    Ok(Json(items))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
) -> AppResult<Json<Notification>> {
    let notification = InboxService::mark_read(
        &state.db,
        &actor.account_id,
        &id,
        state.config.ledger.max_write_attempts,
    )
    .await?;
    Ok(Json(notification))
}
