use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

pub mod accounts;
pub mod admin;
pub mod donations;
pub mod health;
pub mod identity;
pub mod notifications;
pub mod requests;

/// All routes with state attached. Transport layers (tracing, CORS) are added
/// by the caller.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/donations", donations::router())
        .nest("/api/requests", requests::router())
        .nest("/api/accounts", accounts::router())
        .nest("/api/notifications", notifications::router())
        .nest("/api/admin", admin::router())
        .with_state(state)
        .layer(axum::middleware::from_fn(
            crate::middleware::headers::security_headers,
        ))
}
