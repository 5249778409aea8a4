use std::sync::Arc;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::db::Role;
use crate::error::AppError;
use crate::services::lifecycle::Actor;
use crate::AppState;

pub const ACCOUNT_ID_HEADER: &str = "x-account-id";
pub const ACCOUNT_ROLE_HEADER: &str = "x-account-role";

/// Caller identity forwarded by the upstream auth layer.
///
/// The headers are trusted as given; credentials are verified before requests
/// reach this service.
pub struct CurrentActor(pub Actor);

fn header<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            tracing::debug!("Missing or invalid {} header", name);
            AppError::Unauthorized
        })
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentActor {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let account_id = header(parts, ACCOUNT_ID_HEADER)?;
        let raw_role = header(parts, ACCOUNT_ROLE_HEADER)?;
        let role = Role::from_str(raw_role).ok_or_else(|| {
            tracing::debug!("Unknown account role {:?}", raw_role);
            AppError::Unauthorized
        })?;

        Ok(CurrentActor(Actor::new(account_id, role)))
    }
}

/// Like [`CurrentActor`] but rejects anyone who is not an admin.
pub struct AdminActor(pub Actor);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminActor {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let CurrentActor(actor) = CurrentActor::from_request_parts(parts, state).await?;
        if !actor.is_admin() {
            return Err(AppError::Forbidden);
        }
        Ok(AdminActor(actor))
    }
}
