use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::db::Status;
use crate::services::ledger::LedgerRepair;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Access denied")]
    Forbidden,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("Partial ledger write: {0}")]
    PartialLedgerWrite(Box<PartialWrite>),

    #[error("Notification delivery failed: {0}")]
    NotificationDelivery(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// The half of a dual write that was applied, and the repair for the half
/// that was not.
#[derive(Debug, Clone, Serialize)]
pub struct PartialWrite {
    pub donation_id: String,
    pub repair: LedgerRepair,
    pub cause: String,
}

impl std::fmt::Display for PartialWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "donation {} committed on the first ledger only ({}); pending {}",
            self.donation_id,
            self.cause,
            self.repair.describe()
        )
    }
}

/// What an error means for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Nothing was written; the same call can be retried as is.
    NothingApplied,
    /// One ledger was written; only the attached repair may be retried.
    HalfApplied,
}

impl AppError {
    pub fn partial(
        donation_id: impl Into<String>,
        repair: LedgerRepair,
        cause: &AppError,
    ) -> AppError {
        AppError::PartialLedgerWrite(Box::new(PartialWrite {
            donation_id: donation_id.into(),
            repair,
            cause: cause.to_string(),
        }))
    }

    pub fn outcome(&self) -> WriteOutcome {
        match self {
            AppError::PartialLedgerWrite(_) => WriteOutcome::HalfApplied,
            _ => WriteOutcome::NothingApplied,
        }
    }

    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
            AppError::InvalidTransition { .. } => {
                (StatusCode::CONFLICT, "INVALID_TRANSITION", self.to_string())
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::PartialLedgerWrite(partial) => {
                tracing::error!("Partial ledger write: {}", partial);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "PARTIAL_LEDGER_WRITE",
                    "The donation was recorded on one ledger only; retry the attached repair"
                        .to_string(),
                )
            }
            AppError::NotificationDelivery(msg) => {
                tracing::warn!("Notification delivery error reached the HTTP layer: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "NOTIFICATION_ERROR",
                    "Notification delivery failed".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Serialization(e) => {
                tracing::error!("Serialization error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "SERIALIZATION_ERROR",
                    "Stored document could not be decoded".to_string(),
                )
            }
            AppError::Config(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "Server configuration error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Partial writes always carry their repair so callers can finish the
        // missing half without replaying the whole operation.
        let details = match &self {
            AppError::PartialLedgerWrite(partial) => serde_json::to_value(partial.as_ref()).ok(),
            _ => None,
        };
        AppErrorWithDetails {
            error: self,
            details,
        }
        .into_response()
    }
}

struct AppErrorWithDetails {
    error: AppError,
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppErrorWithDetails {
    fn into_response(self) -> Response {
        let (status, code, message) = self.error.parts();

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details: self.details,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
