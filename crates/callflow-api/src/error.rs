//! API error types and JSON error response formatting.
//!
//! ApiError provides a consistent JSON error response format across all
//! management endpoints, mapping engine errors to HTTP status codes.
//! Internal details are logged, never returned to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use callflow_core::error::CallflowError;
use callflow_engine::{CampaignError, SchedulerError, ScriptError, TrackerError};

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 400 Bad Request - missing or invalid parameters.
    #[error("Bad request: {0}")]
    BadRequest(String),
    /// 404 Not Found - resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// 409 Conflict - lifecycle move not allowed from the current state.
    #[error("Conflict: {0}")]
    Conflict(String),
    /// 422 Unprocessable Entity - script failed validation.
    #[error("Unprocessable: {0}")]
    UnprocessableEntity(String),
    /// 500 Internal Server Error - unexpected server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::UnprocessableEntity(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_entity", msg)
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal API error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorBody {
                error: error_code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

impl From<CallflowError> for ApiError {
    fn from(err: CallflowError) -> Self {
        match err {
            CallflowError::NotFound(msg) => ApiError::NotFound(msg),
            CallflowError::Validation(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ScriptError> for ApiError {
    fn from(err: ScriptError) -> Self {
        ApiError::UnprocessableEntity(err.to_string())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::CampaignNotFound(id) => {
                ApiError::NotFound(format!("Campaign not found: {}", id))
            }
            SchedulerError::Storage(e) => e.into(),
        }
    }
}

impl From<CampaignError> for ApiError {
    fn from(err: CampaignError) -> Self {
        match err {
            CampaignError::NotFound(_) | CampaignError::AgentNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            CampaignError::InvalidScript(e) => e.into(),
            CampaignError::InvalidTransition(..) | CampaignError::Conflict(_) => {
                ApiError::Conflict(err.to_string())
            }
            CampaignError::Validation(msg) => ApiError::BadRequest(msg),
            CampaignError::Scheduler(e) => e.into(),
            CampaignError::Storage(e) => e.into(),
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::CallNotFound(_) | TrackerError::CampaignNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            TrackerError::UnknownStatus(_) => ApiError::BadRequest(err.to_string()),
            TrackerError::Storage(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
