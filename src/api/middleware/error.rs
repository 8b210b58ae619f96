//! Unified API error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use crate::api::models::ErrorResponse;
use crate::error::LedgerError;

/// API-specific error type.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Invalid request parameters.
    BadRequest(String),
    /// Missing or wrong admin credentials.
    Unauthorized,
    /// Internal server error.
    InternalError(String),
    /// Rate limit exceeded.
    RateLimitExceeded,
    /// Database operation failed.
    DatabaseError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Missing or invalid admin token".to_string(),
            ),
            Self::RateLimitExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_exceeded",
                "Rate limit exceeded. Please try again later.".to_string(),
            ),
            Self::DatabaseError(msg) => {
                error!(error = %msg, "Database error in API handler");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "Database operation failed".to_string(),
                )
            }
            Self::InternalError(msg) => {
                error!(error = %msg, "Internal error in API handler");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::DatabaseError { message, .. } => Self::DatabaseError(message),
            LedgerError::NoPrice { chain_id, token } => {
                Self::NotFound(format!("no price for {token} on chain {chain_id}"))
            }
            LedgerError::StateError { message, .. } => Self::NotFound(message),
            other => Self::InternalError(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(err.to_string())
    }
}
