//! Centralized error types for Huddle.
//!
//! Uses `thiserror` for ergonomic error definitions. The variants here are the
//! ones a transport connection can be rejected with before it reaches the Hub,
//! so they convert directly to HTTP responses on the upgrade request.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Errors surfaced while admitting a connection to the Hub.
#[derive(Debug, thiserror::Error)]
pub enum HuddleError {
    // === Auth errors ===
    #[error("Missing auth_token query parameter")]
    MissingToken,

    #[error("Invalid auth token")]
    InvalidToken,

    // === Request errors ===
    #[error("Invalid project ID format")]
    InvalidProjectId,

    // === Permission errors ===
    #[error("Forbidden: you are not a member of this project")]
    NotAMember,

    #[error("Forbidden")]
    Forbidden,

    // === Infrastructure errors ===
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body sent to clients.
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl HuddleError {
    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::InvalidProjectId => StatusCode::BAD_REQUEST,
            Self::NotAMember | Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &str {
        match self {
            Self::MissingToken => "MISSING_TOKEN",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::InvalidProjectId => "INVALID_PROJECT_ID",
            Self::NotAMember => "NOT_A_MEMBER",
            Self::Forbidden => "FORBIDDEN",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for HuddleError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't leak internal details to clients
        let message = match &self {
            HuddleError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            code: status.as_u16(),
            error: self.error_code().to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using HuddleError.
pub type HuddleResult<T> = Result<T, HuddleError>;
