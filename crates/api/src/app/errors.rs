use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use gatehouse_core::{ACCESS_DENIED_MESSAGE, SecurityError};

/// Handler-level failure.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// A guard refused; carries the denial already rendered for the caller.
    #[error("access denied")]
    Denied(Denial),
}

/// A rendered denial response.
pub struct Denial(pub axum::response::Response);

impl core::fmt::Debug for Denial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Denial").field(&self.0.status()).finish()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::Security(err) => security_error_to_response(err),
            ApiError::Join(err) => {
                error!(error = %err, "handler task failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error")
            }
            ApiError::BadRequest(msg) => json_error(StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Denied(Denial(response)) => response,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn security_error_to_response(err: SecurityError) -> axum::response::Response {
    match err {
        SecurityError::AccessDenied => access_denied_json(),
        SecurityError::AuthFailed => danger(StatusCode::UNAUTHORIZED, err.to_string()),
        SecurityError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        SecurityError::Integrity(msg) => json_error(StatusCode::CONFLICT, "integrity", msg),
        SecurityError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        SecurityError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        SecurityError::Provider(msg) => {
            error!(%msg, "provider failure");
            json_error(StatusCode::BAD_GATEWAY, "provider_error", "identity provider unavailable")
        }
        err @ (SecurityError::Storage(_) | SecurityError::Crypto(_) | SecurityError::Config(_)) => {
            error!(error = %err, kind = err.kind(), "request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.kind(), "internal error")
        }
    }
}

/// The JSON body every denied API call gets.
pub fn access_denied_json() -> axum::response::Response {
    danger(StatusCode::UNAUTHORIZED, ACCESS_DENIED_MESSAGE)
}

fn danger(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "message": message.into(),
            "severity": "danger",
        })),
    )
        .into_response()
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
