//! Application error types.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use gatekeep_core::AuthError;
use gatekeep_core::token::TokenError;
use thiserror::Error;
use tracing::error;

use crate::models::ErrorResponse;

/// Convenience alias for handler return types.
pub type AppResult<T> = Result<T, AppError>;

/// Shown for both wrong and expired one-time codes.
pub const INVALID_CODE_MESSAGE: &str = "Invalid or expired verification code";

/// Application-level errors with HTTP status mapping.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many requests")]
    RateLimited,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            AppError::Validation(m) => (StatusCode::BAD_REQUEST, "validation_error", m.as_str()),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.as_str()),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "unauthorized", m.as_str()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m.as_str()),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests",
            ),
            AppError::Unavailable(m) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", m.as_str())
            }
            AppError::Internal(detail) => {
                error!(detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error",
                )
            }
        };
        let body = Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        });
        let mut response = (status, body).into_response();
        if matches!(self, AppError::RateLimited) {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::UserNotFound => AppError::NotFound("User not found".into()),
            AuthError::SessionNotFound => {
                AppError::Unauthorized("Session not found or revoked".into())
            }
            AuthError::InvalidPassword => AppError::Unauthorized("Invalid credentials".into()),
            AuthError::Conflict(m) => AppError::Conflict(m),
            AuthError::Token(TokenError::Encoding(m)) => AppError::Internal(m),
            AuthError::Token(TokenError::AlreadyUsed) => {
                AppError::Unauthorized("Token already used".into())
            }
            AuthError::Token(_) => AppError::Unauthorized("Invalid or expired token".into()),
            AuthError::InvalidOtp | AuthError::OtpExpired => {
                AppError::Validation(INVALID_CODE_MESSAGE.into())
            }
            AuthError::RateLimited => AppError::RateLimited,
            AuthError::Validation(m) => AppError::Validation(m),
            AuthError::Timeout => AppError::Unavailable("Request timed out".into()),
            AuthError::Unavailable(m) => AppError::Unavailable(m),
            e @ AuthError::Db(_) if e.is_transient() => {
                AppError::Unavailable("Database unavailable".into())
            }
            AuthError::Db(e) => AppError::Internal(e.to_string()),
            AuthError::Internal(m) => AppError::Internal(m),
        }
    }
}
