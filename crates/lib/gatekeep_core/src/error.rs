//! Error taxonomy shared by every gatekeep component.

use thiserror::Error;

use crate::token::TokenError;

/// Result type for gatekeep operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Authentication and session errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("User not found")]
    UserNotFound,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Invalid one-time code")]
    InvalidOtp,

    #[error("One-time code expired")]
    OtpExpired,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Whether the error came from a downstream dependency rather than the caller.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Timeout | AuthError::Unavailable(_) => true,
            AuthError::Db(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for AuthError {
    fn from(e: tokio::task::JoinError) -> Self {
        AuthError::Internal(format!("background task failed: {e}"))
    }
}
