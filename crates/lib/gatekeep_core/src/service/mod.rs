//! Orchestrators: the business flows built on the token service, the
//! credential verifier and the storage contracts.

pub mod auth;
pub mod profile;
pub mod verification;

use std::sync::Arc;

use uuid::Uuid;

use crate::context::CallContext;
use crate::error::{AuthError, Result};
use crate::models::{Session, TokenPair, User};
use crate::password::CredentialVerifier;
use crate::store::SessionRepository;
use crate::token::TokenService;

pub use auth::AuthService;
pub use profile::{ProfileService, UpdateProfile};
pub use verification::{NewAccount, VerificationDeps, VerificationService};

/// A signed-in user with a freshly issued token pair.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub user: User,
    pub tokens: TokenPair,
}

/// Lowercase and trim an email address.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Usernames are matched as given; emails case-insensitively.
pub(crate) fn normalize_identifier(identifier: &str) -> String {
    let trimmed = identifier.trim();
    if trimmed.contains('@') {
        trimmed.to_lowercase()
    } else {
        trimmed.to_string()
    }
}

pub(crate) fn validate_email(email: &str) -> Result<()> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(AuthError::Validation("Invalid email address".into()))
    }
}

/// 3 to 32 characters of ASCII letters, digits, `_`, `-` or `.`, and no `@`
/// so a username can never be confused with an email at login.
pub(crate) fn validate_username(username: &str) -> Result<()> {
    let len = username.chars().count();
    if !(3..=32).contains(&len) {
        return Err(AuthError::Validation(
            "Username must be between 3 and 32 characters".into(),
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(AuthError::Validation(
            "Username may only contain letters, digits, '_', '-' and '.'".into(),
        ));
    }
    Ok(())
}

/// Verify `plain` against `digest` on the blocking pool, under `ctx`.
pub(crate) async fn verify_blocking(
    ctx: &CallContext,
    verifier: Arc<dyn CredentialVerifier>,
    digest: String,
    plain: String,
) -> Result<()> {
    let matches = ctx
        .guard(async move {
            let matches =
                tokio::task::spawn_blocking(move || verifier.verify(&digest, &plain)).await?;
            Ok::<_, AuthError>(matches)
        })
        .await?;
    if matches {
        Ok(())
    } else {
        Err(AuthError::InvalidPassword)
    }
}

/// Hash `plain` on the blocking pool, under `ctx`.
pub(crate) async fn hash_blocking(
    ctx: &CallContext,
    verifier: Arc<dyn CredentialVerifier>,
    plain: String,
) -> Result<String> {
    ctx.guard(async move { tokio::task::spawn_blocking(move || verifier.hash(&plain)).await? })
        .await
}

/// Issue an access/refresh pair and persist the refresh session.
///
/// The tokens are only returned once the session is stored.
pub(crate) async fn issue_session(
    ctx: &CallContext,
    tokens: &TokenService,
    sessions: &dyn SessionRepository,
    user_id: Uuid,
) -> Result<TokenPair> {
    let pair = tokens.issue_access_and_refresh(user_id)?;
    let session = Session::from_refresh_token(user_id, &pair.refresh_token, &pair.refresh_claims)?;
    ctx.guard(sessions.create(&session)).await?;
    Ok(pair)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_normalized() {
        assert_eq!(normalize_email("  John@Example.COM "), "john@example.com");
        assert_eq!(normalize_identifier(" John "), "John");
        assert_eq!(normalize_identifier("John@Example.com"), "john@example.com");
    }

    #[test]
    fn email_shape_is_checked() {
        assert!(validate_email("a@b.co").is_ok());
        for bad in ["", "plain", "@b.co", "a@b", "a@.b", "a @b.co"] {
            assert!(validate_email(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("john_doe-1.x").is_ok());
        assert!(validate_username("jo").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
        assert!(validate_username("john@doe").is_err());
        assert!(validate_username("john doe").is_err());
    }
}
