//! Purpose-scoped JWT issuance and verification.
//!
//! Every token carries a [`TokenPurpose`] claim and is signed with the secret
//! of that purpose. Validation requires both the right secret and the right
//! purpose, so an access token can never stand in for a restore token even
//! when it is structurally valid.

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{AuthConfig, TokenLifetimes, TokenSecrets};
use crate::models::{Claims, TokenPair, TokenPurpose};

/// Token validation and issuance errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("token purpose mismatch: expected {expected}, found {found}")]
    PurposeMismatch {
        expected: TokenPurpose,
        found: TokenPurpose,
    },

    #[error("token already used")]
    AlreadyUsed,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token encoding failed: {0}")]
    Encoding(String),
}

/// A freshly minted token with the claims it encodes.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

/// Mint a token for `subject` under `secret`, valid for `ttl`.
pub fn issue_scoped_token(
    secret: &[u8],
    ttl: Duration,
    subject: &str,
    purpose: TokenPurpose,
) -> Result<IssuedToken, TokenError> {
    let now = Utc::now();
    let claims = Claims {
        purpose,
        sub: subject.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
        jti: Uuid::new_v4().to_string(),
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| TokenError::Encoding(e.to_string()))?;
    Ok(IssuedToken { token, claims })
}

/// Verify `token` under `secret` and require it to carry `expected` purpose.
pub fn validate_token(
    secret: &[u8],
    token: &str,
    expected: TokenPurpose,
) -> Result<Claims, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_exp = true;
    validation.set_required_spec_claims(&["exp", "iat", "sub"]);

    let claims = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidSignature => TokenError::InvalidSignature,
            ErrorKind::ExpiredSignature => TokenError::Expired,
            other => TokenError::Malformed(format!("{other:?}")),
        })?
        .claims;

    match (expected, claims.purpose) {
        (TokenPurpose::Access, TokenPurpose::Access)
        | (TokenPurpose::Refresh, TokenPurpose::Refresh)
        | (TokenPurpose::Register, TokenPurpose::Register)
        | (TokenPurpose::Restore, TokenPurpose::Restore) => Ok(claims),
        (expected, found) => Err(TokenError::PurposeMismatch { expected, found }),
    }
}

/// Stateless token service bound to the configured secrets and lifetimes.
#[derive(Debug, Clone)]
pub struct TokenService {
    secrets: TokenSecrets,
    lifetimes: TokenLifetimes,
}

impl TokenService {
    pub fn new(secrets: TokenSecrets, lifetimes: TokenLifetimes) -> Self {
        Self { secrets, lifetimes }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.secrets.clone(), config.lifetimes)
    }

    /// Secret used for `purpose`.
    pub fn secret(&self, purpose: TokenPurpose) -> &[u8] {
        self.secrets.for_purpose(purpose)
    }

    /// Mint an access token and a refresh token for a user.
    pub fn issue_access_and_refresh(&self, user_id: Uuid) -> Result<TokenPair, TokenError> {
        let subject = user_id.to_string();
        let access = self.issue_for(TokenPurpose::Access, &subject)?;
        let refresh = self.issue_for(TokenPurpose::Refresh, &subject)?;
        let access_expires_at = chrono::DateTime::from_timestamp(access.claims.exp, 0)
            .ok_or_else(|| TokenError::Encoding("expiry out of range".into()))?;
        Ok(TokenPair {
            access_token: access.token,
            refresh_token: refresh.token,
            access_expires_at,
            refresh_claims: refresh.claims,
        })
    }

    /// Mint a token for `purpose` with its configured secret and lifetime.
    pub fn issue_for(&self, purpose: TokenPurpose, subject: &str) -> Result<IssuedToken, TokenError> {
        issue_scoped_token(
            self.secret(purpose),
            self.lifetimes.for_purpose(purpose),
            subject,
            purpose,
        )
    }

    /// Validate a token against the configured secret for `purpose`.
    pub fn validate_for(&self, purpose: TokenPurpose, token: &str) -> Result<Claims, TokenError> {
        validate_token(self.secret(purpose), token, purpose)
    }
}
