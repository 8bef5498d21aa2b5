//! Identity domain models.
//!
//! These are internal domain models, distinct from the request/response
//! bodies of `gatekeep_api` (which use camelCase on the wire).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AuthError, Result};

/// Domain user (principal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker. Deleted users are not resolvable by regular lookups.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Fields required to create a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
}

/// Partial update of a user; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub password_hash: Option<String>,
}

impl UserChanges {
    pub fn password(hash: String) -> Self {
        Self {
            password_hash: Some(hash),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.first_name.is_none()
            && self.last_name.is_none()
            && self.password_hash.is_none()
    }

    /// Apply the changes to an in-memory user, bumping `updated_at`.
    pub fn apply(&self, user: &mut User, now: DateTime<Utc>) {
        if let Some(username) = &self.username {
            user.username = username.clone();
        }
        if let Some(first_name) = &self.first_name {
            user.first_name = first_name.clone();
        }
        if let Some(last_name) = &self.last_name {
            user.last_name = last_name.clone();
        }
        if let Some(hash) = &self.password_hash {
            user.password_hash = hash.clone();
        }
        user.updated_at = now;
    }
}

/// Refresh session record backing one issued refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Build a session whose timestamps mirror the refresh token's claims.
    ///
    /// Session IDs are v7 so they sort by creation time.
    pub fn from_refresh_token(user_id: Uuid, token: &str, claims: &Claims) -> Result<Self> {
        Ok(Self {
            id: Uuid::now_v7(),
            user_id,
            token: token.to_string(),
            issued_at: claims.issued_at()?,
            expires_at: claims.expires_at()?,
            revoked: false,
            created_at: Utc::now(),
        })
    }
}

/// The intent a token was minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPurpose {
    Access,
    Refresh,
    Register,
    Restore,
}

impl TokenPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenPurpose::Access => "access",
            TokenPurpose::Refresh => "refresh",
            TokenPurpose::Register => "register",
            TokenPurpose::Restore => "restore",
        }
    }
}

impl fmt::Display for TokenPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Email-verification flows gated by one-time codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationFlow {
    Registration,
    Restore,
}

impl VerificationFlow {
    /// Purpose of the token that unlocks the flow's completion step.
    pub fn purpose(self) -> TokenPurpose {
        match self {
            VerificationFlow::Registration => TokenPurpose::Register,
            VerificationFlow::Restore => TokenPurpose::Restore,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerificationFlow::Registration => "registration",
            VerificationFlow::Restore => "restore",
        }
    }
}

impl fmt::Display for VerificationFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JWT claims embedded in every gatekeep token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub purpose: TokenPurpose,
    /// Subject: user ID for access/refresh tokens, verified email for scoped tokens.
    pub sub: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiry (unix timestamp).
    pub exp: i64,
    /// Unique token ID.
    pub jti: String,
}

impl Claims {
    pub fn issued_at(&self) -> Result<DateTime<Utc>> {
        timestamp(self.iat)
    }

    pub fn expires_at(&self) -> Result<DateTime<Utc>> {
        timestamp(self.exp)
    }

    /// Parse the subject as a user ID.
    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub)
            .map_err(|_| AuthError::Token(crate::token::TokenError::Malformed("subject".into())))
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AuthError::Internal(format!("timestamp out of range: {secs}")))
}

/// Access + refresh token pair returned by login-like flows.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    /// Claims of the refresh token, mirrored into the persisted session.
    pub refresh_claims: Claims,
}
