//! Authentication flows: login, logout, token rotation, password change and
//! account deletion.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Authenticated, hash_blocking, issue_session, normalize_identifier, verify_blocking,
};
use crate::context::CallContext;
use crate::error::{AuthError, Result};
use crate::models::{Session, TokenPair, TokenPurpose, UserChanges};
use crate::password::{CredentialVerifier, validate_password};
use crate::store::{Stores, unit_of_work};
use crate::token::TokenService;

/// Authentication orchestrator.
#[derive(Clone)]
pub struct AuthService {
    stores: Stores,
    tokens: TokenService,
    credentials: Arc<dyn CredentialVerifier>,
}

impl AuthService {
    pub fn new(stores: Stores, tokens: TokenService, credentials: Arc<dyn CredentialVerifier>) -> Self {
        Self {
            stores,
            tokens,
            credentials,
        }
    }

    /// Sign in with a username or email and a password.
    ///
    /// Tokens are returned only if the refresh session was persisted.
    pub async fn login(
        &self,
        ctx: &CallContext,
        identifier: &str,
        password: &str,
    ) -> Result<Authenticated> {
        let identifier = normalize_identifier(identifier);
        if identifier.is_empty() || password.is_empty() {
            return Err(AuthError::Validation(
                "Identifier and password are required".into(),
            ));
        }

        let user = ctx
            .guard(self.stores.users.get_by_username_or_email(&identifier))
            .await?;
        verify_blocking(
            ctx,
            Arc::clone(&self.credentials),
            user.password_hash.clone(),
            password.to_string(),
        )
        .await?;

        let tokens = issue_session(ctx, &self.tokens, self.stores.sessions.as_ref(), user.id).await?;
        info!(user_id = %user.id, "user logged in");
        Ok(Authenticated { user, tokens })
    }

    /// Revoke one refresh session of `user_id`.
    ///
    /// Idempotent: revoking an unknown or already revoked session succeeds.
    pub async fn logout(&self, ctx: &CallContext, user_id: Uuid, refresh_token: &str) -> Result<()> {
        let refresh_token = refresh_token.trim();
        if refresh_token.is_empty() {
            return Err(AuthError::Validation("Refresh token is required".into()));
        }
        let revoked = ctx
            .guard(self.stores.sessions.revoke(refresh_token, user_id))
            .await?;
        debug!(user_id = %user_id, revoked, "logout");
        Ok(())
    }

    /// Revoke every live session of `user_id`. Returns how many were revoked.
    pub async fn logout_all(&self, ctx: &CallContext, user_id: Uuid) -> Result<u64> {
        let revoked = ctx
            .guard(self.stores.sessions.revoke_all_for_principal(user_id))
            .await?;
        info!(user_id = %user_id, revoked, "all sessions revoked");
        Ok(revoked)
    }

    /// Rotate a refresh token: the presented session is revoked and a new
    /// pair is issued, atomically. A rotated token cannot be replayed.
    pub async fn refresh_token(&self, ctx: &CallContext, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.tokens.validate_for(TokenPurpose::Refresh, refresh_token)?;
        let user_id = claims.user_id()?;

        let pair = self.tokens.issue_access_and_refresh(user_id)?;
        let next = Session::from_refresh_token(user_id, &pair.refresh_token, &pair.refresh_claims)?;
        let presented = refresh_token.to_string();

        ctx.guard(unit_of_work::run(self.stores.uow.as_ref(), move |tx| {
            Box::pin(async move {
                tx.users().get_by_id(user_id).await?;
                tx.sessions()
                    .get_by_token_and_principal(&presented, user_id)
                    .await?;
                // Losing a concurrent rotation shows up as nothing to revoke.
                if !tx.sessions().revoke(&presented, user_id).await? {
                    return Err(AuthError::SessionNotFound);
                }
                tx.sessions().create(&next).await
            })
        }))
        .await?;

        debug!(user_id = %user_id, "refresh token rotated");
        Ok(pair)
    }

    /// Resolve an access token to the ID of an active user.
    pub async fn authenticate(&self, ctx: &CallContext, access_token: &str) -> Result<Uuid> {
        let claims = self.tokens.validate_for(TokenPurpose::Access, access_token)?;
        let user_id = claims.user_id()?;
        ctx.guard(self.stores.users.get_by_id(user_id)).await?;
        Ok(user_id)
    }

    /// Replace the password of `user_id` after checking the current one.
    ///
    /// Verifying the old password and hashing the new one run in parallel;
    /// the first failure is returned without waiting for the other.
    pub async fn change_password(
        &self,
        ctx: &CallContext,
        user_id: Uuid,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        validate_password(new_password)?;
        let user = ctx.guard(self.stores.users.get_by_id(user_id)).await?;

        let ((), new_hash) = tokio::try_join!(
            verify_blocking(
                ctx,
                Arc::clone(&self.credentials),
                user.password_hash,
                old_password.to_string(),
            ),
            hash_blocking(ctx, Arc::clone(&self.credentials), new_password.to_string()),
        )?;

        ctx.guard(
            self.stores
                .users
                .update(user_id, &UserChanges::password(new_hash)),
        )
        .await?;
        info!(user_id = %user_id, "password changed");
        Ok(())
    }

    /// Delete all sessions of `user_id` and soft-delete the user, atomically.
    /// Returns the number of sessions removed.
    pub async fn delete_account(&self, ctx: &CallContext, user_id: Uuid) -> Result<u64> {
        let removed = ctx
            .guard(unit_of_work::run(self.stores.uow.as_ref(), move |tx| {
                Box::pin(async move {
                    tx.users().get_by_id(user_id).await?;
                    let removed = tx.sessions().delete_all_for_principal(user_id).await?;
                    tx.users().soft_delete(user_id).await?;
                    Ok::<_, AuthError>(removed)
                })
            }))
            .await?;
        info!(user_id = %user_id, sessions = removed, "account deleted");
        Ok(removed)
    }
}
