//! Email-verification flows: registration and account restore.
//!
//! Both flows run the same three steps:
//!
//! 1. [`send_otp`](VerificationService::send_otp) mails a one-time code,
//! 2. [`verify_otp`](VerificationService::verify_otp) trades the code for a
//!    short-lived scoped token whose subject is the verified email,
//! 3. `complete_*` spends that token, at most once, to finish the flow.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use super::{Authenticated, hash_blocking, normalize_email, validate_email, validate_username};
use crate::config::{OtpConfig, RateLimitConfig};
use crate::context::CallContext;
use crate::error::{AuthError, Result};
use crate::ledger::{MemoryTokenLedger, TokenLedger};
use crate::models::{Claims, NewUser, Session, TokenPurpose, UserChanges, VerificationFlow};
use crate::otp::{MemoryOtpStore, OtpDelivery, OtpStore, generate_code};
use crate::password::{CredentialVerifier, validate_password};
use crate::rate_limit::RateLimiter;
use crate::store::{Stores, unit_of_work};
use crate::token::{IssuedToken, TokenError, TokenService};

/// Profile fields supplied when completing registration.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}

/// Collaborators specific to the verification flows.
#[derive(Clone)]
pub struct VerificationDeps {
    pub otps: Arc<dyn OtpStore>,
    pub delivery: Arc<dyn OtpDelivery>,
    pub ledger: Arc<dyn TokenLedger>,
    /// Per-email limit on code sends.
    pub limiter: Arc<RateLimiter>,
}

impl VerificationDeps {
    /// In-process code store and ledger around `delivery`.
    pub fn in_memory(delivery: Arc<dyn OtpDelivery>, otp_rate_limit: RateLimitConfig) -> Self {
        Self {
            otps: Arc::new(MemoryOtpStore::new()),
            delivery,
            ledger: Arc::new(MemoryTokenLedger::new()),
            limiter: Arc::new(RateLimiter::new(otp_rate_limit)),
        }
    }
}

#[derive(Clone)]
pub struct VerificationService {
    stores: Stores,
    tokens: TokenService,
    credentials: Arc<dyn CredentialVerifier>,
    deps: VerificationDeps,
    otp: OtpConfig,
}

impl VerificationService {
    pub fn new(
        stores: Stores,
        tokens: TokenService,
        credentials: Arc<dyn CredentialVerifier>,
        deps: VerificationDeps,
        otp: OtpConfig,
    ) -> Self {
        Self {
            stores,
            tokens,
            credentials,
            deps,
            otp,
        }
    }

    /// Generate, store and deliver a one-time code for `email`.
    ///
    /// Registration requires the email to be free; restore requires an
    /// account with that email, deleted or not.
    pub async fn send_otp(&self, ctx: &CallContext, flow: VerificationFlow, email: &str) -> Result<()> {
        let email = normalize_email(email);
        validate_email(&email)?;
        self.deps.limiter.check(&email)?;

        match flow {
            VerificationFlow::Registration => {
                let taken = ctx
                    .guard(self.stores.users.is_email_taken(&email, None))
                    .await?;
                if taken {
                    return Err(AuthError::Conflict("Email already registered".into()));
                }
            }
            VerificationFlow::Restore => {
                ctx.guard(self.stores.users.get_by_email_including_deleted(&email))
                    .await?;
            }
        }

        let code = generate_code(self.otp.length);
        let ttl = self
            .otp
            .ttl
            .to_std()
            .map_err(|e| AuthError::Internal(format!("invalid OTP lifetime: {e}")))?;
        ctx.guard(self.deps.otps.issue(flow, &email, &code, ttl)).await?;
        ctx.guard(self.deps.delivery.deliver(flow, &email, &code)).await?;
        info!(%flow, "one-time code sent");
        Ok(())
    }

    /// Check a code and, on success, issue the scoped token for `flow`.
    ///
    /// The code is consumed by a successful check.
    pub async fn verify_otp(
        &self,
        ctx: &CallContext,
        flow: VerificationFlow,
        email: &str,
        code: &str,
    ) -> Result<IssuedToken> {
        let email = normalize_email(email);
        let code = code.trim();
        if email.is_empty() || code.is_empty() {
            return Err(AuthError::Validation("Email and code are required".into()));
        }
        ctx.guard(self.deps.otps.verify(flow, &email, code)).await?;
        let issued = self.tokens.issue_for(flow.purpose(), &email)?;
        info!(%flow, "email verified");
        Ok(issued)
    }

    /// Create the account unlocked by a register token and sign it in.
    ///
    /// The account and its first session are written in one unit of work. If
    /// that fails, nothing is stored and the token can be presented again.
    pub async fn complete_registration(
        &self,
        ctx: &CallContext,
        register_token: &str,
        account: NewAccount,
    ) -> Result<Authenticated> {
        let claims = self.tokens.validate_for(TokenPurpose::Register, register_token)?;
        let username = account.username.trim().to_string();
        validate_username(&username)?;
        validate_password(&account.password)?;

        let password_hash =
            hash_blocking(ctx, Arc::clone(&self.credentials), account.password).await?;
        let new_user = NewUser {
            username,
            email: claims.sub.clone(),
            first_name: account.first_name.trim().to_string(),
            last_name: account.last_name.trim().to_string(),
            password_hash,
        };
        let tokens = self.tokens.clone();

        let signed_in = self
            .spend(
                ctx,
                &claims,
                unit_of_work::run(self.stores.uow.as_ref(), move |tx| {
                    Box::pin(async move {
                        if tx.users().is_username_taken(&new_user.username, None).await? {
                            return Err(AuthError::Conflict("Username already taken".into()));
                        }
                        if tx.users().is_email_taken(&new_user.email, None).await? {
                            return Err(AuthError::Conflict("Email already registered".into()));
                        }
                        let user = tx.users().create(new_user).await?;
                        let pair = tokens.issue_access_and_refresh(user.id)?;
                        let session = Session::from_refresh_token(
                            user.id,
                            &pair.refresh_token,
                            &pair.refresh_claims,
                        )?;
                        tx.sessions().create(&session).await?;
                        Ok::<_, AuthError>(Authenticated { user, tokens: pair })
                    })
                }),
            )
            .await?;
        info!(user_id = %signed_in.user.id, "user registered");
        Ok(signed_in)
    }

    /// Reset the password of the account unlocked by a restore token and
    /// clear its deleted marker. Existing sessions are revoked.
    ///
    /// All three changes commit together; on failure the token stays usable.
    pub async fn complete_restore(
        &self,
        ctx: &CallContext,
        restore_token: &str,
        new_password: &str,
    ) -> Result<()> {
        let claims = self.tokens.validate_for(TokenPurpose::Restore, restore_token)?;
        validate_password(new_password)?;

        let password_hash =
            hash_blocking(ctx, Arc::clone(&self.credentials), new_password.to_string()).await?;
        let user = ctx
            .guard(self.stores.users.get_by_email_including_deleted(&claims.sub))
            .await?;
        let user_id = user.id;

        self.spend(
            ctx,
            &claims,
            unit_of_work::run(self.stores.uow.as_ref(), move |tx| {
                Box::pin(async move {
                    tx.users().undelete(user_id).await?;
                    tx.users()
                        .update(user_id, &UserChanges::password(password_hash))
                        .await?;
                    tx.sessions().revoke_all_for_principal(user_id).await?;
                    Ok::<_, AuthError>(())
                })
            }),
        )
        .await?;
        info!(user_id = %user_id, was_deleted = user.is_deleted(), "account restored");
        Ok(())
    }

    /// Spend a scoped token's `jti` and run `work`. Fails if the `jti` was
    /// already spent; gives it back if `work` fails.
    async fn spend<T, F>(&self, ctx: &CallContext, claims: &Claims, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let fresh = ctx
            .guard(self.deps.ledger.consume(&claims.jti, claims.expires_at()?))
            .await?;
        if !fresh {
            return Err(TokenError::AlreadyUsed.into());
        }

        let outcome = ctx.guard(work).await;
        if let Err(e) = &outcome
            && let Err(release_err) = self.deps.ledger.release(&claims.jti).await
        {
            warn!(error = %release_err, cause = %e, "could not release scoped token");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::{Harness, PASSWORD, harness};
    use crate::store::UserRepository;
    use crate::store::memory::FailPoint;

    const EMAIL: &str = "new@example.com";

    fn ctx() -> CallContext {
        CallContext::background()
    }

    fn account(username: &str) -> NewAccount {
        NewAccount {
            username: username.into(),
            first_name: "New".into(),
            last_name: "User".into(),
            password: "registration pw".into(),
        }
    }

    async fn verified_token(h: &Harness, flow: VerificationFlow, email: &str) -> String {
        h.verification.send_otp(&ctx(), flow, email).await.unwrap();
        let code = h.outbox.last_code(flow, &normalize_email(email)).unwrap();
        h.verification
            .verify_otp(&ctx(), flow, email, &code)
            .await
            .unwrap()
            .token
    }

    #[tokio::test]
    async fn registration_end_to_end() {
        let h = harness();
        let token = verified_token(&h, VerificationFlow::Registration, EMAIL).await;

        let auth = h
            .verification
            .complete_registration(&ctx(), &token, account("newbie"))
            .await
            .unwrap();
        assert_eq!(auth.user.email, EMAIL);
        assert_eq!(auth.user.username, "newbie");
        assert_eq!(h.store.sessions_for(auth.user.id).await.len(), 1);

        h.auth.login(&ctx(), "newbie", "registration pw").await.unwrap();
    }

    #[tokio::test]
    async fn register_token_is_single_use() {
        let h = harness();
        let token = verified_token(&h, VerificationFlow::Registration, EMAIL).await;

        let ctx = ctx();
        let (a, b) = tokio::join!(
            h.verification
                .complete_registration(&ctx, &token, account("first")),
            h.verification
                .complete_registration(&ctx, &token, account("second")),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);

        let err = h
            .verification
            .complete_registration(&self::ctx(), &token, account("third"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenError::AlreadyUsed)));
    }

    #[tokio::test]
    async fn registration_send_rejects_taken_email() {
        let h = harness();
        h.seed_user("john").await;
        let err = h
            .verification
            .send_otp(&ctx(), VerificationFlow::Registration, "John@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));
        assert_eq!(h.outbox.recipients(), 0);
    }

    #[tokio::test]
    async fn registration_completion_rejects_taken_username() {
        let h = harness();
        h.seed_user("john").await;
        let token = verified_token(&h, VerificationFlow::Registration, EMAIL).await;
        let err = h
            .verification
            .complete_registration(&ctx(), &token, account("john"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));
    }

    #[tokio::test]
    async fn invalid_input_does_not_spend_the_token() {
        let h = harness();
        let token = verified_token(&h, VerificationFlow::Registration, EMAIL).await;
        let mut weak = account("newbie");
        weak.password = "short".into();
        assert!(matches!(
            h.verification
                .complete_registration(&ctx(), &token, weak)
                .await,
            Err(AuthError::Validation(_))
        ));
        h.verification
            .complete_registration(&ctx(), &token, account("newbie"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wrong_code_is_invalid_and_code_is_single_use() {
        let h = harness();
        let flow = VerificationFlow::Registration;
        h.verification.send_otp(&ctx(), flow, EMAIL).await.unwrap();
        let code = h.outbox.last_code(flow, EMAIL).unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        assert!(matches!(
            h.verification.verify_otp(&ctx(), flow, EMAIL, wrong).await,
            Err(AuthError::InvalidOtp)
        ));
        h.verification
            .verify_otp(&ctx(), flow, EMAIL, &code)
            .await
            .unwrap();
        assert!(matches!(
            h.verification.verify_otp(&ctx(), flow, EMAIL, &code).await,
            Err(AuthError::InvalidOtp)
        ));
    }

    #[tokio::test]
    async fn register_token_cannot_complete_restore() {
        let h = harness();
        h.seed_user("john").await;
        let token = verified_token(&h, VerificationFlow::Registration, EMAIL).await;
        let err = h
            .verification
            .complete_restore(&ctx(), &token, "another password")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Token(_)));
    }

    #[tokio::test]
    async fn otp_sends_are_rate_limited_per_email() {
        let h = harness();
        let burst = h.config.otp_rate_limit.burst as usize;
        for _ in 0..burst {
            h.verification
                .send_otp(&ctx(), VerificationFlow::Registration, EMAIL)
                .await
                .unwrap();
        }
        assert!(matches!(
            h.verification
                .send_otp(&ctx(), VerificationFlow::Registration, EMAIL)
                .await,
            Err(AuthError::RateLimited)
        ));
        h.verification
            .send_otp(&ctx(), VerificationFlow::Registration, "other@example.com")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn restore_requires_known_email() {
        let h = harness();
        let err = h
            .verification
            .send_otp(&ctx(), VerificationFlow::Restore, "ghost@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UserNotFound));
    }

    #[tokio::test]
    async fn restore_resets_password_and_undeletes() {
        let h = harness();
        let user = h.seed_user("john").await;
        h.auth.login(&ctx(), "john", PASSWORD).await.unwrap();
        h.auth.delete_account(&ctx(), user.id).await.unwrap();

        let token = verified_token(&h, VerificationFlow::Restore, &user.email).await;
        h.verification
            .complete_restore(&ctx(), &token, "restored password")
            .await
            .unwrap();

        let restored = h.store.find_user(user.id).await.unwrap();
        assert!(!restored.is_deleted());
        let auth = h.auth.login(&ctx(), "john", "restored password").await.unwrap();
        assert_eq!(auth.user.id, user.id);

        let err = h
            .verification
            .complete_restore(&ctx(), &token, "restored password")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenError::AlreadyUsed)));
    }

    #[tokio::test]
    async fn restore_of_active_account_revokes_sessions() {
        let h = harness();
        let user = h.seed_user("john").await;
        let login = h.auth.login(&ctx(), "john", PASSWORD).await.unwrap();

        let token = verified_token(&h, VerificationFlow::Restore, &user.email).await;
        h.verification
            .complete_restore(&ctx(), &token, "reset password 1")
            .await
            .unwrap();
        assert!(matches!(
            h.auth.refresh_token(&ctx(), &login.tokens.refresh_token).await,
            Err(AuthError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn restore_conflicts_when_username_was_reclaimed() {
        let h = harness();
        let old = h.seed_user("john").await;
        h.auth.delete_account(&ctx(), old.id).await.unwrap();
        let token = verified_token(&h, VerificationFlow::Restore, &old.email).await;

        UserRepository::create(
            &h.store,
            NewUser {
                username: "john".into(),
                email: "someone.else@example.com".into(),
                first_name: "Other".into(),
                last_name: "John".into(),
                password_hash: "hash".into(),
            },
        )
        .await
        .unwrap();

        let err = h
            .verification
            .complete_restore(&ctx(), &token, "restored password")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));
        assert!(h.store.find_user(old.id).await.unwrap().is_deleted());
    }

    #[tokio::test]
    async fn restore_prefers_the_active_account_for_an_email() {
        let h = harness();
        let old = h.seed_user("john").await;
        h.auth.delete_account(&ctx(), old.id).await.unwrap();
        let current = h.seed_user("john").await;

        let token = verified_token(&h, VerificationFlow::Restore, &current.email).await;
        h.verification
            .complete_restore(&ctx(), &token, "reset password 1")
            .await
            .unwrap();
        let auth = h.auth.login(&ctx(), "john", "reset password 1").await.unwrap();
        assert_eq!(auth.user.id, current.id);
        assert!(h.store.find_user(old.id).await.unwrap().is_deleted());
    }

    #[tokio::test]
    async fn failed_registration_keeps_the_token_usable() {
        let h = harness();
        let token = verified_token(&h, VerificationFlow::Registration, EMAIL).await;

        h.store.inject_failure(FailPoint::CreateUser);
        let err = h
            .verification
            .complete_registration(&ctx(), &token, account("newbie"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unavailable(_)));

        let auth = h
            .verification
            .complete_registration(&ctx(), &token, account("newbie"))
            .await
            .unwrap();
        assert_eq!(auth.user.email, EMAIL);
    }

    #[tokio::test]
    async fn session_failure_rolls_back_the_new_account() {
        let h = harness();
        let token = verified_token(&h, VerificationFlow::Registration, EMAIL).await;

        h.store.inject_failure(FailPoint::CreateSession);
        assert!(
            h.verification
                .complete_registration(&ctx(), &token, account("newbie"))
                .await
                .is_err()
        );
        assert!(
            !UserRepository::is_email_taken(&h.store, EMAIL, None)
                .await
                .unwrap()
        );
        assert!(
            !UserRepository::is_username_taken(&h.store, "newbie", None)
                .await
                .unwrap()
        );

        let auth = h
            .verification
            .complete_registration(&ctx(), &token, account("newbie"))
            .await
            .unwrap();
        assert_eq!(h.store.sessions_for(auth.user.id).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_restore_keeps_the_token_usable() {
        let h = harness();
        let user = h.seed_user("john").await;
        h.auth.delete_account(&ctx(), user.id).await.unwrap();
        let token = verified_token(&h, VerificationFlow::Restore, &user.email).await;

        h.store.inject_failure(FailPoint::UpdateUser);
        assert!(
            h.verification
                .complete_restore(&ctx(), &token, "restored password")
                .await
                .is_err()
        );
        assert!(h.store.find_user(user.id).await.unwrap().is_deleted());

        h.verification
            .complete_restore(&ctx(), &token, "restored password")
            .await
            .unwrap();
        assert!(!h.store.find_user(user.id).await.unwrap().is_deleted());
        h.auth
            .login(&ctx(), "john", "restored password")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn completed_restore_token_is_spent() {
        let h = harness();
        let user = h.seed_user("john").await;
        let token = verified_token(&h, VerificationFlow::Restore, &user.email).await;
        h.verification
            .complete_restore(&ctx(), &token, "reset password 1")
            .await
            .unwrap();
        let err = h
            .verification
            .complete_restore(&ctx(), &token, "reset password 2")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Token(TokenError::AlreadyUsed)));
    }
}
