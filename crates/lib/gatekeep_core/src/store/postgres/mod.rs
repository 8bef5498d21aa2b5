//! Postgres-backed store (sqlx).
//!
//! Session rows store a SHA-256 digest of the refresh token, never the token
//! itself. Transactions are real sqlx transactions; session lookups inside
//! them take a row lock.

mod queries;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{SessionRepository, Transaction, UnitOfWork, UserRepository};
use crate::error::{AuthError, Result};
use crate::models::{NewUser, Session, User, UserChanges};

/// Store over a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl UserRepository for PgStore {
    async fn create(&self, user: NewUser) -> Result<User> {
        queries::insert_user(&self.pool, user).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<User> {
        queries::find_active_user(&self.pool, id).await
    }

    async fn get_by_username_or_email(&self, identifier: &str) -> Result<User> {
        queries::find_by_username_or_email(&self.pool, identifier).await
    }

    async fn get_by_email_including_deleted(&self, email: &str) -> Result<User> {
        queries::find_by_email_including_deleted(&self.pool, email).await
    }

    async fn is_username_taken(&self, username: &str, exclude: Option<Uuid>) -> Result<bool> {
        queries::username_taken(&self.pool, username, exclude).await
    }

    async fn is_email_taken(&self, email: &str, exclude: Option<Uuid>) -> Result<bool> {
        queries::email_taken(&self.pool, email, exclude).await
    }

    async fn update(&self, id: Uuid, changes: &UserChanges) -> Result<User> {
        queries::update_user(&self.pool, id, changes).await
    }

    async fn soft_delete(&self, id: Uuid) -> Result<()> {
        queries::soft_delete_user(&self.pool, id).await
    }

    async fn undelete(&self, id: Uuid) -> Result<()> {
        queries::undelete_user(&self.pool, id).await
    }
}

#[async_trait]
impl SessionRepository for PgStore {
    async fn create(&self, session: &Session) -> Result<()> {
        queries::insert_session(&self.pool, session).await
    }

    async fn get_by_token_and_principal(&self, token: &str, user_id: Uuid) -> Result<Session> {
        queries::find_live_session(&self.pool, token, user_id).await
    }

    async fn revoke(&self, token: &str, user_id: Uuid) -> Result<bool> {
        queries::revoke_session(&self.pool, token, user_id).await
    }

    async fn revoke_all_for_principal(&self, user_id: Uuid) -> Result<u64> {
        queries::revoke_user_sessions(&self.pool, user_id).await
    }

    async fn delete_all_for_principal(&self, user_id: Uuid) -> Result<u64> {
        queries::delete_user_sessions(&self.pool, user_id).await
    }
}

#[async_trait]
impl UnitOfWork for PgStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

/// Open sqlx transaction. Dropped without commit, sqlx rolls it back.
pub struct PgTransaction {
    tx: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
}

fn finished() -> AuthError {
    AuthError::Internal("transaction already finished".into())
}

/// Run one query on the open transaction.
macro_rules! on_tx {
    ($self:ident, |$conn:ident| $body:expr) => {{
        let mut guard = $self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let $conn = &mut **tx;
        $body.await
    }};
}

#[async_trait]
impl Transaction for PgTransaction {
    fn users(&self) -> &dyn UserRepository {
        self
    }

    fn sessions(&self) -> &dyn SessionRepository {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let tx = self.tx.into_inner().ok_or_else(finished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let tx = self.tx.into_inner().ok_or_else(finished)?;
        tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl UserRepository for PgTransaction {
    async fn create(&self, user: NewUser) -> Result<User> {
        on_tx!(self, |conn| queries::insert_user(conn, user))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<User> {
        on_tx!(self, |conn| queries::find_active_user(conn, id))
    }

    async fn get_by_username_or_email(&self, identifier: &str) -> Result<User> {
        on_tx!(self, |conn| queries::find_by_username_or_email(conn, identifier))
    }

    async fn get_by_email_including_deleted(&self, email: &str) -> Result<User> {
        on_tx!(self, |conn| queries::find_by_email_including_deleted(conn, email))
    }

    async fn is_username_taken(&self, username: &str, exclude: Option<Uuid>) -> Result<bool> {
        on_tx!(self, |conn| queries::username_taken(conn, username, exclude))
    }

    async fn is_email_taken(&self, email: &str, exclude: Option<Uuid>) -> Result<bool> {
        on_tx!(self, |conn| queries::email_taken(conn, email, exclude))
    }

    async fn update(&self, id: Uuid, changes: &UserChanges) -> Result<User> {
        on_tx!(self, |conn| queries::update_user(conn, id, changes))
    }

    async fn soft_delete(&self, id: Uuid) -> Result<()> {
        on_tx!(self, |conn| queries::soft_delete_user(conn, id))
    }

    async fn undelete(&self, id: Uuid) -> Result<()> {
        on_tx!(self, |conn| queries::undelete_user(conn, id))
    }
}

#[async_trait]
impl SessionRepository for PgTransaction {
    async fn create(&self, session: &Session) -> Result<()> {
        on_tx!(self, |conn| queries::insert_session(conn, session))
    }

    async fn get_by_token_and_principal(&self, token: &str, user_id: Uuid) -> Result<Session> {
        on_tx!(self, |conn| queries::find_live_session(conn, token, user_id))
    }

    async fn revoke(&self, token: &str, user_id: Uuid) -> Result<bool> {
        on_tx!(self, |conn| queries::revoke_session(conn, token, user_id))
    }

    async fn revoke_all_for_principal(&self, user_id: Uuid) -> Result<u64> {
        on_tx!(self, |conn| queries::revoke_user_sessions(conn, user_id))
    }

    async fn delete_all_for_principal(&self, user_id: Uuid) -> Result<u64> {
        on_tx!(self, |conn| queries::delete_user_sessions(conn, user_id))
    }
}
