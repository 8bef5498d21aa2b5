//! Storage contracts for principals and refresh sessions.
//!
//! The services only see these traits. Two backends ship with the crate:
//! [`memory::MemoryStore`] (in-process, used by tests and `--memory` mode)
//! and [`postgres::PgStore`] (sqlx).

pub mod memory;
pub mod postgres;
pub mod unit_of_work;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{NewUser, Session, User, UserChanges};

pub use sqlx::Error as DbError;
pub use unit_of_work::{Transaction, UnitOfWork};

/// The storage handles a service needs, usually all backed by one store.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub uow: Arc<dyn UnitOfWork>,
}

impl Stores {
    /// Share one backend for users, sessions and transactions.
    pub fn new<S>(backend: S) -> Self
    where
        S: UserRepository + SessionRepository + UnitOfWork + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            users: backend.clone(),
            sessions: backend.clone(),
            uow: backend,
        }
    }
}

/// Principal store.
///
/// Lookups other than [`get_by_email_including_deleted`](Self::get_by_email_including_deleted)
/// never resolve soft-deleted users.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a user. Fails with `Conflict` if the username or email is held
    /// by another non-deleted user.
    async fn create(&self, user: NewUser) -> Result<User>;

    /// `UserNotFound` if absent or deleted.
    async fn get_by_id(&self, id: Uuid) -> Result<User>;

    /// Match `identifier` against username or email. `UserNotFound` if absent or deleted.
    async fn get_by_username_or_email(&self, identifier: &str) -> Result<User>;

    /// User with this email, deleted or not. The active user wins, then the
    /// most recently created one.
    async fn get_by_email_including_deleted(&self, email: &str) -> Result<User>;

    /// Whether a non-deleted user other than `exclude` holds `username`.
    async fn is_username_taken(&self, username: &str, exclude: Option<Uuid>) -> Result<bool>;

    /// Whether a non-deleted user other than `exclude` holds `email`.
    async fn is_email_taken(&self, email: &str, exclude: Option<Uuid>) -> Result<bool>;

    /// Apply a partial update to a non-deleted user and return the result.
    async fn update(&self, id: Uuid, changes: &UserChanges) -> Result<User>;

    /// Mark a user deleted. `UserNotFound` if absent or already deleted.
    async fn soft_delete(&self, id: Uuid) -> Result<()>;

    /// Clear the deleted marker. `UserNotFound` if absent.
    async fn undelete(&self, id: Uuid) -> Result<()>;
}

/// Refresh session store.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Persist a new session. `Conflict` only if the token already exists.
    async fn create(&self, session: &Session) -> Result<()>;

    /// `SessionNotFound` if absent or revoked.
    async fn get_by_token_and_principal(&self, token: &str, user_id: Uuid) -> Result<Session>;

    /// Revoke a session. Idempotent: absent or already-revoked sessions are
    /// not an error. Returns true only when this call flipped `revoked`.
    async fn revoke(&self, token: &str, user_id: Uuid) -> Result<bool>;

    /// Revoke every live session of a user, returning how many were revoked.
    async fn revoke_all_for_principal(&self, user_id: Uuid) -> Result<u64>;

    /// Hard-delete every session of a user. Safe when there are none.
    async fn delete_all_for_principal(&self, user_id: Uuid) -> Result<u64>;
}
