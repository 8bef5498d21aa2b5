//! In-process store with serializable transactions.
//!
//! A transaction holds the store lock for its whole lifetime and works on a
//! copy of the state that replaces the original on commit. Direct repository
//! calls take the same lock, so every operation is serialized.
//!
//! One-shot fault injection ([`MemoryStore::inject_failure`]) lets tests
//! exercise the failure paths of the services.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{SessionRepository, Transaction, UnitOfWork, UserRepository};
use crate::error::{AuthError, Result};
use crate::models::{NewUser, Session, User, UserChanges};

/// Store operations that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateUser,
    UpdateUser,
    SoftDelete,
    CreateSession,
    RevokeSession,
    DeleteSessions,
    Commit,
}

#[derive(Debug, Clone, Default)]
struct State {
    users: HashMap<Uuid, User>,
    /// Sessions keyed by token.
    sessions: HashMap<String, Session>,
    user_updates: usize,
}

type Faults = Arc<Mutex<HashSet<FailPoint>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn trip(faults: &Faults, point: FailPoint) -> Result<()> {
    if lock(faults).remove(&point) {
        return Err(AuthError::Unavailable(format!("injected failure at {point:?}")));
    }
    Ok(())
}

/// In-memory implementation of every storage contract.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<tokio::sync::Mutex<State>>,
    faults: Faults,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call reaching `point` fail with `Unavailable`.
    pub fn inject_failure(&self, point: FailPoint) {
        lock(&self.faults).insert(point);
    }

    /// Any user by ID, including soft-deleted ones.
    pub async fn find_user(&self, id: Uuid) -> Option<User> {
        self.state.lock().await.users.get(&id).cloned()
    }

    /// Every session of a user, revoked or not.
    pub async fn sessions_for(&self, user_id: Uuid) -> Vec<Session> {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Number of committed user updates.
    pub async fn user_update_count(&self) -> usize {
        self.state.lock().await.user_updates
    }
}

// ---------------------------------------------------------------------------
// State operations shared by direct calls and transactions
// ---------------------------------------------------------------------------

impl State {
    fn active_user(&self, id: Uuid) -> Result<&User> {
        self.users
            .get(&id)
            .filter(|u| !u.is_deleted())
            .ok_or(AuthError::UserNotFound)
    }

    fn username_taken(&self, username: &str, exclude: Option<Uuid>) -> bool {
        self.users
            .values()
            .any(|u| !u.is_deleted() && u.username == username && Some(u.id) != exclude)
    }

    fn email_taken(&self, email: &str, exclude: Option<Uuid>) -> bool {
        self.users
            .values()
            .any(|u| !u.is_deleted() && u.email == email && Some(u.id) != exclude)
    }

    fn create_user(&mut self, new: NewUser) -> Result<User> {
        if self.username_taken(&new.username, None) {
            return Err(AuthError::Conflict("username already taken".into()));
        }
        if self.email_taken(&new.email, None) {
            return Err(AuthError::Conflict("email already registered".into()));
        }
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: new.username,
            email: new.email,
            first_name: new.first_name,
            last_name: new.last_name,
            password_hash: new.password_hash,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.users.insert(user.id, user.clone());
        Ok(user)
    }

    fn get_by_username_or_email(&self, identifier: &str) -> Result<User> {
        self.users
            .values()
            .find(|u| !u.is_deleted() && (u.username == identifier || u.email == identifier))
            .cloned()
            .ok_or(AuthError::UserNotFound)
    }

    fn get_by_email_including_deleted(&self, email: &str) -> Result<User> {
        self.users
            .values()
            .filter(|u| u.email == email)
            .max_by_key(|u| (!u.is_deleted(), u.created_at))
            .cloned()
            .ok_or(AuthError::UserNotFound)
    }

    fn update_user(&mut self, id: Uuid, changes: &UserChanges) -> Result<User> {
        self.active_user(id)?;
        if let Some(username) = &changes.username
            && self.username_taken(username, Some(id))
        {
            return Err(AuthError::Conflict("username already taken".into()));
        }
        let user = self.users.get_mut(&id).ok_or(AuthError::UserNotFound)?;
        changes.apply(user, Utc::now());
        let updated = user.clone();
        self.user_updates += 1;
        Ok(updated)
    }

    fn soft_delete(&mut self, id: Uuid) -> Result<()> {
        self.active_user(id)?;
        if let Some(user) = self.users.get_mut(&id) {
            user.deleted_at = Some(Utc::now());
        }
        Ok(())
    }

    fn undelete(&mut self, id: Uuid) -> Result<()> {
        let user = self.users.get(&id).ok_or(AuthError::UserNotFound)?;
        if !user.is_deleted() {
            return Ok(());
        }
        if self.username_taken(&user.username, Some(id)) {
            return Err(AuthError::Conflict("username already taken".into()));
        }
        if self.email_taken(&user.email, Some(id)) {
            return Err(AuthError::Conflict("email already registered".into()));
        }
        if let Some(user) = self.users.get_mut(&id) {
            user.deleted_at = None;
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    fn create_session(&mut self, session: &Session) -> Result<()> {
        if self.sessions.contains_key(&session.token) {
            return Err(AuthError::Conflict("session token already exists".into()));
        }
        self.sessions.insert(session.token.clone(), session.clone());
        Ok(())
    }

    fn get_session(&self, token: &str, user_id: Uuid) -> Result<Session> {
        self.sessions
            .get(token)
            .filter(|s| s.user_id == user_id && !s.revoked)
            .cloned()
            .ok_or(AuthError::SessionNotFound)
    }

    fn revoke_session(&mut self, token: &str, user_id: Uuid) -> bool {
        match self.sessions.get_mut(token) {
            Some(s) if s.user_id == user_id && !s.revoked => {
                s.revoked = true;
                true
            }
            _ => false,
        }
    }

    fn revoke_all(&mut self, user_id: Uuid) -> u64 {
        let mut revoked = 0;
        for s in self.sessions.values_mut() {
            if s.user_id == user_id && !s.revoked {
                s.revoked = true;
                revoked += 1;
            }
        }
        revoked
    }

    fn delete_all(&mut self, user_id: Uuid) -> u64 {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.user_id != user_id);
        (before - self.sessions.len()) as u64
    }
}

// ---------------------------------------------------------------------------
// Direct (auto-commit) access
// ---------------------------------------------------------------------------

#[async_trait]
impl UserRepository for MemoryStore {
    async fn create(&self, user: NewUser) -> Result<User> {
        trip(&self.faults, FailPoint::CreateUser)?;
        self.state.lock().await.create_user(user)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<User> {
        self.state.lock().await.active_user(id).cloned()
    }

    async fn get_by_username_or_email(&self, identifier: &str) -> Result<User> {
        self.state.lock().await.get_by_username_or_email(identifier)
    }

    async fn get_by_email_including_deleted(&self, email: &str) -> Result<User> {
        self.state.lock().await.get_by_email_including_deleted(email)
    }

    async fn is_username_taken(&self, username: &str, exclude: Option<Uuid>) -> Result<bool> {
        Ok(self.state.lock().await.username_taken(username, exclude))
    }

    async fn is_email_taken(&self, email: &str, exclude: Option<Uuid>) -> Result<bool> {
        Ok(self.state.lock().await.email_taken(email, exclude))
    }

    async fn update(&self, id: Uuid, changes: &UserChanges) -> Result<User> {
        trip(&self.faults, FailPoint::UpdateUser)?;
        self.state.lock().await.update_user(id, changes)
    }

    async fn soft_delete(&self, id: Uuid) -> Result<()> {
        trip(&self.faults, FailPoint::SoftDelete)?;
        self.state.lock().await.soft_delete(id)
    }

    async fn undelete(&self, id: Uuid) -> Result<()> {
        self.state.lock().await.undelete(id)
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn create(&self, session: &Session) -> Result<()> {
        trip(&self.faults, FailPoint::CreateSession)?;
        self.state.lock().await.create_session(session)
    }

    async fn get_by_token_and_principal(&self, token: &str, user_id: Uuid) -> Result<Session> {
        self.state.lock().await.get_session(token, user_id)
    }

    async fn revoke(&self, token: &str, user_id: Uuid) -> Result<bool> {
        trip(&self.faults, FailPoint::RevokeSession)?;
        Ok(self.state.lock().await.revoke_session(token, user_id))
    }

    async fn revoke_all_for_principal(&self, user_id: Uuid) -> Result<u64> {
        Ok(self.state.lock().await.revoke_all(user_id))
    }

    async fn delete_all_for_principal(&self, user_id: Uuid) -> Result<u64> {
        trip(&self.faults, FailPoint::DeleteSessions)?;
        Ok(self.state.lock().await.delete_all(user_id))
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[async_trait]
impl UnitOfWork for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = Mutex::new(guard.clone());
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            faults: Arc::clone(&self.faults),
        }))
    }
}

/// Open transaction over a [`MemoryStore`].
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<State>,
    working: Mutex<State>,
    faults: Faults,
}

impl MemoryTransaction {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.working)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn users(&self) -> &dyn UserRepository {
        self
    }

    fn sessions(&self) -> &dyn SessionRepository {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        trip(&self.faults, FailPoint::Commit)?;
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl UserRepository for MemoryTransaction {
    async fn create(&self, user: NewUser) -> Result<User> {
        trip(&self.faults, FailPoint::CreateUser)?;
        self.state().create_user(user)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<User> {
        self.state().active_user(id).cloned()
    }

    async fn get_by_username_or_email(&self, identifier: &str) -> Result<User> {
        self.state().get_by_username_or_email(identifier)
    }

    async fn get_by_email_including_deleted(&self, email: &str) -> Result<User> {
        self.state().get_by_email_including_deleted(email)
    }

    async fn is_username_taken(&self, username: &str, exclude: Option<Uuid>) -> Result<bool> {
        Ok(self.state().username_taken(username, exclude))
    }

    async fn is_email_taken(&self, email: &str, exclude: Option<Uuid>) -> Result<bool> {
        Ok(self.state().email_taken(email, exclude))
    }

    async fn update(&self, id: Uuid, changes: &UserChanges) -> Result<User> {
        trip(&self.faults, FailPoint::UpdateUser)?;
        self.state().update_user(id, changes)
    }

    async fn soft_delete(&self, id: Uuid) -> Result<()> {
        trip(&self.faults, FailPoint::SoftDelete)?;
        self.state().soft_delete(id)
    }

    async fn undelete(&self, id: Uuid) -> Result<()> {
        self.state().undelete(id)
    }
}

#[async_trait]
impl SessionRepository for MemoryTransaction {
    async fn create(&self, session: &Session) -> Result<()> {
        trip(&self.faults, FailPoint::CreateSession)?;
        self.state().create_session(session)
    }

    async fn get_by_token_and_principal(&self, token: &str, user_id: Uuid) -> Result<Session> {
        self.state().get_session(token, user_id)
    }

    async fn revoke(&self, token: &str, user_id: Uuid) -> Result<bool> {
        trip(&self.faults, FailPoint::RevokeSession)?;
        Ok(self.state().revoke_session(token, user_id))
    }

    async fn revoke_all_for_principal(&self, user_id: Uuid) -> Result<u64> {
        Ok(self.state().revoke_all(user_id))
    }

    async fn delete_all_for_principal(&self, user_id: Uuid) -> Result<u64> {
        trip(&self.faults, FailPoint::DeleteSessions)?;
        Ok(self.state().delete_all(user_id))
    }
}
