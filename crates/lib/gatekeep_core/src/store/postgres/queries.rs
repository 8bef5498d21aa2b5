//! SQL for the Postgres store.
//!
//! Every query is generic over [`PgExecutor`] so the same statements run on
//! the pool and inside a transaction.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::error::{AuthError, Result};
use crate::models::{NewUser, Session, User, UserChanges};

const USER_COLUMNS: &str = "id, username, email, first_name, last_name, password_hash, \
                            created_at, updated_at, deleted_at";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    email: String,
    first_name: String,
    last_name: String,
    password_hash: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            username: row.username,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            password_hash: row.password_hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        }
    }
}

/// SHA-256 hash a token for storage.
pub(crate) fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Map unique-index violations to `Conflict`; pass everything else through.
fn conflict_on_unique(e: sqlx::Error, what: &str) -> AuthError {
    if let sqlx::Error::Database(db) = &e
        && db.is_unique_violation()
    {
        return AuthError::Conflict(format!("{what} already exists"));
    }
    AuthError::Db(e)
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

pub async fn insert_user<'e, E: PgExecutor<'e>>(executor: E, user: NewUser) -> Result<User> {
    let sql = format!(
        "INSERT INTO users (id, username, email, first_name, last_name, password_hash) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING {USER_COLUMNS}"
    );
    let row = sqlx::query_as::<_, UserRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.password_hash)
        .fetch_one(executor)
        .await
        .map_err(|e| conflict_on_unique(e, "username or email"))?;
    Ok(row.into())
}

pub async fn find_active_user<'e, E: PgExecutor<'e>>(executor: E, id: Uuid) -> Result<User> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND deleted_at IS NULL");
    sqlx::query_as::<_, UserRow>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?
        .map(User::from)
        .ok_or(AuthError::UserNotFound)
}

pub async fn find_by_username_or_email<'e, E: PgExecutor<'e>>(
    executor: E,
    identifier: &str,
) -> Result<User> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users \
         WHERE (username = $1 OR email = $1) AND deleted_at IS NULL \
         LIMIT 1"
    );
    sqlx::query_as::<_, UserRow>(&sql)
        .bind(identifier)
        .fetch_optional(executor)
        .await?
        .map(User::from)
        .ok_or(AuthError::UserNotFound)
}

pub async fn find_by_email_including_deleted<'e, E: PgExecutor<'e>>(
    executor: E,
    email: &str,
) -> Result<User> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users WHERE email = $1 \
         ORDER BY deleted_at IS NULL DESC, created_at DESC LIMIT 1"
    );
    sqlx::query_as::<_, UserRow>(&sql)
        .bind(email)
        .fetch_optional(executor)
        .await?
        .map(User::from)
        .ok_or(AuthError::UserNotFound)
}

pub async fn username_taken<'e, E: PgExecutor<'e>>(
    executor: E,
    username: &str,
    exclude: Option<Uuid>,
) -> Result<bool> {
    let taken = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM users \
         WHERE username = $1 AND deleted_at IS NULL AND ($2::uuid IS NULL OR id <> $2))",
    )
    .bind(username)
    .bind(exclude)
    .fetch_one(executor)
    .await?;
    Ok(taken)
}

pub async fn email_taken<'e, E: PgExecutor<'e>>(
    executor: E,
    email: &str,
    exclude: Option<Uuid>,
) -> Result<bool> {
    let taken = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM users \
         WHERE email = $1 AND deleted_at IS NULL AND ($2::uuid IS NULL OR id <> $2))",
    )
    .bind(email)
    .bind(exclude)
    .fetch_one(executor)
    .await?;
    Ok(taken)
}

pub async fn update_user<'e, E: PgExecutor<'e>>(
    executor: E,
    id: Uuid,
    changes: &UserChanges,
) -> Result<User> {
    let sql = format!(
        "UPDATE users SET \
             username = COALESCE($2, username), \
             first_name = COALESCE($3, first_name), \
             last_name = COALESCE($4, last_name), \
             password_hash = COALESCE($5, password_hash), \
             updated_at = now() \
         WHERE id = $1 AND deleted_at IS NULL \
         RETURNING {USER_COLUMNS}"
    );
    sqlx::query_as::<_, UserRow>(&sql)
        .bind(id)
        .bind(changes.username.as_deref())
        .bind(changes.first_name.as_deref())
        .bind(changes.last_name.as_deref())
        .bind(changes.password_hash.as_deref())
        .fetch_optional(executor)
        .await
        .map_err(|e| conflict_on_unique(e, "username"))?
        .map(User::from)
        .ok_or(AuthError::UserNotFound)
}

pub async fn soft_delete_user<'e, E: PgExecutor<'e>>(executor: E, id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE users SET deleted_at = now(), updated_at = now() \
         WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .execute(executor)
    .await?;
    if result.rows_affected() == 0 {
        return Err(AuthError::UserNotFound);
    }
    Ok(())
}

pub async fn undelete_user<'e, E: PgExecutor<'e>>(executor: E, id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE users SET deleted_at = NULL, updated_at = CASE \
             WHEN deleted_at IS NULL THEN updated_at ELSE now() END \
         WHERE id = $1",
    )
    .bind(id)
    .execute(executor)
    .await
    .map_err(|e| conflict_on_unique(e, "username or email"))?;
    if result.rows_affected() == 0 {
        return Err(AuthError::UserNotFound);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub async fn insert_session<'e, E: PgExecutor<'e>>(executor: E, session: &Session) -> Result<()> {
    sqlx::query(
        "INSERT INTO sessions (id, user_id, token_hash, issued_at, expires_at, revoked, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(session.id)
    .bind(session.user_id)
    .bind(hash_token(&session.token))
    .bind(session.issued_at)
    .bind(session.expires_at)
    .bind(session.revoked)
    .bind(session.created_at)
    .execute(executor)
    .await
    .map_err(|e| conflict_on_unique(e, "session token"))?;
    Ok(())
}

/// Fetch a live session and lock its row for the rest of the transaction.
pub async fn find_live_session<'e, E: PgExecutor<'e>>(
    executor: E,
    token: &str,
    user_id: Uuid,
) -> Result<Session> {
    let row = sqlx::query_as::<_, (Uuid, DateTime<Utc>, DateTime<Utc>, DateTime<Utc>)>(
        "SELECT id, issued_at, expires_at, created_at FROM sessions \
         WHERE token_hash = $1 AND user_id = $2 AND revoked = false \
         FOR UPDATE",
    )
    .bind(hash_token(token))
    .bind(user_id)
    .fetch_optional(executor)
    .await?;
    let (id, issued_at, expires_at, created_at) = row.ok_or(AuthError::SessionNotFound)?;
    Ok(Session {
        id,
        user_id,
        token: token.to_string(),
        issued_at,
        expires_at,
        revoked: false,
        created_at,
    })
}

/// Returns true only when this statement flipped `revoked`.
pub async fn revoke_session<'e, E: PgExecutor<'e>>(
    executor: E,
    token: &str,
    user_id: Uuid,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE sessions SET revoked = true \
         WHERE token_hash = $1 AND user_id = $2 AND revoked = false",
    )
    .bind(hash_token(token))
    .bind(user_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn revoke_user_sessions<'e, E: PgExecutor<'e>>(executor: E, user_id: Uuid) -> Result<u64> {
    let result =
        sqlx::query("UPDATE sessions SET revoked = true WHERE user_id = $1 AND revoked = false")
            .bind(user_id)
            .execute(executor)
            .await?;
    Ok(result.rows_affected())
}

pub async fn delete_user_sessions<'e, E: PgExecutor<'e>>(executor: E, user_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE user_id = $1")
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}
