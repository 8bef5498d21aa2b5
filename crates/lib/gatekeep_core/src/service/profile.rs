//! Profile reads and partial updates for the signed-in user.

use tracing::info;
use uuid::Uuid;

use super::validate_username;
use crate::context::CallContext;
use crate::error::{AuthError, Result};
use crate::models::{User, UserChanges};
use crate::store::Stores;

/// Requested profile changes. Missing or blank fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateProfile {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl UpdateProfile {
    fn into_changes(self) -> UserChanges {
        UserChanges {
            username: non_blank(self.username),
            first_name: non_blank(self.first_name),
            last_name: non_blank(self.last_name),
            password_hash: None,
        }
    }
}

#[derive(Clone)]
pub struct ProfileService {
    stores: Stores,
}

impl ProfileService {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn get_me(&self, ctx: &CallContext, user_id: Uuid) -> Result<User> {
        ctx.guard(self.stores.users.get_by_id(user_id)).await
    }

    /// Apply the non-blank fields of `update` and return the updated user.
    ///
    /// A new username must not be held by another active user.
    pub async fn update_me(
        &self,
        ctx: &CallContext,
        user_id: Uuid,
        update: UpdateProfile,
    ) -> Result<User> {
        let changes = update.into_changes();
        if changes.is_empty() {
            return self.get_me(ctx, user_id).await;
        }
        if let Some(username) = &changes.username {
            validate_username(username)?;
            let taken = ctx
                .guard(self.stores.users.is_username_taken(username, Some(user_id)))
                .await?;
            if taken {
                return Err(AuthError::Conflict("Username already taken".into()));
            }
        }

        let user = ctx.guard(self.stores.users.update(user_id, &changes)).await?;
        info!(user_id = %user_id, "profile updated");
        Ok(user)
    }
}
