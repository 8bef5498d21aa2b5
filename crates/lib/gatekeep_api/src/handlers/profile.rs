//! Handlers for the signed-in user's own account.

use axum::extract::State;
use axum::{Extension, Json};

use crate::AppState;
use crate::error::AppResult;
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{ChangePasswordRequest, MessageResponse, UpdateMeRequest, UserResponse};

/// `GET /v1/user/me`
pub async fn get_me_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
) -> AppResult<Json<UserResponse>> {
    let user = state.profile.get_me(&state.call_context(), user_id).await?;
    Ok(Json(user.into()))
}

/// `PATCH /v1/user/me`: partial profile update.
pub async fn update_me_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    Json(body): Json<UpdateMeRequest>,
) -> AppResult<Json<UserResponse>> {
    let user = state
        .profile
        .update_me(&state.call_context(), user_id, body.into())
        .await?;
    Ok(Json(user.into()))
}

/// `DELETE /v1/user/me`: soft-delete the account and drop its sessions.
pub async fn delete_me_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
) -> AppResult<Json<MessageResponse>> {
    state
        .auth
        .delete_account(&state.call_context(), user_id)
        .await?;
    Ok(Json(MessageResponse::new("Account deleted")))
}

/// `PUT /v1/user/change-password`
pub async fn change_password_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    Json(body): Json<ChangePasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    state
        .auth
        .change_password(
            &state.call_context(),
            user_id,
            &body.old_password,
            &body.new_password,
        )
        .await?;
    Ok(Json(MessageResponse::new("Password changed")))
}
