//! Session request handlers.

use axum::extract::State;
use axum::{Extension, Json};
use tracing::debug;

use crate::AppState;
use crate::error::AppResult;
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{
    LoginRequest, LogoutAllResponse, LogoutRequest, MessageResponse, RefreshRequest,
    TokenResponse,
};

/// `POST /v1/user/login`: sign in with username or email and password.
pub async fn login_handler(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> AppResult<Json<TokenResponse>> {
    let signed_in = state
        .auth
        .login(&state.call_context(), &body.identifier, &body.password)
        .await?;
    Ok(Json(TokenResponse::new(signed_in.tokens, Some(signed_in.user))))
}

/// `POST /v1/user/refresh-token`: rotate a refresh token.
pub async fn refresh_handler(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> AppResult<Json<TokenResponse>> {
    let tokens = state
        .auth
        .refresh_token(&state.call_context(), &body.refresh_token)
        .await?;
    Ok(Json(TokenResponse::new(tokens, None)))
}

/// `POST /v1/user/logout`: revoke one refresh session of the caller.
pub async fn logout_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    Json(body): Json<LogoutRequest>,
) -> AppResult<Json<MessageResponse>> {
    state
        .auth
        .logout(&state.call_context(), user_id, &body.refresh_token)
        .await?;
    Ok(Json(MessageResponse::new("Logged out")))
}

/// `POST /v1/user/logout-all`: revoke every live session of the caller.
pub async fn logout_all_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
) -> AppResult<Json<LogoutAllResponse>> {
    let revoked = state.auth.logout_all(&state.call_context(), user_id).await?;
    debug!(user_id = %user_id, revoked, "logout-all");
    Ok(Json(LogoutAllResponse { revoked }))
}
