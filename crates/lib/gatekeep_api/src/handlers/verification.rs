//! Email verification handlers for the registration and restore flows.
//!
//! Both flows share the same three steps: send a code, trade the code for a
//! scoped token, then complete the flow with that token as Bearer.

use axum::Json;
use axum::extract::State;
use gatekeep_core::models::VerificationFlow;

use crate::AppState;
use crate::error::AppResult;
use crate::middleware::auth::BearerToken;
use crate::models::{
    CompleteRegistrationRequest, CompleteRestoreRequest, MessageResponse, SendOtpRequest,
    TokenResponse, VerifyOtpRequest, VerifyOtpResponse,
};

async fn send_otp(
    state: &AppState,
    flow: VerificationFlow,
    body: SendOtpRequest,
) -> AppResult<Json<MessageResponse>> {
    state
        .verification
        .send_otp(&state.call_context(), flow, &body.email)
        .await?;
    Ok(Json(MessageResponse::new("Verification code sent")))
}

async fn verify_otp(
    state: &AppState,
    flow: VerificationFlow,
    body: VerifyOtpRequest,
) -> AppResult<Json<VerifyOtpResponse>> {
    let issued = state
        .verification
        .verify_otp(&state.call_context(), flow, &body.email, &body.code)
        .await?;
    Ok(Json(VerifyOtpResponse {
        expires_at: issued.claims.expires_at()?,
        token: issued.token,
    }))
}

/// `POST /v1/user/register/send-email-otp`
pub async fn register_send_otp_handler(
    State(state): State<AppState>,
    Json(body): Json<SendOtpRequest>,
) -> AppResult<Json<MessageResponse>> {
    send_otp(&state, VerificationFlow::Registration, body).await
}

/// `POST /v1/user/register/verify-email-otp`: returns a register token.
pub async fn register_verify_otp_handler(
    State(state): State<AppState>,
    Json(body): Json<VerifyOtpRequest>,
) -> AppResult<Json<VerifyOtpResponse>> {
    verify_otp(&state, VerificationFlow::Registration, body).await
}

/// `POST /v1/user/register/complete`: Bearer is the register token.
pub async fn register_complete_handler(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Json(body): Json<CompleteRegistrationRequest>,
) -> AppResult<Json<TokenResponse>> {
    let signed_in = state
        .verification
        .complete_registration(&state.call_context(), &token, body.into())
        .await?;
    Ok(Json(TokenResponse::new(signed_in.tokens, Some(signed_in.user))))
}

/// `POST /v1/user/restore/send-email-otp`
pub async fn restore_send_otp_handler(
    State(state): State<AppState>,
    Json(body): Json<SendOtpRequest>,
) -> AppResult<Json<MessageResponse>> {
    send_otp(&state, VerificationFlow::Restore, body).await
}

/// `POST /v1/user/restore/verify-email-otp`: returns a restore token.
pub async fn restore_verify_otp_handler(
    State(state): State<AppState>,
    Json(body): Json<VerifyOtpRequest>,
) -> AppResult<Json<VerifyOtpResponse>> {
    verify_otp(&state, VerificationFlow::Restore, body).await
}

/// `POST /v1/user/restore/complete`: Bearer is the restore token.
pub async fn restore_complete_handler(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Json(body): Json<CompleteRestoreRequest>,
) -> AppResult<Json<MessageResponse>> {
    state
        .verification
        .complete_restore(&state.call_context(), &token, &body.password)
        .await?;
    Ok(Json(MessageResponse::new("Account restored")))
}
