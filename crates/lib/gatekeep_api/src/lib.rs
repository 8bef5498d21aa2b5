//! # gatekeep_api
//!
//! HTTP API library for Gatekeep.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use gatekeep_core::context::CallContext;
use gatekeep_core::password::{BcryptVerifier, CredentialVerifier};
use gatekeep_core::rate_limit::RateLimiter;
use gatekeep_core::service::{AuthService, ProfileService, VerificationDeps, VerificationService};
use gatekeep_core::store::Stores;
use gatekeep_core::token::TokenService;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::handlers::{auth, health, profile, verification};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: AuthService,
    pub profile: ProfileService,
    pub verification: VerificationService,
    /// Per-client request limiter.
    pub limiter: Arc<RateLimiter>,
    pub config: ApiConfig,
}

impl AppState {
    /// Wire the services over `stores` and the verification collaborators.
    pub fn new(stores: Stores, deps: VerificationDeps, config: ApiConfig) -> Self {
        let tokens = TokenService::from_config(&config.auth);
        let credentials: Arc<dyn CredentialVerifier> =
            Arc::new(BcryptVerifier::new(config.auth.bcrypt_cost));
        Self {
            auth: AuthService::new(stores.clone(), tokens.clone(), Arc::clone(&credentials)),
            profile: ProfileService::new(stores.clone()),
            verification: VerificationService::new(
                stores,
                tokens,
                credentials,
                deps,
                config.auth.otp,
            ),
            limiter: Arc::new(RateLimiter::new(config.auth.client_rate_limit)),
            config,
        }
    }

    /// Fresh per-request context carrying the configured deadline.
    pub fn call_context(&self) -> CallContext {
        CallContext::with_timeout(self.config.request_timeout)
    }
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes (scoped-token routes read their own Bearer token)
    let public = Router::new()
        .route(routes::GET_HEALTH, get(health::health_handler))
        .route(routes::POST_USER_LOGIN, post(auth::login_handler))
        .route(routes::POST_USER_REFRESH_TOKEN, post(auth::refresh_handler))
        .route(
            routes::POST_USER_REGISTER_SEND_EMAIL_OTP,
            post(verification::register_send_otp_handler),
        )
        .route(
            routes::POST_USER_REGISTER_VERIFY_EMAIL_OTP,
            post(verification::register_verify_otp_handler),
        )
        .route(
            routes::POST_USER_REGISTER_COMPLETE,
            post(verification::register_complete_handler),
        )
        .route(
            routes::POST_USER_RESTORE_SEND_EMAIL_OTP,
            post(verification::restore_send_otp_handler),
        )
        .route(
            routes::POST_USER_RESTORE_VERIFY_EMAIL_OTP,
            post(verification::restore_verify_otp_handler),
        )
        .route(
            routes::POST_USER_RESTORE_COMPLETE,
            post(verification::restore_complete_handler),
        );

    // Protected routes (require an access token)
    let protected = Router::new()
        .route(routes::POST_USER_LOGOUT, post(auth::logout_handler))
        .route(routes::POST_USER_LOGOUT_ALL, post(auth::logout_all_handler))
        .route(
            routes::USER_ME,
            get(profile::get_me_handler)
                .patch(profile::update_me_handler)
                .delete(profile::delete_me_handler),
        )
        .route(
            routes::PUT_USER_CHANGE_PASSWORD,
            put(profile::change_password_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
