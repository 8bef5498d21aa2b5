//! Integration tests: drive the router over an in-memory store.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use gatekeep_api::config::ApiConfig;
use gatekeep_api::error::INVALID_CODE_MESSAGE;
use gatekeep_api::{AppState, routes};
use gatekeep_core::config::{AuthConfig, RateLimitConfig, TokenSecrets};
use gatekeep_core::models::VerificationFlow;
use gatekeep_core::otp::MemoryOutbox;
use gatekeep_core::service::VerificationDeps;
use gatekeep_core::store::Stores;
use gatekeep_core::store::memory::MemoryStore;
use serde_json::{Value, json};
use tower::ServiceExt;

const PASSWORD: &str = "correct horse battery";

struct TestApp {
    app: Router,
    store: MemoryStore,
    outbox: Arc<MemoryOutbox>,
}

fn test_app_with_limit(client_rate_limit: RateLimitConfig) -> TestApp {
    let mut auth = AuthConfig::with_secrets(TokenSecrets::new(
        "it-access",
        "it-refresh",
        "it-register",
        "it-restore",
    ));
    auth.bcrypt_cost = 4;
    auth.client_rate_limit = client_rate_limit;

    let store = MemoryStore::new();
    let outbox = Arc::new(MemoryOutbox::new());
    let deps = VerificationDeps::in_memory(outbox.clone(), auth.otp_rate_limit);
    let state = AppState::new(Stores::new(store.clone()), deps, ApiConfig::new(auth));
    TestApp {
        app: gatekeep_api::router(state),
        store,
        outbox,
    }
}

fn test_app() -> TestApp {
    test_app_with_limit(RateLimitConfig {
        rate_per_sec: 1000.0,
        burst: 1000.0,
        ..RateLimitConfig::default()
    })
}

impl TestApp {
    async fn call(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let resp = self.app.clone().oneshot(req).await.expect("request");
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("read body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("parse JSON")
        };
        (status, json)
    }

    async fn post(&self, uri: &str, bearer: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.call(Method::POST, uri, bearer, Some(body)).await
    }

    /// Run the three registration steps and return the token response.
    async fn register(&self, username: &str, email: &str) -> Value {
        let (status, _) = self
            .post(
                routes::POST_USER_REGISTER_SEND_EMAIL_OTP,
                None,
                json!({ "email": email }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let code = self
            .outbox
            .last_code(VerificationFlow::Registration, email)
            .expect("code delivered");

        let (status, verified) = self
            .post(
                routes::POST_USER_REGISTER_VERIFY_EMAIL_OTP,
                None,
                json!({ "email": email, "code": code }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let register_token = verified["token"].as_str().expect("token").to_string();

        let (status, body) = self
            .post(
                routes::POST_USER_REGISTER_COMPLETE,
                Some(&register_token),
                json!({
                    "username": username,
                    "firstName": "John",
                    "lastName": "Doe",
                    "password": PASSWORD,
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body
    }

    async fn login(&self, identifier: &str, password: &str) -> (StatusCode, Value) {
        self.post(
            routes::POST_USER_LOGIN,
            None,
            json!({ "identifier": identifier, "password": password }),
        )
        .await
    }
}

fn access(tokens: &Value) -> String {
    tokens["accessToken"].as_str().expect("accessToken").to_string()
}

fn refresh(tokens: &Value) -> String {
    tokens["refreshToken"].as_str().expect("refreshToken").to_string()
}

#[tokio::test]
async fn health_reports_version() {
    let t = test_app();
    let (status, body) = t.call(Method::GET, routes::GET_HEALTH, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], gatekeep_core::version());
}

#[tokio::test]
async fn registration_signs_the_new_user_in() {
    let t = test_app();
    let registered = t.register("john", "john@example.com").await;
    assert_eq!(registered["tokenType"], "Bearer");
    assert_eq!(registered["user"]["username"], "john");
    assert!(registered["user"].get("passwordHash").is_none());

    let (status, me) = t
        .call(Method::GET, routes::USER_ME, Some(&access(&registered)), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["email"], "john@example.com");
    assert_eq!(me["firstName"], "John");
}

#[tokio::test]
async fn login_accepts_username_or_email() {
    let t = test_app();
    t.register("john", "john@example.com").await;

    let (status, body) = t.login("john", PASSWORD).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["expiresIn"].as_i64().unwrap() > 0);

    let (status, _) = t.login("John@Example.com", PASSWORD).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = t.login("john", "wrong password!").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn register_token_completes_only_once() {
    let t = test_app();
    let email = "jane@example.com";
    t.post(
        routes::POST_USER_REGISTER_SEND_EMAIL_OTP,
        None,
        json!({ "email": email }),
    )
    .await;
    let code = t
        .outbox
        .last_code(VerificationFlow::Registration, email)
        .unwrap();
    let (_, verified) = t
        .post(
            routes::POST_USER_REGISTER_VERIFY_EMAIL_OTP,
            None,
            json!({ "email": email, "code": code }),
        )
        .await;
    let token = verified["token"].as_str().unwrap().to_string();
    let account = json!({ "username": "jane", "password": PASSWORD });

    let (status, _) = t
        .post(routes::POST_USER_REGISTER_COMPLETE, Some(&token), account.clone())
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = t
        .post(routes::POST_USER_REGISTER_COMPLETE, Some(&token), account)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Token already used");
}

#[tokio::test]
async fn wrong_code_is_a_generic_validation_error() {
    let t = test_app();
    let email = "john@example.com";
    t.post(
        routes::POST_USER_REGISTER_SEND_EMAIL_OTP,
        None,
        json!({ "email": email }),
    )
    .await;
    let code = t
        .outbox
        .last_code(VerificationFlow::Registration, email)
        .unwrap();
    let wrong = if code == "000000" { "111111" } else { "000000" };

    let (status, body) = t
        .post(
            routes::POST_USER_REGISTER_VERIFY_EMAIL_OTP,
            None,
            json!({ "email": email, "code": wrong }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], INVALID_CODE_MESSAGE);
}

#[tokio::test]
async fn registering_a_taken_email_conflicts() {
    let t = test_app();
    t.register("john", "john@example.com").await;
    let (status, body) = t
        .post(
            routes::POST_USER_REGISTER_SEND_EMAIL_OTP,
            None,
            json!({ "email": "JOHN@example.com" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn protected_routes_require_an_access_token() {
    let t = test_app();
    let registered = t.register("john", "john@example.com").await;

    let (status, _) = t.call(Method::GET, routes::USER_ME, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A refresh token is not an access token.
    let (status, _) = t
        .call(Method::GET, routes::USER_ME, Some(&refresh(&registered)), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_rotates_and_rejects_replay() {
    let t = test_app();
    let registered = t.register("john", "john@example.com").await;
    let old = refresh(&registered);

    let (status, rotated) = t
        .post(
            routes::POST_USER_REFRESH_TOKEN,
            None,
            json!({ "refreshToken": old }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(refresh(&rotated), old);

    let (status, _) = t
        .post(
            routes::POST_USER_REFRESH_TOKEN,
            None,
            json!({ "refreshToken": old }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_revokes_the_refresh_session() {
    let t = test_app();
    let registered = t.register("john", "john@example.com").await;
    let (status, _) = t
        .post(
            routes::POST_USER_LOGOUT,
            Some(&access(&registered)),
            json!({ "refreshToken": refresh(&registered) }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = t
        .post(
            routes::POST_USER_REFRESH_TOKEN,
            None,
            json!({ "refreshToken": refresh(&registered) }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_all_reports_revoked_sessions() {
    let t = test_app();
    let registered = t.register("john", "john@example.com").await;
    t.login("john", PASSWORD).await;

    let (status, body) = t
        .post(
            routes::POST_USER_LOGOUT_ALL,
            Some(&access(&registered)),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"], 2);
}

#[tokio::test]
async fn profile_update_and_password_change() {
    let t = test_app();
    let registered = t.register("john", "john@example.com").await;
    let token = access(&registered);

    let (status, me) = t
        .call(
            Method::PATCH,
            routes::USER_ME,
            Some(&token),
            Some(json!({ "lastName": "Smith", "firstName": "   " })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["lastName"], "Smith");
    assert_eq!(me["firstName"], "John");

    let (status, _) = t
        .call(
            Method::PUT,
            routes::PUT_USER_CHANGE_PASSWORD,
            Some(&token),
            Some(json!({ "oldPassword": "not my password", "newPassword": "brand new secret" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = t
        .call(
            Method::PUT,
            routes::PUT_USER_CHANGE_PASSWORD,
            Some(&token),
            Some(json!({ "oldPassword": PASSWORD, "newPassword": "brand new secret" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.login("john", PASSWORD).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(t.login("john", "brand new secret").await.0, StatusCode::OK);
}

#[tokio::test]
async fn deleted_account_can_be_restored_by_email() {
    let t = test_app();
    let email = "john@example.com";
    let registered = t.register("john", email).await;
    let user_id = registered["user"]["id"].as_str().unwrap().parse().unwrap();

    let (status, _) = t
        .call(
            Method::DELETE,
            routes::USER_ME,
            Some(&access(&registered)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(t.store.sessions_for(user_id).await.is_empty());
    assert_eq!(t.login("john", PASSWORD).await.0, StatusCode::NOT_FOUND);

    t.post(
        routes::POST_USER_RESTORE_SEND_EMAIL_OTP,
        None,
        json!({ "email": email }),
    )
    .await;
    let code = t
        .outbox
        .last_code(VerificationFlow::Restore, email)
        .expect("restore code delivered");
    let (status, verified) = t
        .post(
            routes::POST_USER_RESTORE_VERIFY_EMAIL_OTP,
            None,
            json!({ "email": email, "code": code }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let restore_token = verified["token"].as_str().unwrap().to_string();

    // A restore token cannot complete a registration.
    let (status, _) = t
        .post(
            routes::POST_USER_REGISTER_COMPLETE,
            Some(&restore_token),
            json!({ "username": "other", "password": PASSWORD }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = t
        .post(
            routes::POST_USER_RESTORE_COMPLETE,
            Some(&restore_token),
            json!({ "password": "restored password" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = t.login("john", "restored password").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["id"], registered["user"]["id"]);
}

#[tokio::test]
async fn restore_for_unknown_email_is_not_found() {
    let t = test_app();
    let (status, _) = t
        .post(
            routes::POST_USER_RESTORE_SEND_EMAIL_OTP,
            None,
            json!({ "email": "nobody@example.com" }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(t.outbox.recipients(), 0);
}

#[tokio::test]
async fn clients_over_the_limit_get_429() {
    let t = test_app_with_limit(RateLimitConfig {
        rate_per_sec: 0.001,
        burst: 2.0,
        ..RateLimitConfig::default()
    });
    for _ in 0..2 {
        let (status, _) = t.call(Method::GET, routes::GET_HEALTH, None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    let req = Request::builder()
        .uri(routes::GET_HEALTH)
        .body(Body::empty())
        .unwrap();
    let resp = t.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()[header::RETRY_AFTER], "1");
}
