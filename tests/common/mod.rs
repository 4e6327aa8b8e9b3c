#![allow(dead_code)]

use actix_web::body::MessageBody;
use actix_web::dev::{Service, ServiceResponse};
use actix_web::http::header::{AUTHORIZATION, LOCATION};
use actix_web::http::StatusCode;
use actix_web::test::{self, TestRequest};
use serde_json::{json, Value};

use speakspace::auth::{AuthService, Identity};
use speakspace::config::AppConfig;
use speakspace::{AppState, Store};

/// Builds the full procedure surface behind the edge gate.
macro_rules! test_app {
    ($state:expr) => {
        actix_web::test::init_service(
            actix_web::App::new()
                .wrap(speakspace::middleware::EdgeGate::new(
                    std::sync::Arc::new(speakspace::rate_limit::TokenBucketLimiter::new($state.config.rate_limit)),
                    &$state.config.sign_in_path,
                ))
                .app_data(actix_web::web::Data::new($state.clone()))
                .configure(speakspace::routes::configure),
        )
        .await
    };
}

pub fn state() -> AppState {
    AppState::in_memory(AppConfig::for_tests())
}

pub fn token(state: &AppState, external_id: &str) -> String {
    let identity = Identity {
        external_id: external_id.to_string(),
        email: Some(format!("{}@example.com", external_id)),
        username: Some(external_id.to_string()),
        image_url: None,
    };
    AuthService::generate_token(&identity, &state.config).unwrap()
}

pub fn get(path: &str, token: &str) -> TestRequest {
    TestRequest::get()
        .uri(path)
        .insert_header((AUTHORIZATION, format!("Bearer {}", token)))
}

pub fn post(path: &str, token: &str, body: Value) -> TestRequest {
    TestRequest::post()
        .uri(path)
        .insert_header((AUTHORIZATION, format!("Bearer {}", token)))
        .set_json(body)
}

pub async fn send<S, R, B, E>(app: &S, req: R) -> (StatusCode, Value)
where
    S: Service<R, Response = ServiceResponse<B>, Error = E>,
    E: std::fmt::Debug,
    B: MessageBody,
{
    let resp = test::call_service(app, req).await;
    let status = resp.status();
    let body = test::read_body(resp).await;
    let value = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body).unwrap() };
    (status, value)
}

/// Calls the bootstrap endpoint and returns the redirect target.
pub async fn bootstrap<S, R, B, E>(app: &S, req: R) -> (StatusCode, Option<String>)
where
    S: Service<R, Response = ServiceResponse<B>, Error = E>,
    E: std::fmt::Debug,
    B: MessageBody,
{
    let resp = test::call_service(app, req).await;
    let location = resp
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (resp.status(), location)
}

pub fn creation(token: &str) -> TestRequest {
    get("/api/auth/creation", token)
}

pub fn standup() -> Value {
    json!({
        "title": "Standup",
        "sessionType": "GROUP_DISCUSSION",
        "communicationModes": ["CHAT"]
    })
}

pub fn uuid_of(value: &Value) -> uuid::Uuid {
    value.as_str().and_then(|s| s.parse().ok()).unwrap()
}

/// Id of a user created through the bootstrap endpoint.
pub fn user_id(state: &AppState, external_id: &str) -> uuid::Uuid {
    state.store.find_user_by_external_id(external_id).unwrap().unwrap().id
}
