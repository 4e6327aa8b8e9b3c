#[macro_use]
mod common;

use actix_web::http::header::{LOCATION, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::test::{self, TestRequest};
use serde_json::json;

use common::*;

#[actix_web::test]
async fn health_is_public() {
    let state = state();
    let app = test_app!(state);

    let (status, body) = send(&app, TestRequest::get().uri("/api/health").to_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[actix_web::test]
async fn anonymous_pages_redirect_to_sign_in() {
    let state = state();
    let app = test_app!(state);

    let resp = test::call_service(&app, TestRequest::get().uri("/dashboard/sessions").to_request()).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers().get(LOCATION).unwrap(), "/sign-in");

    let (status, body) = send(&app, TestRequest::get().uri("/api/trpc/session.getMySessions").to_request()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[actix_web::test]
async fn thirty_first_burst_request_is_throttled() {
    let state = state();
    let app = test_app!(state);
    let alice = token(&state, "alice");
    bootstrap(&app, creation(&alice).to_request()).await;

    for _ in 0..30 {
        let (status, _) = send(&app, get("/api/trpc/session.getMySessions", &alice).to_request()).await;
        assert_eq!(status, StatusCode::OK);
    }

    let resp = test::call_service(&app, get("/api/trpc/session.getMySessions", &alice).to_request()).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().get(RETRY_AFTER).is_some());
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({ "error": "Rate limit exceeded" }));

    // Budgets are per actor.
    let bob = token(&state, "bob");
    bootstrap(&app, creation(&bob).to_request()).await;
    let (status, _) = send(&app, get("/api/trpc/session.getMySessions", &bob).to_request()).await;
    assert_eq!(status, StatusCode::OK);
}

#[actix_web::test]
async fn throttling_applies_before_sign_in_redirect() {
    let state = state();
    let app = test_app!(state);

    for _ in 0..30 {
        let resp = test::call_service(&app, TestRequest::get().uri("/complete-profile").to_request()).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
    }

    let resp = test::call_service(&app, TestRequest::get().uri("/complete-profile").to_request()).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn unknown_procedure_is_not_found() {
    let state = state();
    let app = test_app!(state);
    let alice = token(&state, "alice");
    bootstrap(&app, creation(&alice).to_request()).await;

    let (status, body) = send(&app, get("/api/trpc/session.delete", &alice).to_request()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}
