#[macro_use]
mod common;

use actix_web::http::StatusCode;
use serde_json::{json, Value};
use std::collections::HashSet;

use common::*;
use speakspace::relay::RelayEvent;

fn messages_path(session_id: &Value, cursor: Option<&Value>, limit: Option<i64>) -> String {
    let mut path = format!("/api/trpc/message.getSessionMessages?sessionId={}", uuid_of(session_id));
    if let Some(cursor) = cursor {
        path.push_str(&format!("&cursor={}", uuid_of(cursor)));
    }
    if let Some(limit) = limit {
        path.push_str(&format!("&limit={}", limit));
    }
    path
}

#[actix_web::test]
async fn standup_message_reaches_moderator_history() {
    let state = state();
    let app = test_app!(state);
    let (alice, bob) = (token(&state, "alice"), token(&state, "bob"));
    bootstrap(&app, creation(&alice).to_request()).await;
    bootstrap(&app, creation(&bob).to_request()).await;

    let (_, created) = send(&app, post("/api/trpc/session.create", &alice, standup()).to_request()).await;
    let code = created["session"]["code"].as_str().unwrap().to_string();
    let session_id = created["session"]["id"].clone();

    let (status, _) = send(&app, post("/api/trpc/session.join", &bob, json!({ "code": code })).to_request()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, sent) = send(
        &app,
        post("/api/trpc/message.send", &bob, json!({ "sessionId": session_id, "content": "hi" })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sent["sender"]["username"], "bob");

    let (status, page) = send(&app, get(&messages_path(&session_id, None, Some(50)), &alice).to_request()).await;
    assert_eq!(status, StatusCode::OK);
    let messages = page["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "hi");
    assert!(page["nextCursor"].is_null());
}

#[actix_web::test]
async fn send_needs_content_or_media() {
    let state = state();
    let app = test_app!(state);
    let alice = token(&state, "alice");
    bootstrap(&app, creation(&alice).to_request()).await;
    let (_, created) = send(&app, post("/api/trpc/session.create", &alice, standup()).to_request()).await;
    let session_id = created["session"]["id"].clone();

    let (status, body) = send(
        &app,
        post("/api/trpc/message.send", &alice, json!({ "sessionId": session_id })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, _) = send(
        &app,
        post("/api/trpc/message.send", &alice, json!({ "sessionId": session_id, "content": "", "mediaUrl": "" })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, sent) = send(
        &app,
        post(
            "/api/trpc/message.send",
            &alice,
            json!({ "sessionId": session_id, "mediaUrl": "https://cdn.example.com/a.png", "mediaType": "image/png" }),
        )
        .to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(sent["content"].is_null());
    assert_eq!(sent["mediaType"], "image/png");
}

#[actix_web::test]
async fn only_active_members_send_but_former_members_read() {
    let state = state();
    let app = test_app!(state);
    let (alice, bob, mallory) = (token(&state, "alice"), token(&state, "bob"), token(&state, "mallory"));
    for t in [&alice, &bob, &mallory] {
        bootstrap(&app, creation(t).to_request()).await;
    }
    let (_, created) = send(&app, post("/api/trpc/session.create", &alice, standup()).to_request()).await;
    let code = created["session"]["code"].as_str().unwrap().to_string();
    let session_id = created["session"]["id"].clone();

    let (status, _) = send(
        &app,
        post("/api/trpc/message.send", &mallory, json!({ "sessionId": session_id, "content": "let me in" })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&app, get(&messages_path(&session_id, None, None), &mallory).to_request()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    send(&app, post("/api/trpc/session.join", &bob, json!({ "code": code })).to_request()).await;
    send(&app, post("/api/trpc/session.leave", &bob, json!({ "sessionId": session_id })).to_request()).await;

    let (status, _) = send(
        &app,
        post("/api/trpc/message.send", &bob, json!({ "sessionId": session_id, "content": "still here?" })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&app, get(&messages_path(&session_id, None, None), &bob).to_request()).await;
    assert_eq!(status, StatusCode::OK);
}

#[actix_web::test]
async fn cursor_pages_walk_history_without_repeats() {
    let state = state();
    let app = test_app!(state);
    let alice = token(&state, "alice");
    bootstrap(&app, creation(&alice).to_request()).await;
    let (_, created) = send(&app, post("/api/trpc/session.create", &alice, standup()).to_request()).await;
    let session_id = created["session"]["id"].clone();

    for i in 1..=7 {
        let (status, _) = send(
            &app,
            post("/api/trpc/message.send", &alice, json!({ "sessionId": session_id, "content": format!("m{}", i) })).to_request(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let mut seen = HashSet::new();
    let mut pages = Vec::new();
    let mut cursor: Option<Value> = None;
    loop {
        let (status, page) = send(
            &app,
            get(&messages_path(&session_id, cursor.as_ref(), Some(3)), &alice).to_request(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let contents: Vec<String> = page["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| {
                assert!(seen.insert(m["id"].as_str().unwrap().to_string()), "message repeated across pages");
                m["content"].as_str().unwrap().to_string()
            })
            .collect();
        assert!(contents.len() <= 3);
        pages.push(contents);

        if page["nextCursor"].is_null() {
            break;
        }
        cursor = Some(page["nextCursor"].clone());
    }

    assert_eq!(
        pages,
        vec![
            vec!["m5".to_string(), "m6".to_string(), "m7".to_string()],
            vec!["m2".to_string(), "m3".to_string(), "m4".to_string()],
            vec!["m1".to_string()],
        ]
    );
    assert_eq!(seen.len(), 7);
}

#[actix_web::test]
async fn page_limit_is_bounded() {
    let state = state();
    let app = test_app!(state);
    let alice = token(&state, "alice");
    bootstrap(&app, creation(&alice).to_request()).await;
    let (_, created) = send(&app, post("/api/trpc/session.create", &alice, standup()).to_request()).await;
    let session_id = created["session"]["id"].clone();

    let (status, _) = send(&app, get(&messages_path(&session_id, None, Some(101)), &alice).to_request()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, page) = send(&app, get(&messages_path(&session_id, None, Some(100)), &alice).to_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(page["messages"].as_array().unwrap().is_empty());
}

#[actix_web::test]
async fn sent_message_is_relayed_to_room() {
    let state = state();
    let app = test_app!(state);
    let alice = token(&state, "alice");
    bootstrap(&app, creation(&alice).to_request()).await;
    let (_, created) = send(&app, post("/api/trpc/session.create", &alice, standup()).to_request()).await;
    let session_id = created["session"]["id"].clone();

    let mut room = state.hub.subscribe(uuid_of(&session_id));
    let (status, sent) = send(
        &app,
        post("/api/trpc/message.send", &alice, json!({ "sessionId": session_id, "content": "live" })).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    match room.try_recv().unwrap() {
        RelayEvent::NewMessage(message) => {
            assert_eq!(message.id, uuid_of(&sent["id"]));
            assert_eq!(message.content.as_deref(), Some("live"));
        }
        other => panic!("unexpected relay event {:?}", other),
    }
}

#[actix_web::test]
async fn join_and_leave_are_relayed_to_room() {
    let state = state();
    let app = test_app!(state);
    let (alice, bob) = (token(&state, "alice"), token(&state, "bob"));
    bootstrap(&app, creation(&alice).to_request()).await;
    bootstrap(&app, creation(&bob).to_request()).await;
    let (_, created) = send(&app, post("/api/trpc/session.create", &alice, standup()).to_request()).await;
    let code = created["session"]["code"].as_str().unwrap().to_string();
    let session_id = created["session"]["id"].clone();

    let mut room = state.hub.subscribe(uuid_of(&session_id));
    send(&app, post("/api/trpc/session.join", &bob, json!({ "code": code })).to_request()).await;
    send(&app, post("/api/trpc/session.join", &bob, json!({ "code": code })).to_request()).await;
    send(&app, post("/api/trpc/session.leave", &bob, json!({ "sessionId": session_id })).to_request()).await;

    assert!(matches!(room.try_recv().unwrap(), RelayEvent::UserJoined(p) if p.username == "bob"));
    // The repeated join was a no-op and announced nothing.
    assert!(matches!(room.try_recv().unwrap(), RelayEvent::UserLeft(p) if p.username == "bob"));
    assert!(room.try_recv().is_err());
}
