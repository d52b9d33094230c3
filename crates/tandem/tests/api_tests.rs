//! API integration tests.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use std::time::Duration;
use tower::ServiceExt;

mod common;
use common::test_app;

async fn request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri).method(method);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_string(&value).unwrap())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn create_session(app: &Router) -> String {
    let (status, body) = request(
        app,
        Method::POST,
        "/api/sessions",
        Some(json!({"project_id": "proj-1", "title": "Fix the build"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

/// Publishing is asynchronous; poll the log until `count` events land.
async fn wait_for_events(app: &Router, session_id: &str, count: usize) -> Value {
    let uri = format!("/api/sessions/{}/events", session_id);
    for _ in 0..100 {
        let (status, body) = request(app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        if body.as_array().unwrap().len() >= count {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} events for session {}", count, session_id);
}

/// Test that health endpoint works.
#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;

    let (status, body) = request(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_create_and_get_session() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let (status, body) = request(
        &app,
        Method::GET,
        &format!("/api/sessions/{}", session_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], session_id.as_str());
    assert_eq!(body["project_id"], "proj-1");
    assert_eq!(body["status"], "active");
}

#[tokio::test]
async fn test_get_missing_session() {
    let app = test_app().await;

    let (status, body) = request(&app, Method::GET, "/api/sessions/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_create_session_requires_project() {
    let app = test_app().await;

    let (status, body) = request(
        &app,
        Method::POST,
        "/api/sessions",
        Some(json!({"project_id": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_publish_and_list_events() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let (status, receipt) = request(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/events", session_id),
        Some(json!({"type": "chunk", "data": {"text": "hello"}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(receipt["event_id"].is_string());
    assert!(receipt["timestamp"].is_i64());

    let events = wait_for_events(&app, &session_id, 1).await;
    let event = &events[0];
    assert_eq!(event["type"], "chunk");
    assert_eq!(event["offset"], 0);
    assert_eq!(event["data"]["text"], "hello");
    assert_eq!(event["id"], receipt["event_id"]);
}

#[tokio::test]
async fn test_offsets_are_sequential() {
    let app = test_app().await;
    let session_id = create_session(&app).await;
    let uri = format!("/api/sessions/{}/events", session_id);

    for text in ["a", "b", "c"] {
        let (status, _) = request(
            &app,
            Method::POST,
            &uri,
            Some(json!({"type": "chunk", "data": text})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let events = wait_for_events(&app, &session_id, 3).await;
    let offsets: Vec<i64> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["offset"].as_i64().unwrap())
        .collect();
    assert_eq!(offsets, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_publish_to_missing_session() {
    let app = test_app().await;

    let (status, body) = request(
        &app,
        Method::POST,
        "/api/sessions/nope/events",
        Some(json!({"type": "chunk", "data": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_publish_to_closed_session() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let (status, body) = request(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/close", session_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "closed");

    let (status, body) = request(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/events", session_id),
        Some(json!({"type": "chunk", "data": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CLOSED");
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let app = test_app().await;
    let session_id = create_session(&app).await;
    let uri = format!("/api/sessions/{}/close", session_id);

    let (status, _) = request(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "closed");
}

#[tokio::test]
async fn test_history_windowed_by_start_time() {
    let app = test_app().await;
    let session_id = create_session(&app).await;
    let uri = format!("/api/sessions/{}/events", session_id);

    let (status, _) = request(
        &app,
        Method::POST,
        &uri,
        Some(json!({"type": "chunk", "data": "old", "timestamp": 1000})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = request(
        &app,
        Method::POST,
        &uri,
        Some(json!({"type": "chunk", "data": "fresh", "timestamp": 2000})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for_events(&app, &session_id, 2).await;

    let (status, body) = request(
        &app,
        Method::GET,
        &format!("/api/sessions/{}/history?start_time=1500", session_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["data"], "fresh");
}

#[tokio::test]
async fn test_events_pagination() {
    let app = test_app().await;
    let session_id = create_session(&app).await;
    let uri = format!("/api/sessions/{}/events", session_id);

    for i in 0..5 {
        request(
            &app,
            Method::POST,
            &uri,
            Some(json!({"type": "chunk", "data": i})),
        )
        .await;
    }
    wait_for_events(&app, &session_id, 5).await;

    let (status, body) = request(
        &app,
        Method::GET,
        &format!("{}?limit=2&offset=2", uri),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["offset"], 2);
    assert_eq!(events[1]["offset"], 3);
}

#[tokio::test]
async fn test_presence_flow() {
    let app = test_app().await;
    let session_id = create_session(&app).await;
    let presence_uri = format!("/api/sessions/{}/presence", session_id);

    let (status, user) = request(
        &app,
        Method::POST,
        &format!("{}/join", presence_uri),
        Some(json!({"user_id": "u1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["user_id"], "u1");

    let (status, user) = request(
        &app,
        Method::PUT,
        &presence_uri,
        Some(json!({"user_id": "u1", "cursor": {"x": 5, "y": 9}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["cursor"]["x"], 5.0);
    assert_eq!(user["cursor"]["y"], 9.0);

    let (status, users) = request(&app, Method::GET, &presence_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let users = users.as_array().unwrap().clone();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["user_id"], "u1");
    assert_eq!(users[0]["cursor"]["x"], 5.0);

    let (status, _) = request(
        &app,
        Method::POST,
        &format!("{}/leave", presence_uri),
        Some(json!({"user_id": "u1"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, users) = request(&app, Method::GET, &presence_uri, None).await;
    assert!(users.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_presence_update_requires_join() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let (status, body) = request(
        &app,
        Method::PUT,
        &format!("/api/sessions/{}/presence", session_id),
        Some(json!({"user_id": "ghost", "cursor": {"x": 1, "y": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_presence_join_closed_session() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    request(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/close", session_id),
        None,
    )
    .await;

    let (status, body) = request(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/presence/join", session_id),
        Some(json!({"user_id": "u1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CLOSED");
}

#[tokio::test]
async fn test_presence_events_appear_on_stream() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    request(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/presence/join", session_id),
        Some(json!({"user_id": "u1"})),
    )
    .await;

    let events = wait_for_events(&app, &session_id, 1).await;
    assert_eq!(events[0]["type"], "presence:joined");
    assert_eq!(events[0]["data"]["user_id"], "u1");
}

#[tokio::test]
async fn test_summary_flow() {
    let app = test_app().await;
    let session_id = create_session(&app).await;
    let summary_uri = format!("/api/sessions/{}/summary", session_id);

    // No events yet, so no summary row either.
    let (status, body) = request(&app, Method::GET, &summary_uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    request(
        &app,
        Method::POST,
        &format!("/api/sessions/{}/events", session_id),
        Some(json!({"type": "chunk", "data": "a"})),
    )
    .await;
    wait_for_events(&app, &session_id, 1).await;

    let (status, summary) = request(&app, Method::GET, &summary_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["last_offset"], 0);

    let (status, summary) = request(
        &app,
        Method::PATCH,
        &summary_uri,
        Some(json!({"counters": {"chunks": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["counters"]["chunks"], 1);
    assert_eq!(summary["last_offset"], 0);
}

#[tokio::test]
async fn test_stream_endpoint_is_sse() {
    let app = test_app().await;
    let session_id = create_session(&app).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/sessions/{}/stream", session_id))
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"));
}

#[tokio::test]
async fn test_stream_missing_session() {
    let app = test_app().await;

    let (status, body) = request(&app, Method::GET, "/api/sessions/nope/stream", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}
