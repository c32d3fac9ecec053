//! Live subscription scenarios over the HTTP router.
//!
//! Subscribers open `GET ...?mode=subscribe` streams; writers go through the
//! normal verbs. The suites read SSE frames straight off the streaming
//! response bodies.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use futures::StreamExt;

use common::{app, authed, login, permissive_context, read_json, send};

/// Reads one SSE frame (terminated by a blank line) off a streaming body.
async fn next_frame(body: &mut axum::body::BodyDataStream) -> String {
    let mut buffer = String::new();
    loop {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("timed out waiting for an SSE frame")
            .expect("stream ended while waiting for a frame")
            .expect("body error");
        buffer.push_str(std::str::from_utf8(&chunk).unwrap());
        if buffer.ends_with("\n\n") {
            return buffer;
        }
    }
}

fn into_stream(response: Response<Body>) -> axum::body::BodyDataStream {
    response.into_body().into_data_stream()
}

async fn subscribe(app: &axum::Router, uri: &str, token: &str) -> axum::body::BodyDataStream {
    let response = send(app, authed("GET", uri, token, "")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("Content-Type")
            .unwrap()
            .to_str()
            .unwrap(),
        "text/event-stream"
    );
    into_stream(response)
}

/// Scenario: two document subscribers and one collection subscriber all see
/// a PUT; the frames carry the post-state content.
#[tokio::test]
async fn document_write_notifies_document_and_collection_subscribers() {
    let ctx = permissive_context();
    let app = app(&ctx);
    let token = login(&app, "alice").await;

    send(&app, authed("PUT", "/v1/db", &token, "")).await;
    send(&app, authed("PUT", "/v1/db/doc", &token, r#"{"x": 0}"#)).await;

    let mut first = subscribe(&app, "/v1/db/doc?mode=subscribe", &token).await;
    let mut second = subscribe(&app, "/v1/db/doc?mode=subscribe", &token).await;
    let mut listing = subscribe(&app, "/v1/db/?mode=subscribe", &token).await;

    let response = send(&app, authed("PUT", "/v1/db/doc", &token, r#"{"x": 7}"#)).await;
    assert_eq!(response.status(), StatusCode::OK);

    for stream in [&mut first, &mut second] {
        let frame = next_frame(stream).await;
        assert!(frame.starts_with("event: update\n"), "frame: {frame}");
        let data_line = frame
            .lines()
            .find(|line| line.starts_with("data: "))
            .unwrap();
        let payload: serde_json::Value =
            serde_json::from_str(data_line.trim_start_matches("data: ")).unwrap();
        assert_eq!(payload["doc"], serde_json::json!({"x": 7.0}));
        assert_eq!(payload["path"], "/v1/db/doc");
    }

    // The enclosing-collection subscriber sees the update too; its payload
    // is the post-state of the written document's path read as a listing
    // member set.
    let frame = next_frame(&mut listing).await;
    assert!(frame.starts_with("event: update\n"));
    assert!(frame.contains("\"x\":7.0"), "frame: {frame}");
}

/// Scenario: deleting a subscribed document delivers a delete frame whose
/// payload is the path, then closes the stream.
#[tokio::test]
async fn delete_notifies_then_closes_same_level_stream() {
    let ctx = permissive_context();
    let app = app(&ctx);
    let token = login(&app, "alice").await;

    send(&app, authed("PUT", "/v1/db", &token, "")).await;
    send(&app, authed("PUT", "/v1/db/doc", &token, r#"{"x": 0}"#)).await;

    let mut stream = subscribe(&app, "/v1/db/doc?mode=subscribe", &token).await;

    let response = send(&app, authed("DELETE", "/v1/db/doc", &token, "")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let frame = next_frame(&mut stream).await;
    assert!(frame.starts_with("event: delete\n"), "frame: {frame}");
    assert!(frame.contains("data: \"/v1/db/doc\""));

    // The registry purged the list; the stream ends.
    let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for stream end");
    assert!(end.is_none(), "stream should close after a same-level delete");
}

/// Subscribing to a missing resource fails like any other GET.
#[tokio::test]
async fn subscribe_to_missing_resource_is_404() {
    let ctx = permissive_context();
    let app = app(&ctx);
    let token = login(&app, "alice").await;
    send(&app, authed("PUT", "/v1/db", &token, "")).await;

    let response = send(&app, authed("GET", "/v1/db/nope?mode=subscribe", &token, "")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// A database subscriber (listing path) sees document creations via POST.
#[tokio::test]
async fn database_subscriber_sees_posted_documents() {
    let ctx = permissive_context();
    let app = app(&ctx);
    let token = login(&app, "alice").await;
    send(&app, authed("PUT", "/v1/db", &token, "")).await;

    let mut stream = subscribe(&app, "/v1/db/?mode=subscribe", &token).await;

    let response = send(&app, authed("POST", "/v1/db/", &token, r#"{"fresh": true}"#)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = read_json(response).await;
    let uri = created["uri"].as_str().unwrap();

    let frame = next_frame(&mut stream).await;
    assert!(frame.starts_with("event: update\n"));
    assert!(frame.contains(uri), "frame should carry the new document path");
}

/// Slow subscribers drop frames but stay registered: later writes still
/// reach them once they drain.
#[tokio::test]
async fn writes_to_sibling_documents_do_not_cross_paths() {
    let ctx = permissive_context();
    let app = app(&ctx);
    let token = login(&app, "alice").await;
    send(&app, authed("PUT", "/v1/db", &token, "")).await;
    send(&app, authed("PUT", "/v1/db/one", &token, r#"{"n": 1}"#)).await;
    send(&app, authed("PUT", "/v1/db/two", &token, r#"{"n": 2}"#)).await;

    let mut stream = subscribe(&app, "/v1/db/one?mode=subscribe", &token).await;

    // A write to a sibling must not reach this subscriber; a write to the
    // subscribed document must.
    send(&app, authed("PUT", "/v1/db/two", &token, r#"{"n": 22}"#)).await;
    send(&app, authed("PUT", "/v1/db/one", &token, r#"{"n": 11}"#)).await;

    let frame = next_frame(&mut stream).await;
    assert!(frame.contains("\"n\":11.0"), "frame: {frame}");
    assert!(!frame.contains("\"n\":22.0"));
}
