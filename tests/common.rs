//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use roostdb::api::{router, ServerContext, SharedContext};
use roostdb::auth::TokenTable;
use roostdb::schema::SchemaValidator;

/// A server context whose schema accepts any document.
pub fn permissive_context() -> SharedContext {
    let validator = SchemaValidator::from_value(&serde_json::json!({})).unwrap();
    Arc::new(ServerContext::new(validator, TokenTable::new()))
}

/// A server context with the given schema.
pub fn context_with_schema(schema: serde_json::Value) -> SharedContext {
    let validator = SchemaValidator::from_value(&schema).unwrap();
    Arc::new(ServerContext::new(validator, TokenTable::new()))
}

/// The application router over a shared context.
pub fn app(ctx: &SharedContext) -> Router {
    router(Arc::clone(ctx))
}

/// Sends one request through the router without binding a port.
pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

/// Issues a bearer token through `POST /auth`.
pub async fn login(app: &Router, username: &str) -> String {
    let request = Request::post("/auth")
        .body(Body::from(format!(r#"{{"username": "{username}"}}"#)))
        .unwrap();
    let response = send(app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    body["token"].as_str().unwrap().to_string()
}

/// An authorized request with a JSON body.
pub fn authed(method: &str, uri: &str, token: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Collects the whole response body.
pub async fn read_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

/// Collects and parses the response body as JSON.
pub async fn read_json(response: Response<Body>) -> serde_json::Value {
    let bytes = read_bytes(response).await;
    serde_json::from_slice(&bytes).unwrap()
}
