//! # Request Dispatch & Validation
//!
//! The HTTP surface: translates verb + path + query into engine operations,
//! enforces the request-shape matrix, maps outcomes and errors to status
//! codes, and drives the subscription fabric after successful writes.
//!
//! ## Routes
//!
//! - `POST /auth` issues a bearer token, `DELETE /auth` revokes one.
//! - `GET/PUT/POST/DELETE/PATCH /v1/<segments>[/]` are resource operations.
//! - `GET /v1/<segments>[/]?mode=subscribe` upgrades to a Server-Sent-Event
//!   stream after a successful read of the resource.
//! - `OPTIONS` anywhere answers the CORS preflight with the verb list for
//!   the classified resource kind.
//!
//! ## Validation matrix
//!
//! Path depth classifies the kind (1 = database, even = document, odd > 1 =
//! collection); the verb must be in the kind's supported set. Document paths
//! reject a trailing slash and `interval`; collection paths require the
//! trailing slash and reject `nooverwrite`; database paths require no slash
//! for PUT/DELETE, a slash for GET/POST, and reject `nooverwrite`. Shape
//! violations are 400s, checked before authorization.
//!
//! ## Notifications
//!
//! After a successful write the handler notifies subscribers at the written
//! path (`same_level = true`) and, for documents, at the enclosing
//! collection's listing path (`same_level = false`). Update payloads are the
//! post-state content read back from the engine; delete payloads are the
//! path string. Fan-out failures are logged and never affect the response.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body as HttpBody, Bytes};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::any;
use axum::Router;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::auth::{bearer_token, TokenTable};
use crate::error::Error;
use crate::schema::SchemaValidator;
use crate::store::{Body, Outcome, Request, Store, Verb};
use crate::subscription::{
    EventType, SubscriptionFabric, KEEP_ALIVE_COMMENT, KEEP_ALIVE_INTERVAL,
};

// =============================================================================
// Server Context
// =============================================================================

/// Process-wide server state shared by every handler: the resource engine,
/// the subscription registry, and the token table.
pub struct ServerContext {
    /// The resource engine.
    pub store: Store,
    /// The subscription registry.
    pub subscriptions: SubscriptionFabric,
    /// The bearer-token table.
    pub tokens: TokenTable,
}

impl ServerContext {
    /// Assembles the context from the startup inputs.
    pub fn new(validator: SchemaValidator, tokens: TokenTable) -> Self {
        ServerContext {
            store: Store::new(Arc::new(validator)),
            subscriptions: SubscriptionFabric::new(),
            tokens,
        }
    }
}

/// Shared handle to the server context.
pub type SharedContext = Arc<ServerContext>;

/// Builds the application router.
pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/auth", any(handle_auth))
        .route("/v1/", any(handle_empty_path))
        .route("/v1/*path", any(handle_resource))
        .with_state(ctx)
}

// =============================================================================
// Resource Kinds & Validation
// =============================================================================

/// What a path of a given depth names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceKind {
    Database,
    Document,
    Collection,
}

/// Depth 1 is a database, even depth a document, odd depth > 1 a collection.
fn classify(depth: usize) -> ResourceKind {
    if depth == 1 {
        ResourceKind::Database
    } else if depth % 2 == 0 {
        ResourceKind::Document
    } else {
        ResourceKind::Collection
    }
}

/// The verbs each kind supports, in the order advertised to OPTIONS.
fn supported_verbs(kind: ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::Database => &["GET", "PUT", "POST", "DELETE"],
        ResourceKind::Document => &["GET", "PUT", "DELETE", "PATCH"],
        ResourceKind::Collection => &["GET", "PUT", "DELETE", "POST"],
    }
}

fn verb_from_method(method: &Method) -> Option<Verb> {
    match method.as_str() {
        "GET" => Some(Verb::Get),
        "PUT" => Some(Verb::Put),
        "POST" => Some(Verb::Post),
        "DELETE" => Some(Verb::Delete),
        "PATCH" => Some(Verb::Patch),
        _ => None,
    }
}

/// The request-shape matrix. Everything rejected here is a 400 with no side
/// effects.
fn validate_request(
    method: &Method,
    kind: ResourceKind,
    trailing_slash: bool,
    has_interval: bool,
    no_overwrite: bool,
) -> Result<(), Error> {
    if !supported_verbs(kind).contains(&method.as_str()) {
        return Err(Error::BadRequest("invalid request type".to_string()));
    }
    let bad_path = || Error::BadRequest("bad request path".to_string());
    match kind {
        ResourceKind::Document => {
            if trailing_slash || has_interval {
                return Err(bad_path());
            }
        }
        ResourceKind::Collection => {
            if !trailing_slash || no_overwrite {
                return Err(bad_path());
            }
        }
        ResourceKind::Database => {
            if no_overwrite {
                return Err(bad_path());
            }
            let name = method.as_str();
            if (name == "PUT" || name == "DELETE") && trailing_slash {
                return Err(bad_path());
            }
            if (name == "GET" || name == "POST") && !trailing_slash {
                return Err(bad_path());
            }
        }
    }
    Ok(())
}

/// Parses `interval=[lo,hi]`: brackets mandatory, comma-separated, exactly
/// two bounds.
fn parse_interval(raw: &str) -> Result<(String, String), Error> {
    let invalid = || Error::BadRequest("invalid interval".to_string());
    let inner = raw
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(invalid)?;
    let bounds: Vec<&str> = inner.split(',').collect();
    if bounds.len() != 2 {
        return Err(invalid());
    }
    Ok((bounds[0].to_string(), bounds[1].to_string()))
}

// =============================================================================
// Auth Endpoint
// =============================================================================

#[derive(Serialize)]
struct TokenResponse {
    token: String,
}

async fn handle_auth(
    State(ctx): State<SharedContext>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    match method.as_str() {
        "POST" => {
            let credentials: HashMap<String, String> = match serde_json::from_slice(&body) {
                Ok(map) => map,
                Err(_) => {
                    return error_response(&Error::BadRequest(
                        "login request body in incorrect format".to_string(),
                    ))
                }
            };
            let username = match credentials.get("username") {
                Some(name) if !name.is_empty() => name.clone(),
                _ => {
                    return error_response(&Error::BadRequest(
                        "No username in request body".to_string(),
                    ))
                }
            };
            let token = ctx.tokens.login(&username);
            info!(username = %username, "issued bearer token");
            json_response(StatusCode::OK, &TokenResponse { token })
        }
        "DELETE" => {
            let result = bearer_token(auth_header(&headers))
                .and_then(|token| ctx.tokens.logout(token));
            match result {
                Ok(()) => (StatusCode::NO_CONTENT, base_headers(), Vec::new()).into_response(),
                Err(err) => error_response(&err),
            }
        }
        "OPTIONS" => preflight_response("POST, DELETE"),
        _ => error_response(&Error::BadRequest("bad request".to_string())),
    }
}

// =============================================================================
// Resource Endpoint
// =============================================================================

async fn handle_empty_path() -> HttpResponse {
    error_response(&Error::BadRequest("bad request path".to_string()))
}

async fn handle_resource(
    State(ctx): State<SharedContext>,
    UrlPath(rest): UrlPath<String>,
    Query(params): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    // The externally visible resource path, used as the subscription key and
    // the delete payload.
    let raw_path = format!("/v1/{rest}");

    // Normalize: strip a single optional trailing slash, then split.
    let trailing_slash = rest.ends_with('/');
    let stripped = if trailing_slash {
        &rest[..rest.len() - 1]
    } else {
        rest.as_str()
    };
    if stripped.is_empty() {
        return error_response(&Error::BadRequest("bad request path".to_string()));
    }
    let segments: Vec<String> = stripped.split('/').map(str::to_string).collect();
    let kind = classify(segments.len());

    if method == Method::OPTIONS {
        return preflight_response(&supported_verbs(kind).join(", "));
    }

    let interval = match params.get("interval") {
        Some(raw) => match parse_interval(raw) {
            Ok(bounds) => Some(bounds),
            Err(err) => return error_response(&err),
        },
        None => None,
    };
    let mode = params.get("mode").map(String::as_str);
    let no_overwrite = mode == Some("nooverwrite");
    let subscribe = mode == Some("subscribe");

    if let Err(err) = validate_request(&method, kind, trailing_slash, interval.is_some(), no_overwrite)
    {
        return error_response(&err);
    }

    let username = match bearer_token(auth_header(&headers))
        .and_then(|token| ctx.tokens.authorize(token))
    {
        Ok(username) => username,
        Err(err) => return error_response(&err),
    };

    let verb = match verb_from_method(&method) {
        Some(verb) => verb,
        None => return error_response(&Error::BadRequest("invalid HTTP request".to_string())),
    };

    let request = Request {
        verb,
        path: &segments,
        body: &body,
        username: &username,
        interval,
        no_overwrite,
    };
    let response = match ctx.store.handle(&request) {
        Ok(response) => response,
        Err(err) => {
            warn!(method = %method, path = %raw_path, error = %err, "operation failed");
            return error_response(&err);
        }
    };

    // A successful subscription GET switches to the event stream instead of
    // returning the read result.
    if verb == Verb::Get && subscribe {
        return subscribe_response(ctx, raw_path, username);
    }

    notify_subscribers(&ctx, verb, kind, &raw_path, &segments, &response, &username);

    info!(method = %method, path = %raw_path, "request served");
    success_response(&response)
}

// =============================================================================
// Notification Policy
// =============================================================================

/// Fan-out after a successful write, at document and enclosing-collection
/// granularity. Best-effort: every failure here is logged and swallowed.
fn notify_subscribers(
    ctx: &ServerContext,
    verb: Verb,
    kind: ResourceKind,
    raw_path: &str,
    segments: &[String],
    response: &crate::store::Response,
    username: &str,
) {
    let event_type = match verb {
        Verb::Delete => EventType::Delete,
        Verb::Put | Verb::Post | Verb::Patch => EventType::Update,
        Verb::Get => return,
    };

    let payload = match event_payload(ctx, verb, event_type, raw_path, segments, response, username)
    {
        Some(payload) => payload,
        None => return,
    };

    // Exact-path granularity. Database writes address their listeners at the
    // listing path `P/`, whether or not the request path carried the slash
    // (POST does, PUT/DELETE do not).
    let database_path = format!("{}/", raw_path.trim_end_matches('/'));
    if kind == ResourceKind::Database && ctx.subscriptions.has_clients(&database_path) {
        if let Err(err) = ctx
            .subscriptions
            .dispatch(&database_path, &payload, true, event_type)
        {
            warn!(path = %database_path, error = %err, "partial fan-out");
        }
    } else if ctx.subscriptions.has_clients(raw_path) {
        if let Err(err) = ctx
            .subscriptions
            .dispatch(raw_path, &payload, true, event_type)
        {
            warn!(path = %raw_path, error = %err, "partial fan-out");
        }
    }

    // Enclosing-collection granularity for document writes, delivered
    // whether or not document-level listeners exist.
    if kind == ResourceKind::Document {
        let enclosing = format!("/v1/{}/", segments[..segments.len() - 1].join("/"));
        if ctx.subscriptions.has_clients(&enclosing) {
            if let Err(err) = ctx
                .subscriptions
                .dispatch(&enclosing, &payload, false, event_type)
            {
                warn!(path = %enclosing, error = %err, "partial fan-out");
            }
        }
    }
}

/// The notification payload: the path string for deletes, the post-state
/// body (via an internal GET) for updates. `None` means skip notifying.
fn event_payload(
    ctx: &ServerContext,
    verb: Verb,
    event_type: EventType,
    raw_path: &str,
    segments: &[String],
    response: &crate::store::Response,
    username: &str,
) -> Option<String> {
    match event_type {
        EventType::Delete => serde_json::to_string(raw_path).ok(),
        EventType::Update => {
            let mut event_segments = segments.to_vec();
            if verb == Verb::Post {
                // POST created a fresh name; the post-state lives at the
                // path the engine responded with.
                let Body::Uri(put) = &response.body else {
                    return None;
                };
                event_segments.push(put.uri.rsplit('/').next()?.to_string());
            }

            let read = Request {
                verb: Verb::Get,
                path: &event_segments,
                body: &[],
                username,
                interval: None,
                no_overwrite: false,
            };
            match ctx.store.handle(&read) {
                Ok(post_state) => serde_json::to_string(&post_state.body).ok(),
                Err(err) => {
                    warn!(error = %err, "post-write read for notification failed");
                    None
                }
            }
        }
    }
}

// =============================================================================
// Subscription Streams
// =============================================================================

/// Unregisters the channel when the response stream is dropped, which is how
/// client disconnection reaches the registry.
///
/// Holds only a weak sender: the registry's entry must be the last thing
/// keeping the channel open, so that a same-level delete purge closes the
/// subscriber's stream.
struct UnregisterOnDrop {
    ctx: SharedContext,
    path: String,
    sender: mpsc::WeakSender<String>,
}

impl Drop for UnregisterOnDrop {
    fn drop(&mut self) {
        // Upgrade fails only when the registry already purged the entry.
        if let Some(sender) = self.sender.upgrade() {
            self.ctx.subscriptions.unregister(&self.path, &sender);
        }
        info!(path = %self.path, "subscriber disconnected");
    }
}

/// Streams SSE frames for `path` until the client disconnects or the
/// resource is deleted out from under the subscriber.
fn subscribe_response(ctx: SharedContext, path: String, username: String) -> HttpResponse {
    let (sender, receiver) = SubscriptionFabric::channel();
    let weak_sender = sender.downgrade();
    if let Err(err) = ctx.subscriptions.register(&path, sender) {
        return error_response(&err);
    }
    info!(path = %path, username = %username, "subscriber connected");

    let guard = UnregisterOnDrop {
        ctx: Arc::clone(&ctx),
        path,
        sender: weak_sender,
    };
    let ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL,
        KEEP_ALIVE_INTERVAL,
    );

    // The sender loop: wake on {frame queued, keep-alive tick}; end when the
    // channel closes (same-level delete purge) or the client goes away (the
    // stream, and with it the guard, is dropped).
    let stream = futures::stream::unfold(
        (receiver, ticker, guard),
        |(mut receiver, mut ticker, guard)| async move {
            let frame = tokio::select! {
                message = receiver.recv() => message?,
                _ = ticker.tick() => KEEP_ALIVE_COMMENT.to_string(),
            };
            Some((Ok::<_, Infallible>(frame), (receiver, ticker, guard)))
        },
    );

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "Content-Type, Authorization, Last-Event-ID",
            ),
        ],
        HttpBody::from_stream(stream),
    )
        .into_response()
}

// =============================================================================
// Response Helpers
// =============================================================================

fn auth_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

fn base_headers() -> [(header::HeaderName, &'static str); 3] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Authorization, Content-Type",
        ),
        (header::CONTENT_TYPE, "application/json"),
    ]
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => (status, base_headers(), body).into_response(),
        Err(_) => error_response(&Error::BadRequest("failed to encode response".to_string())),
    }
}

fn error_response(err: &Error) -> HttpResponse {
    let status = status_for(err);
    let body = serde_json::to_vec(&err.to_string()).unwrap_or_default();
    (status, base_headers(), body).into_response()
}

fn success_response(response: &crate::store::Response) -> HttpResponse {
    let status = match response.outcome {
        Outcome::Created => StatusCode::CREATED,
        Outcome::Fetched | Outcome::Overwritten | Outcome::Patched => StatusCode::OK,
        Outcome::Deleted => StatusCode::NO_CONTENT,
    };
    if response.outcome == Outcome::Deleted {
        return (status, base_headers(), Vec::new()).into_response();
    }
    json_response(status, &response.body)
}

fn preflight_response(methods: &str) -> HttpResponse {
    (
        StatusCode::OK,
        [
            (header::ALLOW, methods.to_string()),
            (header::ACCESS_CONTROL_ALLOW_METHODS, methods.to_string()),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "Authorization, Content-Type".to_string(),
            ),
        ],
        String::new(),
    )
        .into_response()
}

/// Maps the error taxonomy to HTTP status codes.
fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::PRECONDITION_FAILED,
        _ => StatusCode::BAD_REQUEST,
    }
}

// =============================================================================
// Tests
// =============================================================================
