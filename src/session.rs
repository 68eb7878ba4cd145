//! Streamable HTTP transport.
//!
//! Each MCP client gets a session on `initialize`; the id travels in the
//! `mcp-session-id` header. Requests are answered inline as JSON, and a GET
//! on the same path opens an SSE stream for server-initiated notifications.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use rmcp::ServerHandler;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ErrorCode, ErrorData as McpError, LoggingLevel,
    RawContent, SetLevelRequestParam,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::server::SmartHomeServer;

pub const SESSION_HEADER: &str = "mcp-session-id";

const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const BAD_REQUEST: i32 = -32000;
const SESSION_NOT_FOUND: i32 = -32001;

// =============================================================================
// Sessions
// =============================================================================

fn severity(level: &LoggingLevel) -> u8 {
    match level {
        LoggingLevel::Debug => 0,
        LoggingLevel::Info => 1,
        LoggingLevel::Notice => 2,
        LoggingLevel::Warning => 3,
        LoggingLevel::Error => 4,
        LoggingLevel::Critical => 5,
        LoggingLevel::Alert => 6,
        LoggingLevel::Emergency => 7,
    }
}

pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    last_seen_ms: AtomicI64,
    protocol_version: std::sync::OnceLock<String>,
    /// Least severe `notifications/message` level the client wants to see.
    min_log_level: AtomicU8,
    events: broadcast::Sender<Value>,
    closed: CancellationToken,
}

impl Session {
    fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
            protocol_version: std::sync::OnceLock::new(),
            min_log_level: AtomicU8::new(severity(&LoggingLevel::Debug)),
            events,
            closed: CancellationToken::new(),
        }
    }

    fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let idle_ms = now.timestamp_millis() - self.last_seen_ms.load(Ordering::Relaxed);
        Duration::from_millis(idle_ms.max(0) as u64)
    }

    /// Push a JSON-RPC notification to any open SSE stream of this session.
    fn notify(&self, method: &str, params: Value) {
        let message = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        // No receivers just means no stream is open.
        let _ = self.events.send(message);
    }

    fn set_log_level(&self, level: &LoggingLevel) {
        self.min_log_level.store(severity(level), Ordering::Relaxed);
    }

    /// Send a log message to the client unless it is below the session's level.
    fn log(&self, level: LoggingLevel, data: Value) {
        if severity(&level) < self.min_log_level.load(Ordering::Relaxed) {
            return;
        }
        self.notify(
            "notifications/message",
            json!({ "level": level, "logger": env!("CARGO_PKG_NAME"), "data": data }),
        );
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, session: Arc<Session>) {
        tracing::info!(
            session_id = %session.id,
            protocol_version = session.protocol_version.get().map_or("unknown", String::as_str),
            "session initialized"
        );
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }

    async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.write().await.remove(id)?;
        session.close();
        tracing::info!(
            session_id = %id,
            age_secs = (Utc::now() - session.created_at).num_seconds(),
            "session closed"
        );
        Some(session)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close and drop every session idle for longer than `max_idle`.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Utc::now();
        let stale: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.idle_for(now) > max_idle)
            .map(|s| s.id.clone())
            .collect();

        for id in &stale {
            tracing::debug!(session_id = %id, "evicting idle session");
            self.remove(id).await;
        }
        stale.len()
    }

    async fn close_all(&self) {
        for (_, session) in self.sessions.write().await.drain() {
            session.close();
        }
    }
}

// =============================================================================
// HTTP State & Router
// =============================================================================

#[derive(Clone)]
pub struct HttpState {
    server: SmartHomeServer,
    sessions: Arc<SessionStore>,
}

impl HttpState {
    pub fn new(server: SmartHomeServer) -> Self {
        Self {
            server,
            sessions: Arc::new(SessionStore::new()),
        }
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route(
            "/mcp",
            post(handle_post).get(handle_get).delete(handle_delete),
        )
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the HTTP transport until `shutdown` is cancelled.
pub async fn serve(
    state: HttpState,
    addr: SocketAddr,
    idle_timeout: Option<Duration>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if let Some(max_idle) = idle_timeout {
        let sessions = state.sessions.clone();
        let token = shutdown.clone();
        let period = (max_idle / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = sessions.evict_idle(max_idle).await;
                        if evicted > 0 {
                            tracing::info!(evicted, "evicted idle sessions");
                        }
                    }
                }
            }
        });
    }

    let sessions = state.sessions.clone();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HA MCP server listening on http://{}/mcp", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            sessions.close_all().await;
        })
        .await?;
    Ok(())
}

fn rpc_error(status: StatusCode, code: i32, message: &str) -> Response {
    (
        status,
        Json(json!({
            "jsonrpc": "2.0",
            "error": { "code": code, "message": message },
            "id": null,
        })),
    )
        .into_response()
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

fn is_initialize_request(body: &Value) -> bool {
    body.get("method").and_then(Value::as_str) == Some("initialize") && body.get("id").is_some()
}

// =============================================================================
// Handlers
// =============================================================================

async fn handle_post(State(state): State<HttpState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(id) = session_id(&headers) {
        let Some(session) = state.sessions.get(id).await else {
            tracing::debug!(session_id = id, "request for unknown session");
            return rpc_error(
                StatusCode::NOT_FOUND,
                SESSION_NOT_FOUND,
                "Session not found. Re-initialize.",
            );
        };
        session.touch();

        let body = match serde_json::from_slice::<Value>(&body) {
            Ok(body) => body,
            Err(e) => return rpc_error(StatusCode::BAD_REQUEST, PARSE_ERROR, &format!("Parse error: {e}")),
        };
        return respond(&state.server, &session, body, false).await;
    }

    let body = match serde_json::from_slice::<Value>(&body) {
        Ok(body) => body,
        Err(e) => return rpc_error(StatusCode::BAD_REQUEST, PARSE_ERROR, &format!("Parse error: {e}")),
    };

    if !is_initialize_request(&body) {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            BAD_REQUEST,
            "Bad Request: no valid session or initialize request",
        );
    }

    let session = Arc::new(Session::new());
    let mut response = respond(&state.server, &session, body, true).await;
    if response.status().is_success() {
        if let Ok(value) = HeaderValue::from_str(&session.id) {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
        state.sessions.insert(session).await;
    }
    response
}

async fn handle_get(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let Some(session) = live_session(&state, &headers).await else {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            BAD_REQUEST,
            "Bad Request: missing or invalid session",
        );
    };
    session.touch();
    tracing::debug!(session_id = %session.id, "opening event stream");

    Sse::new(event_stream(&session))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

async fn handle_delete(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let removed = match session_id(&headers) {
        Some(id) => state.sessions.remove(id).await,
        None => None,
    };
    match removed {
        Some(_) => StatusCode::OK.into_response(),
        None => rpc_error(
            StatusCode::BAD_REQUEST,
            BAD_REQUEST,
            "Bad Request: missing or invalid session",
        ),
    }
}

async fn health(State(state): State<HttpState>) -> Json<Value> {
    Json(json!({ "status": "ok", "sessions": state.sessions.len().await }))
}

async fn live_session(state: &HttpState, headers: &HeaderMap) -> Option<Arc<Session>> {
    state.sessions.get(session_id(headers)?).await
}

fn event_stream(session: &Session) -> impl Stream<Item = Result<Event, Infallible>> + use<> {
    BroadcastStream::new(session.events.subscribe())
        .filter_map(|message| async move {
            match message {
                Ok(value) => Some(Ok(Event::default().event("message").data(value.to_string()))),
                Err(lagged) => {
                    tracing::warn!(%lagged, "event stream lagged");
                    None
                }
            }
        })
        .take_until(session.closed.clone().cancelled_owned())
}

// =============================================================================
// JSON-RPC Dispatch
// =============================================================================

#[derive(Debug, Deserialize)]
struct RpcMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

/// Handle a single message or a batch and build the HTTP response.
async fn respond(server: &SmartHomeServer, session: &Session, body: Value, initializing: bool) -> Response {
    let (messages, batch) = match body {
        Value::Array(items) => (items, true),
        other => (vec![other], false),
    };
    if messages.is_empty() {
        return rpc_error(StatusCode::BAD_REQUEST, INVALID_REQUEST, "Invalid Request: empty batch");
    }

    let mut replies = Vec::new();
    for message in messages {
        if let Some(reply) = handle_message(server, session, message, initializing).await {
            replies.push(reply);
        }
    }

    match replies.len() {
        0 => StatusCode::ACCEPTED.into_response(),
        _ if batch => Json(Value::Array(replies)).into_response(),
        _ => Json(replies.swap_remove(0)).into_response(),
    }
}

async fn handle_message(
    server: &SmartHomeServer,
    session: &Session,
    message: Value,
    initializing: bool,
) -> Option<Value> {
    let message: RpcMessage = match serde_json::from_value(message) {
        Ok(message) => message,
        Err(e) => return Some(error_reply(Value::Null, INVALID_REQUEST, &format!("Invalid Request: {e}"))),
    };

    // Responses to server-initiated requests carry no method.
    let method = message.method?;
    let Some(id) = message.id else {
        tracing::debug!(session_id = %session.id, %method, "notification");
        return None;
    };

    let result = match method.as_str() {
        "initialize" if initializing => Ok(initialize_result(server, session, message.params)),
        "initialize" => Err(McpError::new(
            ErrorCode(INVALID_REQUEST),
            "Session already initialized",
            None,
        )),
        "ping" => Ok(json!({})),
        "logging/setLevel" => set_log_level(session, message.params),
        "tools/list" => Ok(json!({ "tools": server.registry().tools() })),
        "tools/call" => call_tool(server, session, message.params).await,
        other => Err(McpError::new(
            ErrorCode(METHOD_NOT_FOUND),
            format!("Method not found: {other}"),
            None,
        )),
    };

    Some(match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(error) => {
            let mut reply = error_reply(id, error.code.0, &error.message);
            if let Some(data) = error.data {
                reply["error"]["data"] = data;
            }
            reply
        }
    })
}

fn initialize_result(server: &SmartHomeServer, session: &Session, params: Option<Value>) -> Value {
    let mut info = json!(server.get_info());
    let requested = params
        .as_ref()
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v));
    if let Some(version) = requested {
        info["protocolVersion"] = json!(version);
    }
    if let Some(version) = info["protocolVersion"].as_str() {
        let _ = session.protocol_version.set(version.to_string());
    }
    info
}

fn set_log_level(session: &Session, params: Option<Value>) -> Result<Value, McpError> {
    let request: SetLevelRequestParam = serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| McpError::new(ErrorCode(INVALID_PARAMS), format!("Invalid params: {e}"), None))?;
    tracing::debug!(session_id = %session.id, level = ?request.level, "log level set");
    session.set_log_level(&request.level);
    Ok(json!({}))
}

/// Text of the first content item of a failed tool result.
fn error_text(result: &CallToolResult) -> Option<String> {
    if result.is_error != Some(true) {
        return None;
    }
    match result.content.first().map(|c| &c.raw) {
        Some(RawContent::Text(text)) => Some(text.text.clone()),
        _ => Some("tool returned an error".to_string()),
    }
}

async fn call_tool(
    server: &SmartHomeServer,
    session: &Session,
    params: Option<Value>,
) -> Result<Value, McpError> {
    let request: CallToolRequestParam = params
        .ok_or_else(|| McpError::new(ErrorCode(INVALID_PARAMS), "Missing params", None))
        .and_then(|p| {
            serde_json::from_value(p).map_err(|e| {
                McpError::new(ErrorCode(INVALID_PARAMS), format!("Invalid params: {e}"), None)
            })
        })?;

    let result = server.registry().call(&request.name, request.arguments).await;
    let failure = match &result {
        Ok(result) => error_text(result),
        Err(error) => Some(error.message.to_string()),
    };
    if let Some(failure) = failure {
        session.log(
            LoggingLevel::Warning,
            json!(format!("{}: {}", request.name, failure)),
        );
    }

    serde_json::to_value(result?).map_err(|e| McpError::internal_error(e.to_string(), None))
}

fn error_reply(id: Value, code: i32, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}
