//! Dashboard HTTP server.
//!
//! JSON API over the runtime plus a Server-Sent-Events bridge off the
//! event bus. When a token is configured, non-loopback clients must send
//! `x-nxclaw-token` (or `?token=`); loopback is always allowed.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::channels::{ChannelError, IncomingRequest};
use crate::events::BusEvent;
use crate::memory::{SearchMode, SearchOptions};
use crate::runtime::autonomous::AutonomousLoop;
use crate::runtime::Runtime;

#[derive(Clone)]
struct AppState {
    runtime: Arc<Runtime>,
    autonomous: Arc<AutonomousLoop>,
    token: Option<String>,
    events: broadcast::Sender<BusEvent>,
}

/// Decide whether a request may proceed. Loopback always may; otherwise a
/// configured token must match the header or query value.
fn authorize(
    addr: &SocketAddr,
    configured: Option<&str>,
    header: Option<&str>,
    query: Option<&str>,
) -> bool {
    if addr.ip().is_loopback() {
        return true;
    }
    match configured {
        None => true,
        Some(token) => header == Some(token) || query == Some(token),
    }
}

fn check_auth(
    state: &AppState,
    addr: &SocketAddr,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<(), Response> {
    let header = headers.get("x-nxclaw-token").and_then(|v| v.to_str().ok());
    if authorize(
        addr,
        state.token.as_deref(),
        header,
        query.get("token").map(String::as_str),
    ) {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "invalid or missing token"))
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "ok": false, "error": message })),
    )
        .into_response()
}

fn bad_request(message: impl AsRef<str>) -> Response {
    error_response(StatusCode::BAD_REQUEST, message.as_ref())
}

fn internal_error(message: impl AsRef<str>) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message.as_ref())
}

/// Running dashboard server with graceful shutdown.
pub struct DashboardServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    listener_id: u64,
    runtime: Arc<Runtime>,
}

impl DashboardServer {
    /// Bind and start serving. Bridges the event bus into a broadcast
    /// channel for SSE subscribers.
    pub async fn start(
        runtime: Arc<Runtime>,
        autonomous: Arc<AutonomousLoop>,
        host: &str,
        port: u16,
        token: Option<String>,
    ) -> Result<Self, ChannelError> {
        let (events, _) = broadcast::channel(256);
        let bridge = events.clone();
        let listener_id = runtime.bus.on(move |event| {
            let _ = bridge.send(event.clone());
        });

        let state = AppState {
            runtime: Arc::clone(&runtime),
            autonomous,
            token,
            events,
        };

        let app = Router::new()
            .route("/", get(index))
            .route("/api/state", get(api_state))
            .route("/api/settings", get(get_settings).post(post_settings))
            .route("/api/sessions", get(list_sessions).post(create_session))
            .route("/api/sessions/archive", post(archive_session))
            .route("/api/memory/stats", get(memory_stats))
            .route("/api/memory/recent", get(memory_recent))
            .route("/api/memory/search", get(memory_search))
            .route("/api/memory/note", post(memory_note))
            .route("/api/memory/compact", post(memory_compact))
            .route("/api/memory/sync", post(memory_sync))
            .route("/api/memory/soul", get(get_soul).post(post_soul))
            .route("/api/events/recent", get(events_recent))
            .route("/api/events/stream", get(events_stream))
            .route("/api/prompt", post(api_prompt))
            .with_state(state);

        let bind = format!("{host}:{port}");
        let listener = tokio::net::TcpListener::bind(&bind).await.map_err(|e| {
            ChannelError::StartupFailed {
                name: "dashboard".to_string(),
                reason: format!("bind {bind}: {e}"),
            }
        })?;
        let addr = listener.local_addr().map_err(|e| ChannelError::StartupFailed {
            name: "dashboard".to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!("dashboard listening on http://{addr}");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!("dashboard server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            listener_id,
            runtime,
        })
    }

    pub async fn shutdown(&mut self) {
        self.runtime.bus.off(self.listener_id);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ==================== Handlers ====================

async fn index() -> Html<&'static str> {
    Html(
        "<!doctype html><title>nxclaw</title><h1>nxclaw runtime</h1>\
         <p>The JSON API lives under <code>/api/</code>; state at \
         <code>/api/state</code>, live events at <code>/api/events/stream</code>.</p>",
    )
}

async fn api_state(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    let mut snapshot = state.runtime.state_snapshot().await;
    snapshot["autonomous"] =
        serde_json::to_value(state.autonomous.state()).unwrap_or(serde_json::Value::Null);
    Json(snapshot).into_response()
}

async fn get_settings(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    let config = state.runtime.config();
    Json(serde_json::json!({
        "default_provider": config.default_provider,
        "default_model": config.default_model,
        "runtime": config.runtime,
        "autonomous": config.autonomous,
        "memory": config.memory,
        "chrome": config.chrome,
    }))
    .into_response()
}

async fn post_settings(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(patch): Json<serde_json::Value>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    let Some(patch) = patch.as_object() else {
        return bad_request("settings patch must be an object");
    };
    for scope in patch.keys() {
        if !crate::config::is_patchable_scope(scope) {
            return bad_request(format!("unknown settings scope '{scope}'"));
        }
    }

    let patch = patch.clone();
    let result = state.runtime.update_config(|config| {
        if let Some(value) = patch.get("default_provider").and_then(|v| v.as_str()) {
            config.default_provider = value.to_string();
        }
        if let Some(value) = patch.get("default_model") {
            config.default_model = value.as_str().map(String::from);
        }
        // Each scope deserializes against its own struct; partial objects
        // fall back to serde defaults for omitted keys.
        if let Some(value) = patch.get("runtime") {
            if let Ok(parsed) = serde_json::from_value(value.clone()) {
                config.runtime = parsed;
            }
        }
        if let Some(value) = patch.get("autonomous") {
            if let Ok(parsed) = serde_json::from_value(value.clone()) {
                config.autonomous = parsed;
            }
        }
        if let Some(value) = patch.get("memory") {
            if let Ok(parsed) = serde_json::from_value(value.clone()) {
                config.memory = parsed;
            }
        }
        if let Some(value) = patch.get("chrome") {
            if let Ok(parsed) = serde_json::from_value(value.clone()) {
                config.chrome = parsed;
            }
        }
    });

    match result {
        Ok(config) => {
            // Live-apply to the autonomous loop.
            state.autonomous.reconfigure(&config.autonomous);
            Json(serde_json::json!({ "ok": true })).into_response()
        }
        Err(e) => internal_error(e.to_string()),
    }
}

async fn list_sessions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    Json(serde_json::json!({
        "sessions": state.runtime.list_conversation_sessions().await
    }))
    .into_response()
}

async fn create_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    let source = body.get("source").and_then(|v| v.as_str()).unwrap_or("dashboard");
    let channel_id = body.get("channel_id").and_then(|v| v.as_str()).unwrap_or("web");
    let session_id = body.get("session_id").and_then(|v| v.as_str());
    match state
        .runtime
        .create_conversation_session(source, channel_id, session_id)
        .await
    {
        Ok(info) => Json(serde_json::json!({ "ok": true, "session": info })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn archive_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    let Some(lane_key) = body.get("lane_key").and_then(|v| v.as_str()) else {
        return bad_request("missing 'lane_key'");
    };
    match state.runtime.archive_conversation_session(lane_key).await {
        Ok(archived) => Json(serde_json::json!({ "ok": true, "archived": archived })).into_response(),
        Err(e) => bad_request(e),
    }
}

async fn memory_stats(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    Json(state.runtime.memory.stats().await).into_response()
}

async fn memory_recent(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    let limit = query
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(20)
        .clamp(1, 200);
    Json(serde_json::json!({ "entries": state.runtime.memory.recent(limit).await }))
        .into_response()
}

async fn memory_search(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    let Some(q) = query.get("q").filter(|q| !q.trim().is_empty()) else {
        return bad_request("missing 'q'");
    };
    let limit = query
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(10);
    let options = SearchOptions {
        session_key: query.get("sessionKey").cloned(),
        mode: SearchMode::parse(query.get("mode").map(String::as_str).unwrap_or("global")),
    };
    match state.runtime.memory.search(q, limit, options).await {
        Ok(hits) => Json(serde_json::json!({ "hits": hits })).into_response(),
        Err(e) => internal_error(e.to_string()),
    }
}

async fn memory_note(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    let Some(title) = body.get("title").and_then(|v| v.as_str()) else {
        return bad_request("missing 'title'");
    };
    let content = body.get("content").and_then(|v| v.as_str()).unwrap_or("");
    let tags: Vec<String> = body
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect())
        .unwrap_or_default();
    match state
        .runtime
        .memory
        .add_note(title, content, "dashboard", tags)
        .await
    {
        Ok(note) => Json(serde_json::json!({ "ok": true, "id": note.id })).into_response(),
        Err(e) => bad_request(e.to_string()),
    }
}

async fn memory_compact(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    match state.runtime.memory.compact_now("dashboard").await {
        Ok(note) => Json(serde_json::json!({
            "ok": true,
            "compacted": note.and_then(|n| n.compacted_count).unwrap_or(0),
        }))
        .into_response(),
        Err(e) => internal_error(e.to_string()),
    }
}

async fn memory_sync(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    state.runtime.memory.mark_index_dirty();
    match state.runtime.memory.sync_knowledge_index().await {
        Ok(report) => Json(serde_json::json!({ "ok": true, "report": report })).into_response(),
        Err(e) => internal_error(e.to_string()),
    }
}

async fn get_soul(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    match state.runtime.memory.read_soul() {
        Ok(content) => Json(serde_json::json!({ "content": content })).into_response(),
        Err(e) => internal_error(e.to_string()),
    }
}

async fn post_soul(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    let Some(content) = body.get("content").and_then(|v| v.as_str()) else {
        return bad_request("missing 'content'");
    };
    let replace = body.get("mode").and_then(|v| v.as_str()) == Some("replace");
    match state.runtime.memory.write_soul(content, replace) {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => internal_error(e.to_string()),
    }
}

async fn events_recent(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    let limit = query
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(50)
        .clamp(1, 500);
    Json(serde_json::json!({ "events": state.runtime.bus.recent(limit) })).into_response()
}

async fn events_stream(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    let rx = state.events.subscribe();
    let stream: Box<dyn Stream<Item = Result<Event, Infallible>> + Send + Unpin> = Box::new(
        BroadcastStream::new(rx).filter_map(|event| {
            let event = event.ok()?;
            let data = serde_json::to_string(&event).ok()?;
            Some(Ok(Event::default().event(event.kind.clone()).data(data)))
        }),
    );
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text(""))
        .into_response()
}

async fn api_prompt(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if let Err(denied) = check_auth(&state, &addr, &headers, &query) {
        return denied;
    }
    let Some(text) = body.get("text").and_then(|v| v.as_str()).filter(|t| !t.trim().is_empty())
    else {
        return bad_request("missing 'text'");
    };
    let request = IncomingRequest {
        source: body
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("dashboard")
            .to_string(),
        channel_id: body
            .get("channel_id")
            .and_then(|v| v.as_str())
            .unwrap_or("web")
            .to_string(),
        user_id: body
            .get("user_id")
            .and_then(|v| v.as_str())
            .unwrap_or("dashboard")
            .to_string(),
        session_id: body.get("session_id").and_then(|v| v.as_str()).map(String::from),
    };
    let reply = state.runtime.handle_incoming(&request, text).await;
    Json(serde_json::json!({ "ok": true, "reply": reply })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::ScriptedProvider;
    use tempfile::tempdir;

    #[test]
    fn test_authorize_rules() {
        let loopback: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let remote: SocketAddr = "10.0.0.7:9".parse().unwrap();

        // Loopback never needs a token.
        assert!(authorize(&loopback, Some("secret"), None, None));
        // Remote without a configured token is open.
        assert!(authorize(&remote, None, None, None));
        // Remote with a token requires a match (header or query).
        assert!(!authorize(&remote, Some("secret"), None, None));
        assert!(!authorize(&remote, Some("secret"), Some("wrong"), None));
        assert!(authorize(&remote, Some("secret"), Some("secret"), None));
        assert!(authorize(&remote, Some("secret"), None, Some("secret")));
    }

    async fn start_test_server(dir: &std::path::Path) -> (DashboardServer, String, Arc<Runtime>) {
        let mut config = Config::load(dir.to_path_buf());
        config.memory.vector.provider = "local".to_string();
        config.memory.vector.dims = 32;
        let runtime =
            Runtime::with_provider(config, Arc::new(ScriptedProvider::always("dash reply")))
                .unwrap();
        runtime.start().await;
        let autonomous = AutonomousLoop::new(Arc::clone(&runtime));
        let server = DashboardServer::start(Arc::clone(&runtime), autonomous, "127.0.0.1", 0, None)
            .await
            .unwrap();
        let base = format!("http://{}", server.addr);
        (server, base, runtime)
    }

    #[tokio::test]
    async fn test_state_and_prompt_endpoints() {
        let dir = tempdir().unwrap();
        let (mut server, base, runtime) = start_test_server(dir.path()).await;
        let client = reqwest::Client::new();

        let state: serde_json::Value = client
            .get(format!("{base}/api/state"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(state["provider"], "scripted");
        assert!(state["autonomous"]["enabled"].is_boolean());

        let reply: serde_json::Value = client
            .post(format!("{base}/api/prompt"))
            .json(&serde_json::json!({ "text": "hello over http" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(reply["reply"], "dash reply");

        server.shutdown().await;
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_validation_errors_are_400() {
        let dir = tempdir().unwrap();
        let (mut server, base, runtime) = start_test_server(dir.path()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/api/prompt"))
            .json(&serde_json::json!({ "text": "  " }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["ok"], false);

        let response = client
            .get(format!("{base}/api/memory/search"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        server.shutdown().await;
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_memory_endpoints_roundtrip() {
        let dir = tempdir().unwrap();
        let (mut server, base, runtime) = start_test_server(dir.path()).await;
        let client = reqwest::Client::new();

        let created: serde_json::Value = client
            .post(format!("{base}/api/memory/note"))
            .json(&serde_json::json!({ "title": "http note", "content": "stored via the dashboard" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created["ok"], true);

        let found: serde_json::Value = client
            .get(format!("{base}/api/memory/search?q=http%20note"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!found["hits"].as_array().unwrap().is_empty());

        // SOUL replace then read back.
        client
            .post(format!("{base}/api/memory/soul"))
            .json(&serde_json::json!({ "content": "the dashboard soul", "mode": "replace" }))
            .send()
            .await
            .unwrap();
        let soul: serde_json::Value = client
            .get(format!("{base}/api/memory/soul"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(soul["content"], "the dashboard soul\n");

        server.shutdown().await;
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_settings_patch_live_applies() {
        let dir = tempdir().unwrap();
        let (mut server, base, runtime) = start_test_server(dir.path()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/api/settings"))
            .json(&serde_json::json!({ "autonomous": { "enabled": true, "interval_ms": 60000 } }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(runtime.config().autonomous.enabled);

        // Unknown scope rejected.
        let response = client
            .post(format!("{base}/api/settings"))
            .json(&serde_json::json!({ "hacks": {} }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        server.shutdown().await;
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_recent_endpoint() {
        let dir = tempdir().unwrap();
        let (mut server, base, runtime) = start_test_server(dir.path()).await;

        runtime.bus.emit("custom_probe", serde_json::json!({ "n": 1 }));

        let events: serde_json::Value = reqwest::Client::new()
            .get(format!("{base}/api/events/recent?limit=10"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let list = events["events"].as_array().unwrap();
        assert!(list.iter().any(|e| e["type"] == "custom_probe"));
        // Wire format: seq, ts, type, payload.
        let probe = list.iter().find(|e| e["type"] == "custom_probe").unwrap();
        assert!(probe["seq"].is_number());
        assert!(probe["ts"].is_number());
        assert!(probe["payload"]["n"] == 1);

        server.shutdown().await;
        runtime.shutdown().await;
    }
}
