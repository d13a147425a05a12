//! Chrome DevTools Protocol transport: JSON commands over a WebSocket,
//! id-matched replies, and flat-mode session routing.
//!
//! One connection serves the whole browser; per-page commands carry the
//! `sessionId` obtained from `Target.attachToTarget`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

/// Default per-command timeout.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Error type for CDP transport operations.
#[derive(Debug, Error, Clone)]
pub enum CdpError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("browser endpoint discovery failed: {0}")]
    Discovery(String),

    #[error("command {method} failed: {message}")]
    Protocol { method: String, message: String },

    #[error("command {0} timed out")]
    Timeout(String),

    #[error("connection closed")]
    Closed,
}

/// A protocol event (a message without an `id`).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub session_id: Option<String>,
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: Option<u64>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default, rename = "sessionId")]
    session_id: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, CdpError>>>>>;

/// Live connection to a browser's DevTools endpoint.
pub struct CdpConnection {
    next_id: AtomicU64,
    outbound: mpsc::Sender<String>,
    pending: Pending,
    events: broadcast::Sender<CdpEvent>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl CdpConnection {
    /// Connect to a `ws://` debugger URL within `timeout`.
    pub async fn connect(ws_url: &str, timeout: Duration) -> Result<Self, CdpError> {
        let connect = tokio_tungstenite::connect_async(ws_url);
        let (stream, _) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| CdpError::Connect(format!("timed out connecting to {ws_url}")))?
            .map_err(|e| CdpError::Connect(e.to_string()))?;

        let (mut sink, mut source) = stream.split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(256);
        let (outbound, mut outbound_rx) = mpsc::channel::<String>(64);

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let wire: WireMessage = match serde_json::from_str(&text) {
                    Ok(wire) => wire,
                    Err(e) => {
                        tracing::debug!("unparseable devtools message: {}", e);
                        continue;
                    }
                };
                match wire.id {
                    Some(id) => {
                        let waiter = reader_pending.lock().expect("cdp pending lock").remove(&id);
                        if let Some(tx) = waiter {
                            let outcome = match wire.error {
                                Some(err) => Err(CdpError::Protocol {
                                    method: String::new(),
                                    message: err.message,
                                }),
                                None => Ok(wire.result.unwrap_or(serde_json::Value::Null)),
                            };
                            let _ = tx.send(outcome);
                        }
                    }
                    None => {
                        if let Some(method) = wire.method {
                            let _ = reader_events.send(CdpEvent {
                                method,
                                session_id: wire.session_id,
                                params: wire.params.unwrap_or(serde_json::Value::Null),
                            });
                        }
                    }
                }
            }
            // Connection gone: fail every in-flight command.
            let mut pending = reader_pending.lock().expect("cdp pending lock");
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(CdpError::Closed));
            }
        });

        Ok(Self {
            next_id: AtomicU64::new(1),
            outbound,
            pending,
            events,
            reader,
            writer,
        })
    }

    /// Browser-level command (no session routing).
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CdpError> {
        self.call_inner(None, method, params).await
    }

    /// Page command routed to an attached target session.
    pub async fn call_session(
        &self,
        session_id: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CdpError> {
        self.call_inner(Some(session_id), method, params).await
    }

    async fn call_inner(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CdpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut frame = serde_json::json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            frame["sessionId"] = serde_json::Value::String(session_id.to_string());
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("cdp pending lock")
            .insert(id, tx);

        let text = frame.to_string();
        if self.outbound.send(text).await.is_err() {
            self.pending.lock().expect("cdp pending lock").remove(&id);
            return Err(CdpError::Closed);
        }

        let outcome = tokio::time::timeout(COMMAND_TIMEOUT, rx).await;
        match outcome {
            Ok(Ok(result)) => result.map_err(|e| match e {
                CdpError::Protocol { message, .. } => CdpError::Protocol {
                    method: method.to_string(),
                    message,
                },
                other => other,
            }),
            Ok(Err(_)) => Err(CdpError::Closed),
            Err(_) => {
                self.pending.lock().expect("cdp pending lock").remove(&id);
                Err(CdpError::Timeout(method.to_string()))
            }
        }
    }

    /// Subscribe to protocol events.
    pub fn events(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// Whether the reader is still alive.
    pub fn is_alive(&self) -> bool {
        !self.reader.is_finished()
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Resolve a browser's WebSocket debugger URL from its HTTP endpoint
/// (`/json/version`).
pub async fn discover_ws_url(cdp_url: &str, timeout: Duration) -> Result<String, CdpError> {
    let url = format!("{}/json/version", cdp_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CdpError::Discovery(e.to_string()))?;
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| CdpError::Discovery(format!("{url}: {e}")))?;
    if !response.status().is_success() {
        return Err(CdpError::Discovery(format!(
            "{url} returned {}",
            response.status()
        )));
    }
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| CdpError::Discovery(e.to_string()))?;
    body.get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| CdpError::Discovery("no webSocketDebuggerUrl in /json/version".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal in-process DevTools stand-in: answers every command with
    /// `{"echo": <method>}` and pushes one event after the first command.
    async fn spawn_fake_devtools() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut sent_event = false;
            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else { continue };
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                let id = frame["id"].as_u64().unwrap();
                let method = frame["method"].as_str().unwrap_or("");

                if method == "Test.fail" {
                    let reply = serde_json::json!({
                        "id": id,
                        "error": { "code": -32000, "message": "deliberate failure" }
                    });
                    ws.send(Message::Text(reply.to_string())).await.unwrap();
                    continue;
                }
                if method == "Test.never" {
                    continue; // let the caller time out
                }

                let reply = serde_json::json!({
                    "id": id,
                    "result": { "echo": method, "sessionId": frame.get("sessionId") }
                });
                ws.send(Message::Text(reply.to_string())).await.unwrap();

                if !sent_event {
                    sent_event = true;
                    let event = serde_json::json!({
                        "method": "Page.loadEventFired",
                        "params": { "timestamp": 1.0 }
                    });
                    ws.send(Message::Text(event.to_string())).await.unwrap();
                }
            }
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let url = spawn_fake_devtools().await;
        let conn = CdpConnection::connect(&url, Duration::from_secs(2))
            .await
            .unwrap();

        let result = conn
            .call("Browser.getVersion", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result["echo"], "Browser.getVersion");
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn test_session_id_is_routed() {
        let url = spawn_fake_devtools().await;
        let conn = CdpConnection::connect(&url, Duration::from_secs(2))
            .await
            .unwrap();

        let result = conn
            .call_session("sess-9", "Runtime.evaluate", serde_json::json!({"expression": "1"}))
            .await
            .unwrap();
        assert_eq!(result["sessionId"], "sess-9");
    }

    #[tokio::test]
    async fn test_protocol_error_is_surfaced() {
        let url = spawn_fake_devtools().await;
        let conn = CdpConnection::connect(&url, Duration::from_secs(2))
            .await
            .unwrap();

        let err = conn.call("Test.fail", serde_json::json!({})).await.unwrap_err();
        match err {
            CdpError::Protocol { method, message } => {
                assert_eq!(method, "Test.fail");
                assert!(message.contains("deliberate"));
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let url = spawn_fake_devtools().await;
        let conn = CdpConnection::connect(&url, Duration::from_secs(2))
            .await
            .unwrap();
        let mut events = conn.events();

        conn.call("Page.enable", serde_json::json!({})).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.method, "Page.loadEventFired");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let err = CdpConnection::connect("ws://127.0.0.1:1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CdpError::Connect(_)));
    }
}
