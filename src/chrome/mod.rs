//! Multi-session browser pool over the DevTools protocol.
//!
//! One browser process (attached or launched) serves every session. Each
//! session owns a page target and a flat-mode protocol session; ownership
//! flags decide what gets closed when the session ends.

pub mod cdp;
pub mod snapshot;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ChromeConfig;
use cdp::{CdpConnection, CdpError};
use snapshot::{PageSnapshot, MAX_SNAPSHOT_ELEMENTS};

/// Navigation readiness ceiling.
const NAVIGATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for browser operations.
#[derive(Debug, Error)]
pub enum ChromeError {
    #[error("browser unavailable: {0}")]
    Unavailable(String),

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("browser session not found: {0}")]
    SessionNotFound(String),

    #[error("Ref {0} not found. Run nx_chrome_session_snapshot again.")]
    RefNotFound(u32),

    #[error("element {0} is not visible")]
    RefNotVisible(u32),

    #[error("evaluate failed: {0}")]
    Evaluate(String),

    #[error("screenshot failed: {0}")]
    Screenshot(String),

    #[error(transparent)]
    Transport(#[from] CdpError),
}

/// How the controller reached the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserMode {
    Launch,
    Cdp,
}

/// One page-bound session.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserSession {
    pub id: String,
    pub target_id: String,
    #[serde(skip)]
    pub cdp_session: String,
    pub context_id: Option<String>,
    pub owns_context: bool,
    pub owns_page: bool,
    pub attached: bool,
    pub reused_existing_page: bool,
    pub mode: BrowserMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: String,
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

struct ControllerInner {
    connection: Option<CdpConnection>,
    browser: Option<tokio::process::Child>,
    active_mode: Option<BrowserMode>,
    sessions: HashMap<String, BrowserSession>,
    claimed_targets: HashSet<String>,
}

/// Browser pool controller. All open/close paths are serialized.
pub struct ChromeController {
    config: ChromeConfig,
    shots_dir: PathBuf,
    profile_dir: PathBuf,
    inner: Mutex<ControllerInner>,
}

fn is_blank_url(url: &str) -> bool {
    matches!(
        url,
        "" | "about:blank" | "chrome://newtab/" | "chrome://new-tab-page/" | "edge://newtab/"
    )
}

/// Pick a reusable page target: prefer unclaimed pages with a real URL,
/// fall back to any unclaimed page.
fn pick_reusable_target(
    targets: &[serde_json::Value],
    claimed: &HashSet<String>,
) -> Option<(String, String)> {
    let pages: Vec<(&str, &str)> = targets
        .iter()
        .filter(|t| t["type"].as_str() == Some("page"))
        .filter_map(|t| {
            let id = t["targetId"].as_str()?;
            let url = t["url"].as_str().unwrap_or("");
            (!claimed.contains(id)).then_some((id, url))
        })
        .collect();

    pages
        .iter()
        .find(|(_, url)| !is_blank_url(url))
        .or_else(|| pages.first())
        .map(|(id, url)| (id.to_string(), url.to_string()))
}

/// Least-recently-updated session, the eviction victim at capacity.
fn lru_session_id(sessions: &HashMap<String, BrowserSession>) -> Option<String> {
    sessions
        .values()
        .min_by_key(|s| s.updated_at)
        .map(|s| s.id.clone())
}

fn default_executables() -> Vec<PathBuf> {
    [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

impl ChromeController {
    pub fn new(config: ChromeConfig, shots_dir: PathBuf, profile_dir: PathBuf) -> Self {
        Self {
            config,
            shots_dir,
            profile_dir,
            inner: Mutex::new(ControllerInner {
                connection: None,
                browser: None,
                active_mode: None,
                sessions: HashMap::new(),
                claimed_targets: HashSet::new(),
            }),
        }
    }

    fn resolve_executable(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config.executable_path {
            return Some(path.clone());
        }
        default_executables().into_iter().find(|p| p.exists())
    }

    /// Attach or launch lazily. Holds the controller lock.
    async fn ensure_browser(&self, inner: &mut ControllerInner) -> Result<(), ChromeError> {
        if let Some(conn) = &inner.connection {
            if conn.is_alive() {
                return Ok(());
            }
            tracing::warn!("devtools connection lost; reconnecting");
            inner.connection = None;
            inner.active_mode = None;
        }

        let connect_timeout = Duration::from_millis(self.config.cdp_connect_timeout_ms.max(500));

        if self.config.mode == "cdp" {
            match cdp::discover_ws_url(&self.config.cdp_url, connect_timeout).await {
                Ok(ws_url) => {
                    let conn = CdpConnection::connect(&ws_url, connect_timeout).await?;
                    inner.connection = Some(conn);
                    inner.active_mode = Some(BrowserMode::Cdp);
                    tracing::info!("attached to browser at {}", self.config.cdp_url);
                    return Ok(());
                }
                Err(e) => {
                    if self.config.cdp_fallback_to_launch && self.resolve_executable().is_some() {
                        tracing::warn!("cdp attach failed ({}); falling back to launch", e);
                    } else {
                        return Err(ChromeError::Unavailable(format!(
                            "cdp attach to {} failed: {e}. Start the browser with \
                             --remote-debugging-port, fix chrome.cdp_url, or enable \
                             chrome.cdp_fallback_to_launch with an executable_path",
                            self.config.cdp_url
                        )));
                    }
                }
            }
        }

        self.launch_browser(inner).await
    }

    async fn launch_browser(&self, inner: &mut ControllerInner) -> Result<(), ChromeError> {
        let executable = self.resolve_executable().ok_or_else(|| {
            ChromeError::Unavailable(
                "no browser executable found; set chrome.executable_path or use cdp mode"
                    .to_string(),
            )
        })?;

        std::fs::create_dir_all(&self.profile_dir)
            .map_err(|e| ChromeError::Launch(format!("profile dir: {e}")))?;
        let port_file = self.profile_dir.join("DevToolsActivePort");
        let _ = std::fs::remove_file(&port_file);

        let mut command = tokio::process::Command::new(&executable);
        command
            .arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", self.profile_dir.display()))
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("about:blank")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        if self.config.headless {
            command.arg("--headless=new");
        }

        let child = command
            .spawn()
            .map_err(|e| ChromeError::Launch(format!("{}: {e}", executable.display())))?;

        // The browser writes its ephemeral port and browser-target path to
        // DevToolsActivePort once the endpoint is up.
        let ws_url = {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
            loop {
                if let Ok(text) = std::fs::read_to_string(&port_file) {
                    let mut lines = text.lines();
                    if let (Some(port), Some(path)) = (lines.next(), lines.next()) {
                        break format!("ws://127.0.0.1:{port}{path}");
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(ChromeError::Launch(
                        "browser never published DevToolsActivePort".to_string(),
                    ));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };

        let conn = CdpConnection::connect(&ws_url, Duration::from_secs(10)).await?;
        inner.browser = Some(child);
        inner.connection = Some(conn);
        inner.active_mode = Some(BrowserMode::Launch);
        tracing::info!("launched browser {} ({})", executable.display(), ws_url);
        Ok(())
    }

    // ==================== Sessions ====================

    /// Open a session, attaching to an existing page (cdp mode) or creating
    /// a fresh context + page (launch mode). Evicts the least-recently-used
    /// session at capacity.
    pub async fn open_session(&self, url: Option<&str>) -> Result<BrowserSession, ChromeError> {
        let mut inner = self.inner.lock().await;
        self.ensure_browser(&mut inner).await?;

        if inner.sessions.len() >= self.config.max_sessions.max(1) {
            if let Some(victim) = lru_session_id(&inner.sessions) {
                tracing::info!("session capacity reached; evicting {}", victim);
                self.close_session_locked(&mut inner, &victim).await;
            }
        }

        let mode = inner
            .active_mode
            .ok_or_else(|| ChromeError::Unavailable("no active browser mode".to_string()))?;
        let conn = inner
            .connection
            .as_ref()
            .ok_or_else(|| ChromeError::Unavailable("no browser connection".to_string()))?;

        let mut owns_context = false;
        let mut owns_page = false;
        let mut reused_existing_page = false;
        let mut context_id = None;

        let target_id = if mode == BrowserMode::Cdp && self.config.cdp_reuse_existing_page {
            let targets = conn.call("Target.getTargets", serde_json::json!({})).await?;
            let infos = targets["targetInfos"].as_array().cloned().unwrap_or_default();
            match pick_reusable_target(&infos, &inner.claimed_targets) {
                Some((id, _)) => {
                    reused_existing_page = true;
                    id
                }
                None => {
                    owns_page = true;
                    let created = conn
                        .call(
                            "Target.createTarget",
                            serde_json::json!({ "url": "about:blank" }),
                        )
                        .await?;
                    created["targetId"]
                        .as_str()
                        .ok_or_else(|| ChromeError::Unavailable("createTarget returned no id".to_string()))?
                        .to_string()
                }
            }
        } else {
            // Launch mode (and cdp without reuse): fresh context + page.
            let context = conn
                .call("Target.createBrowserContext", serde_json::json!({}))
                .await;
            let browser_context_id = match context {
                Ok(value) => value["browserContextId"].as_str().map(String::from),
                // Shared context still works; the session just owns the page.
                Err(e) => {
                    tracing::debug!("createBrowserContext unavailable: {}", e);
                    None
                }
            };
            owns_context = browser_context_id.is_some();
            owns_page = true;
            context_id = browser_context_id.clone();

            let mut params = serde_json::json!({ "url": "about:blank" });
            if let Some(ctx) = &browser_context_id {
                params["browserContextId"] = serde_json::Value::String(ctx.clone());
            }
            let created = conn.call("Target.createTarget", params).await?;
            created["targetId"]
                .as_str()
                .ok_or_else(|| ChromeError::Unavailable("createTarget returned no id".to_string()))?
                .to_string()
        };

        let attach = conn
            .call(
                "Target.attachToTarget",
                serde_json::json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let cdp_session = attach["sessionId"]
            .as_str()
            .ok_or_else(|| ChromeError::Unavailable("attach returned no sessionId".to_string()))?
            .to_string();

        // Domain enables degrade gracefully; navigation falls back to
        // readiness polling either way.
        for domain in ["Page.enable", "Runtime.enable"] {
            if let Err(e) = conn.call_session(&cdp_session, domain, serde_json::json!({})).await {
                tracing::debug!("{} failed on new session: {}", domain, e);
            }
        }

        let now = Utc::now();
        let session = BrowserSession {
            id: Uuid::new_v4().to_string(),
            target_id: target_id.clone(),
            cdp_session,
            context_id,
            owns_context,
            owns_page,
            attached: true,
            reused_existing_page,
            mode,
            created_at: now,
            updated_at: now,
            title: String::new(),
            last_snapshot_at: None,
        };
        inner.claimed_targets.insert(target_id);
        inner.sessions.insert(session.id.clone(), session.clone());
        drop(inner);

        if let Some(url) = url {
            if !is_blank_url(url) {
                self.navigate(&session.id, url).await?;
            }
        }
        Ok(session)
    }

    async fn session_handle(&self, session_id: &str) -> Result<(String, String), ChromeError> {
        let inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| ChromeError::SessionNotFound(session_id.to_string()))?;
        Ok((session.cdp_session.clone(), session.target_id.clone()))
    }

    async fn call_page(
        &self,
        session_id: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ChromeError> {
        let (cdp_session, _) = self.session_handle(session_id).await?;
        let inner = self.inner.lock().await;
        let conn = inner
            .connection
            .as_ref()
            .ok_or_else(|| ChromeError::Unavailable("no browser connection".to_string()))?;
        let result = conn.call_session(&cdp_session, method, params).await?;
        Ok(result)
    }

    fn touch(&self, inner: &mut ControllerInner, session_id: &str) {
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.updated_at = Utc::now();
        }
    }

    /// Navigate and wait for DOM readiness (30 s ceiling; a slow page logs
    /// and proceeds).
    pub async fn navigate(&self, session_id: &str, url: &str) -> Result<(), ChromeError> {
        let result = self
            .call_page(session_id, "Page.navigate", serde_json::json!({ "url": url }))
            .await?;
        if let Some(error_text) = result["errorText"].as_str() {
            if !error_text.is_empty() {
                return Err(ChromeError::Evaluate(format!("navigation failed: {error_text}")));
            }
        }

        let deadline = tokio::time::Instant::now() + NAVIGATE_TIMEOUT;
        loop {
            let ready = self
                .evaluate_raw(session_id, "document.readyState")
                .await
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default();
            if ready == "interactive" || ready == "complete" {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("navigation to {} still loading after 30s", url);
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let mut inner = self.inner.lock().await;
        self.touch(&mut inner, session_id);
        Ok(())
    }

    async fn evaluate_raw(
        &self,
        session_id: &str,
        expression: &str,
    ) -> Result<serde_json::Value, ChromeError> {
        let result = self
            .call_page(
                session_id,
                "Runtime.evaluate",
                serde_json::json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception["exception"]["description"]
                .as_str()
                .or_else(|| exception["text"].as_str())
                .unwrap_or("page exception");
            return Err(ChromeError::Evaluate(text.to_string()));
        }
        Ok(result["result"]["value"].clone())
    }

    /// Evaluate a user expression; non-string results are stringified.
    pub async fn evaluate(&self, session_id: &str, expression: &str) -> Result<String, ChromeError> {
        let value = self.evaluate_raw(session_id, expression).await?;
        let mut inner = self.inner.lock().await;
        self.touch(&mut inner, session_id);
        Ok(match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    /// Run the snapshot routine: tag interactables with `data-nx-ref` and
    /// return their descriptors.
    pub async fn snapshot(
        &self,
        session_id: &str,
        include_invisible: bool,
        max_elements: usize,
    ) -> Result<PageSnapshot, ChromeError> {
        let expression =
            snapshot::snapshot_expression(include_invisible, max_elements.min(MAX_SNAPSHOT_ELEMENTS));
        let value = self.evaluate_raw(session_id, &expression).await?;
        let text = value
            .as_str()
            .ok_or_else(|| ChromeError::Evaluate("snapshot returned no payload".to_string()))?;
        let parsed: PageSnapshot = serde_json::from_str(text)
            .map_err(|e| ChromeError::Evaluate(format!("snapshot parse: {e}")))?;

        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.title = parsed.title.clone();
            session.last_snapshot_at = Some(Utc::now());
            session.updated_at = Utc::now();
        }
        Ok(parsed)
    }

    /// Click the element tagged with `ref_id`.
    pub async fn click_by_ref(&self, session_id: &str, ref_id: u32) -> Result<(), ChromeError> {
        let value = self
            .evaluate_raw(session_id, &snapshot::click_expression(ref_id))
            .await?;
        match value.as_str() {
            Some("ok") => {
                let mut inner = self.inner.lock().await;
                self.touch(&mut inner, session_id);
                Ok(())
            }
            Some("notfound") => Err(ChromeError::RefNotFound(ref_id)),
            Some("invisible") => Err(ChromeError::RefNotVisible(ref_id)),
            other => Err(ChromeError::Evaluate(format!("unexpected click result: {other:?}"))),
        }
    }

    /// Type into the element tagged with `ref_id`: programmatic fill first,
    /// keyboard insertion as fallback, optional Enter afterwards.
    pub async fn type_by_ref(
        &self,
        session_id: &str,
        ref_id: u32,
        text: &str,
        clear: bool,
        press_enter: bool,
    ) -> Result<(), ChromeError> {
        let value = self
            .evaluate_raw(session_id, &snapshot::fill_expression(ref_id, text, clear))
            .await?;
        match value.as_str() {
            Some("ok") => {}
            Some("notfound") => return Err(ChromeError::RefNotFound(ref_id)),
            Some("unfillable") => {
                let focused = self
                    .evaluate_raw(session_id, &snapshot::focus_expression(ref_id))
                    .await?;
                if focused.as_str() == Some("notfound") {
                    return Err(ChromeError::RefNotFound(ref_id));
                }
                self.call_page(
                    session_id,
                    "Input.insertText",
                    serde_json::json!({ "text": text }),
                )
                .await?;
            }
            other => {
                return Err(ChromeError::Evaluate(format!("unexpected fill result: {other:?}")));
            }
        }

        if press_enter {
            for event_type in ["rawKeyDown", "char", "keyUp"] {
                let mut params = serde_json::json!({
                    "type": event_type,
                    "key": "Enter",
                    "code": "Enter",
                    "windowsVirtualKeyCode": 13,
                });
                if event_type == "char" {
                    params["text"] = serde_json::Value::String("\r".to_string());
                }
                self.call_page(session_id, "Input.dispatchKeyEvent", params).await?;
            }
        }

        let mut inner = self.inner.lock().await;
        self.touch(&mut inner, session_id);
        Ok(())
    }

    /// Capture a PNG screenshot into the shots directory.
    pub async fn screenshot(&self, session_id: &str) -> Result<PathBuf, ChromeError> {
        let result = self
            .call_page(
                session_id,
                "Page.captureScreenshot",
                serde_json::json!({ "format": "png" }),
            )
            .await?;
        let data = result["data"]
            .as_str()
            .ok_or_else(|| ChromeError::Screenshot("no image data returned".to_string()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| ChromeError::Screenshot(format!("bad base64: {e}")))?;

        std::fs::create_dir_all(&self.shots_dir)
            .map_err(|e| ChromeError::Screenshot(e.to_string()))?;
        let path = self
            .shots_dir
            .join(format!("shot-{}.png", Utc::now().timestamp_millis()));
        std::fs::write(&path, bytes).map_err(|e| ChromeError::Screenshot(e.to_string()))?;

        let mut inner = self.inner.lock().await;
        self.touch(&mut inner, session_id);
        Ok(path)
    }

    /// Sessions for the dashboard.
    pub async fn list_sessions(&self) -> Vec<BrowserSession> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<BrowserSession> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    /// Close one session, releasing CDP attachment, page, and context
    /// according to the ownership flags. Returns false when unknown.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.sessions.contains_key(session_id) {
            return false;
        }
        self.close_session_locked(&mut inner, session_id).await;
        true
    }

    async fn close_session_locked(&self, inner: &mut ControllerInner, session_id: &str) {
        let Some(session) = inner.sessions.remove(session_id) else {
            return;
        };
        inner.claimed_targets.remove(&session.target_id);

        let Some(conn) = inner.connection.as_ref() else {
            return;
        };
        let _ = conn
            .call(
                "Target.detachFromTarget",
                serde_json::json!({ "sessionId": session.cdp_session }),
            )
            .await;
        if session.owns_context {
            if let Some(context_id) = &session.context_id {
                let _ = conn
                    .call(
                        "Target.disposeBrowserContext",
                        serde_json::json!({ "browserContextId": context_id }),
                    )
                    .await;
                return;
            }
        }
        if session.owns_page {
            let _ = conn
                .call(
                    "Target.closeTarget",
                    serde_json::json!({ "targetId": session.target_id }),
                )
                .await;
        }
    }

    /// Close every session and release the browser itself.
    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> = inner.sessions.keys().cloned().collect();
        for id in ids {
            self.close_session_locked(&mut inner, &id).await;
        }
        inner.connection = None;
        inner.active_mode = None;
        if let Some(mut browser) = inner.browser.take() {
            let _ = browser.start_kill();
        }
    }

    /// Counters for the dashboard.
    pub async fn state(&self) -> serde_json::Value {
        let inner = self.inner.lock().await;
        serde_json::json!({
            "mode": self.config.mode,
            "connected": inner.connection.as_ref().map(|c| c.is_alive()).unwrap_or(false),
            "sessions": inner.sessions.len(),
            "max_sessions": self.config.max_sessions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, updated_at: DateTime<Utc>) -> BrowserSession {
        BrowserSession {
            id: id.to_string(),
            target_id: format!("target-{id}"),
            cdp_session: format!("cdp-{id}"),
            context_id: None,
            owns_context: false,
            owns_page: true,
            attached: true,
            reused_existing_page: false,
            mode: BrowserMode::Launch,
            created_at: updated_at,
            updated_at,
            title: String::new(),
            last_snapshot_at: None,
        }
    }

    #[test]
    fn test_ref_not_found_message() {
        let err = ChromeError::RefNotFound(7);
        assert_eq!(
            err.to_string(),
            "Ref 7 not found. Run nx_chrome_session_snapshot again."
        );
    }

    #[test]
    fn test_blank_url_detection() {
        assert!(is_blank_url("about:blank"));
        assert!(is_blank_url("chrome://newtab/"));
        assert!(is_blank_url(""));
        assert!(!is_blank_url("https://example.com"));
    }

    #[test]
    fn test_pick_reusable_prefers_real_urls() {
        let targets = vec![
            serde_json::json!({ "type": "page", "targetId": "t1", "url": "about:blank" }),
            serde_json::json!({ "type": "page", "targetId": "t2", "url": "https://example.com" }),
            serde_json::json!({ "type": "service_worker", "targetId": "t3", "url": "https://x.dev" }),
        ];
        let claimed = HashSet::new();
        let (id, url) = pick_reusable_target(&targets, &claimed).unwrap();
        assert_eq!(id, "t2");
        assert_eq!(url, "https://example.com");
    }

    #[test]
    fn test_pick_reusable_falls_back_to_blank_page() {
        let targets = vec![
            serde_json::json!({ "type": "page", "targetId": "t1", "url": "about:blank" }),
        ];
        let claimed = HashSet::new();
        let (id, _) = pick_reusable_target(&targets, &claimed).unwrap();
        assert_eq!(id, "t1");
    }

    #[test]
    fn test_pick_reusable_skips_claimed() {
        let targets = vec![
            serde_json::json!({ "type": "page", "targetId": "t1", "url": "https://a.com" }),
            serde_json::json!({ "type": "page", "targetId": "t2", "url": "https://b.com" }),
        ];
        let mut claimed = HashSet::new();
        claimed.insert("t1".to_string());
        let (id, _) = pick_reusable_target(&targets, &claimed).unwrap();
        assert_eq!(id, "t2");

        claimed.insert("t2".to_string());
        assert!(pick_reusable_target(&targets, &claimed).is_none());
    }

    #[test]
    fn test_lru_picks_oldest() {
        let mut sessions = HashMap::new();
        let now = Utc::now();
        sessions.insert("a".to_string(), session("a", now - chrono::Duration::minutes(5)));
        sessions.insert("b".to_string(), session("b", now - chrono::Duration::minutes(50)));
        sessions.insert("c".to_string(), session("c", now));
        assert_eq!(lru_session_id(&sessions), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_launch_with_bad_executable_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChromeConfig {
            mode: "launch".to_string(),
            executable_path: Some(PathBuf::from("/definitely/not/a/browser")),
            ..Default::default()
        };
        let controller = ChromeController::new(
            config,
            dir.path().join("shots"),
            dir.path().join("profile"),
        );
        let err = controller.open_session(None).await.unwrap_err();
        assert!(matches!(err, ChromeError::Launch(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_cdp_without_fallback_reports_hint() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChromeConfig {
            mode: "cdp".to_string(),
            cdp_url: "http://127.0.0.1:1".to_string(),
            cdp_connect_timeout_ms: 500,
            cdp_fallback_to_launch: false,
            ..Default::default()
        };
        let controller = ChromeController::new(
            config,
            dir.path().join("shots"),
            dir.path().join("profile"),
        );
        let err = controller.open_session(None).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("cdp attach"), "got: {text}");
        assert!(text.contains("cdp_fallback_to_launch"), "got: {text}");
    }

    #[tokio::test]
    async fn test_session_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let controller = ChromeController::new(
            ChromeConfig::default(),
            dir.path().join("shots"),
            dir.path().join("profile"),
        );
        let err = controller.snapshot("missing", false, 100).await.unwrap_err();
        assert!(matches!(err, ChromeError::SessionNotFound(_)));
    }
}
