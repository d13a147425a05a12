//! Browser tools over the chrome controller.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::chrome::ChromeController;
use crate::tools::{optional_bool, optional_str, optional_u64, required_str, Tool, ToolError, ToolOutput};

fn require_ref(params: &serde_json::Value) -> Result<u32, ToolError> {
    params
        .get("ref")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .ok_or_else(|| ToolError::InvalidParameters("missing 'ref'".to_string()))
}

/// Open a browser session, optionally navigating somewhere.
pub struct ChromeOpenTool {
    controller: Arc<ChromeController>,
}

impl ChromeOpenTool {
    pub fn new(controller: Arc<ChromeController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl Tool for ChromeOpenTool {
    fn name(&self) -> &str {
        "nx_chrome_session_open"
    }

    fn label(&self) -> &str {
        "Open browser session"
    }

    fn description(&self) -> &str {
        "Open a browser session and optionally navigate to a URL. Returns the session id for later calls."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "url": { "type": "string" } }
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let session = self
            .controller
            .open_session(optional_str(&params, "url"))
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::json(
            serde_json::json!({
                "session_id": session.id,
                "reused_existing_page": session.reused_existing_page,
            }),
            started.elapsed(),
        ))
    }
}

/// Snapshot interactable elements with stable numeric refs.
pub struct ChromeSnapshotTool {
    controller: Arc<ChromeController>,
}

impl ChromeSnapshotTool {
    pub fn new(controller: Arc<ChromeController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl Tool for ChromeSnapshotTool {
    fn name(&self) -> &str {
        "nx_chrome_session_snapshot"
    }

    fn label(&self) -> &str {
        "Snapshot page"
    }

    fn description(&self) -> &str {
        "Tag interactable elements with numeric refs and return their descriptors. Refs stay valid until the DOM changes."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "include_invisible": { "type": "boolean" },
                "max_elements": { "type": "integer", "minimum": 1, "maximum": 500 }
            },
            "required": ["session_id"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let session_id = required_str(&params, "session_id")?;
        let snapshot = self
            .controller
            .snapshot(
                session_id,
                optional_bool(&params, "include_invisible").unwrap_or(false),
                optional_u64(&params, "max_elements").unwrap_or(200) as usize,
            )
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::json(
            serde_json::to_value(&snapshot)
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?,
            started.elapsed(),
        ))
    }
}

/// Click an element by ref.
pub struct ChromeClickTool {
    controller: Arc<ChromeController>,
}

impl ChromeClickTool {
    pub fn new(controller: Arc<ChromeController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl Tool for ChromeClickTool {
    fn name(&self) -> &str {
        "nx_chrome_click"
    }

    fn label(&self) -> &str {
        "Click element"
    }

    fn description(&self) -> &str {
        "Click the element tagged with the given snapshot ref."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "ref": { "type": "integer", "minimum": 1 }
            },
            "required": ["session_id", "ref"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let session_id = required_str(&params, "session_id")?;
        let ref_id = require_ref(&params)?;
        self.controller
            .click_by_ref(session_id, ref_id)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::json(serde_json::json!({ "clicked": ref_id }), started.elapsed()))
    }
}

/// Type into an element by ref.
pub struct ChromeTypeTool {
    controller: Arc<ChromeController>,
}

impl ChromeTypeTool {
    pub fn new(controller: Arc<ChromeController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl Tool for ChromeTypeTool {
    fn name(&self) -> &str {
        "nx_chrome_type"
    }

    fn label(&self) -> &str {
        "Type text"
    }

    fn description(&self) -> &str {
        "Type into the element tagged with the given ref. Optionally clear it first and press Enter after."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "ref": { "type": "integer", "minimum": 1 },
                "text": { "type": "string" },
                "clear": { "type": "boolean" },
                "press_enter": { "type": "boolean" }
            },
            "required": ["session_id", "ref", "text"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let session_id = required_str(&params, "session_id")?;
        let ref_id = require_ref(&params)?;
        let text = params
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'text'".to_string()))?;
        self.controller
            .type_by_ref(
                session_id,
                ref_id,
                text,
                optional_bool(&params, "clear").unwrap_or(true),
                optional_bool(&params, "press_enter").unwrap_or(false),
            )
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::json(serde_json::json!({ "typed": ref_id }), started.elapsed()))
    }
}

/// Evaluate JavaScript in the page. Gated: arbitrary code execution.
pub struct ChromeEvaluateTool {
    controller: Arc<ChromeController>,
}

impl ChromeEvaluateTool {
    pub fn new(controller: Arc<ChromeController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl Tool for ChromeEvaluateTool {
    fn name(&self) -> &str {
        "nx_chrome_evaluate"
    }

    fn label(&self) -> &str {
        "Evaluate in page"
    }

    fn description(&self) -> &str {
        "Evaluate a JavaScript expression in the page and return its stringified result."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "expression": { "type": "string" }
            },
            "required": ["session_id", "expression"]
        })
    }

    fn requires_authorization(&self) -> bool {
        true
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let session_id = required_str(&params, "session_id")?;
        let expression = required_str(&params, "expression")?;
        let value = self
            .controller
            .evaluate(session_id, expression)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::text(value, started.elapsed()))
    }
}

/// Screenshot the page.
pub struct ChromeScreenshotTool {
    controller: Arc<ChromeController>,
}

impl ChromeScreenshotTool {
    pub fn new(controller: Arc<ChromeController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl Tool for ChromeScreenshotTool {
    fn name(&self) -> &str {
        "nx_chrome_screenshot"
    }

    fn label(&self) -> &str {
        "Screenshot"
    }

    fn description(&self) -> &str {
        "Capture a PNG screenshot of the page; returns the saved file path."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "session_id": { "type": "string" } },
            "required": ["session_id"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let session_id = required_str(&params, "session_id")?;
        let path = self
            .controller
            .screenshot(session_id)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::json(
            serde_json::json!({ "path": path.display().to_string() }),
            started.elapsed(),
        ))
    }
}

/// Close a browser session.
pub struct ChromeCloseTool {
    controller: Arc<ChromeController>,
}

impl ChromeCloseTool {
    pub fn new(controller: Arc<ChromeController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl Tool for ChromeCloseTool {
    fn name(&self) -> &str {
        "nx_chrome_session_close"
    }

    fn label(&self) -> &str {
        "Close browser session"
    }

    fn description(&self) -> &str {
        "Close a browser session and release its page/context."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "session_id": { "type": "string" } },
            "required": ["session_id"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let session_id = required_str(&params, "session_id")?;
        let closed = self.controller.close_session(session_id).await;
        Ok(ToolOutput::json(serde_json::json!({ "closed": closed }), started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChromeConfig;
    use tempfile::tempdir;

    fn controller_in(dir: &std::path::Path) -> Arc<ChromeController> {
        Arc::new(ChromeController::new(
            ChromeConfig {
                executable_path: Some("/definitely/not/a/browser".into()),
                ..Default::default()
            },
            dir.join("shots"),
            dir.join("profile"),
        ))
    }

    #[tokio::test]
    async fn test_open_surfaces_browser_errors() {
        let dir = tempdir().unwrap();
        let tool = ChromeOpenTool::new(controller_in(dir.path()));
        let err = tool.execute(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn test_click_requires_ref() {
        let dir = tempdir().unwrap();
        let tool = ChromeClickTool::new(controller_in(dir.path()));
        let err = tool
            .execute(serde_json::json!({ "session_id": "s" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_unknown_session_maps_to_execution_error() {
        let dir = tempdir().unwrap();
        let tool = ChromeSnapshotTool::new(controller_in(dir.path()));
        let err = tool
            .execute(serde_json::json!({ "session_id": "missing" }))
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("session not found"), "got: {text}");
    }

    #[test]
    fn test_evaluate_is_gated() {
        let dir = tempdir().unwrap();
        let tool = ChromeEvaluateTool::new(controller_in(dir.path()));
        assert!(tool.requires_authorization());
    }
}
