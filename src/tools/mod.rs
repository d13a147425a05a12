//! Tool surface exposed to agent sessions.
//!
//! Every tool is a uniform record: name, label, description, JSON-Schema
//! parameters, and an executor. A single registry dispatches by name.

pub mod chrome_tools;
pub mod memory_tools;
pub mod objective_tools;
pub mod task_tools;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Error type for tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

/// Output from a tool execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    #[serde(skip)]
    pub duration: Duration,
}

impl ToolOutput {
    pub fn json(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }
}

/// Declarative description of a tool for the LLM function surface.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub label: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Trait for tools the agent can call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Short human label for dashboards and logs.
    fn label(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> serde_json::Value;

    /// Whether this tool needs the registry's dangerous-tools grant.
    fn requires_authorization(&self) -> bool {
        false
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            label: self.label().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Dispatcher table over the registered tools.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    allow_dangerous: bool,
}

impl ToolRegistry {
    pub fn new(allow_dangerous: bool) -> Self {
        Self {
            tools: Vec::new(),
            allow_dangerous,
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// Execute a tool by name.
    pub async fn dispatch(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        if tool.requires_authorization() && !self.allow_dangerous {
            return Err(ToolError::NotAuthorized(format!(
                "{name} requires the dangerous-tools grant"
            )));
        }
        tool.execute(params).await
    }
}

/// Helpers shared by tool implementations.
pub(crate) fn required_str<'a>(
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{key}'")))
}

pub(crate) fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub(crate) fn optional_u64(params: &serde_json::Value, key: &str) -> Option<u64> {
    params.get(key).and_then(|v| v.as_u64())
}

pub(crate) fn optional_bool(params: &serde_json::Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn label(&self) -> &str {
            "Echo"
        }
        fn description(&self) -> &str {
            "Echoes the message back."
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            })
        }
        async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
            let message = required_str(&params, "message")?;
            Ok(ToolOutput::text(message, Duration::from_millis(1)))
        }
    }

    struct GuardedTool;

    #[async_trait]
    impl Tool for GuardedTool {
        fn name(&self) -> &str {
            "guarded"
        }
        fn label(&self) -> &str {
            "Guarded"
        }
        fn description(&self) -> &str {
            "Needs authorization."
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object", "properties": {} })
        }
        fn requires_authorization(&self) -> bool {
            true
        }
        async fn execute(&self, _params: serde_json::Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("secret", Duration::from_millis(1)))
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_name() {
        let mut registry = ToolRegistry::new(false);
        registry.register(Arc::new(EchoTool));

        let out = registry
            .dispatch("echo", serde_json::json!({ "message": "hi" }))
            .await
            .unwrap();
        assert_eq!(out.result, serde_json::json!("hi"));

        let err = registry
            .dispatch("nope", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_missing_parameter() {
        let mut registry = ToolRegistry::new(false);
        registry.register(Arc::new(EchoTool));
        let err = registry
            .dispatch("echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_authorization_gate() {
        let mut locked = ToolRegistry::new(false);
        locked.register(Arc::new(GuardedTool));
        let err = locked.dispatch("guarded", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotAuthorized(_)));

        let mut open = ToolRegistry::new(true);
        open.register(Arc::new(GuardedTool));
        assert!(open.dispatch("guarded", serde_json::json!({})).await.is_ok());
    }

    #[test]
    fn test_schema_shape() {
        let tool = EchoTool;
        let schema = tool.schema();
        assert_eq!(schema.name, "echo");
        assert_eq!(schema.label, "Echo");
        assert!(schema.parameters["required"][0] == "message");
    }
}
