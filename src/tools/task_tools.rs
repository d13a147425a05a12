//! Shell and schedule tools over the task manager.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::tasks::{RunRequest, TaskManager};
use crate::tools::{
    optional_bool, optional_str, optional_u64, required_str, Tool, ToolError, ToolOutput,
};

fn task_json(task: &crate::tasks::Task) -> serde_json::Value {
    serde_json::json!({
        "id": task.id,
        "name": task.name,
        "status": task.status.as_str(),
        "command": task.command,
        "attempts": task.attempts,
        "exit_code": task.exit_code,
        "error": task.error,
        "tail": task.tail.iter().rev().take(10).rev().collect::<Vec<_>>(),
    })
}

/// Run a shell command, optionally in the background with retries.
pub struct TaskRunTool {
    manager: TaskManager,
}

impl TaskRunTool {
    pub fn new(manager: TaskManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for TaskRunTool {
    fn name(&self) -> &str {
        "nx_task_run"
    }

    fn label(&self) -> &str {
        "Run command"
    }

    fn description(&self) -> &str {
        "Run a shell command. Set background=true for long-running work; the task id can be tailed later."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to run" },
                "cwd": { "type": "string", "description": "Working directory" },
                "background": { "type": "boolean", "description": "Do not wait for completion" },
                "timeout_ms": { "type": "integer", "minimum": 0 },
                "max_retries": { "type": "integer", "minimum": 0, "maximum": 20 },
                "retry_delay_ms": { "type": "integer", "minimum": 250 },
                "dedupe_running": { "type": "boolean" }
            },
            "required": ["command"]
        })
    }

    fn requires_authorization(&self) -> bool {
        true
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let command = required_str(&params, "command")?;
        let request = RunRequest {
            command: command.to_string(),
            cwd: optional_str(&params, "cwd").map(Into::into),
            background: optional_bool(&params, "background").unwrap_or(false),
            timeout_ms: optional_u64(&params, "timeout_ms").unwrap_or(120_000),
            max_retries: optional_u64(&params, "max_retries").unwrap_or(0) as u32,
            retry_delay_ms: optional_u64(&params, "retry_delay_ms").unwrap_or(2_000),
            dedupe_running: optional_bool(&params, "dedupe_running").unwrap_or(false),
            ..Default::default()
        };
        let task = self
            .manager
            .run_command(request)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::json(task_json(&task), started.elapsed()))
    }
}

/// Install a recurring schedule.
pub struct TaskScheduleTool {
    manager: TaskManager,
}

impl TaskScheduleTool {
    pub fn new(manager: TaskManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for TaskScheduleTool {
    fn name(&self) -> &str {
        "nx_task_schedule"
    }

    fn label(&self) -> &str {
        "Schedule command"
    }

    fn description(&self) -> &str {
        "Run a shell command repeatedly at a fixed interval (minimum 1000 ms)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "command": { "type": "string" },
                "interval_ms": { "type": "integer", "minimum": 1000 },
                "cwd": { "type": "string" }
            },
            "required": ["name", "command", "interval_ms"]
        })
    }

    fn requires_authorization(&self) -> bool {
        true
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let name = required_str(&params, "name")?;
        let command = required_str(&params, "command")?;
        let interval_ms = optional_u64(&params, "interval_ms")
            .ok_or_else(|| ToolError::InvalidParameters("missing 'interval_ms'".to_string()))?;
        let task = self
            .manager
            .schedule_command(name, command, interval_ms, optional_str(&params, "cwd").map(Into::into))
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::json(task_json(&task), started.elapsed()))
    }
}

/// Stop a running or scheduled task.
pub struct TaskStopTool {
    manager: TaskManager,
}

impl TaskStopTool {
    pub fn new(manager: TaskManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for TaskStopTool {
    fn name(&self) -> &str {
        "nx_task_stop"
    }

    fn label(&self) -> &str {
        "Stop task"
    }

    fn description(&self) -> &str {
        "Stop a task by id: cancels its schedule or queue slot and terminates any running child."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "task_id": { "type": "string" } },
            "required": ["task_id"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let task_id = required_str(&params, "task_id")?;
        let stopped = self.manager.stop(task_id).await;
        Ok(ToolOutput::json(
            serde_json::json!({ "stopped": stopped }),
            started.elapsed(),
        ))
    }
}

/// Read a task's recent output.
pub struct TaskTailTool {
    manager: TaskManager,
}

impl TaskTailTool {
    pub fn new(manager: TaskManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for TaskTailTool {
    fn name(&self) -> &str {
        "nx_task_tail"
    }

    fn label(&self) -> &str {
        "Tail task log"
    }

    fn description(&self) -> &str {
        "Read the last lines (1-500) of a task's log."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" },
                "lines": { "type": "integer", "minimum": 1, "maximum": 500 }
            },
            "required": ["task_id"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let task_id = required_str(&params, "task_id")?;
        let lines = optional_u64(&params, "lines").unwrap_or(60) as usize;
        let tail = self
            .manager
            .tail(task_id, lines)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::json(serde_json::json!({ "lines": tail }), started.elapsed()))
    }
}

/// List tasks.
pub struct TaskListTool {
    manager: TaskManager,
}

impl TaskListTool {
    pub fn new(manager: TaskManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for TaskListTool {
    fn name(&self) -> &str {
        "nx_task_list"
    }

    fn label(&self) -> &str {
        "List tasks"
    }

    fn description(&self) -> &str {
        "List supervised tasks, most recently updated first."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "include_finished": { "type": "boolean" } }
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let include_finished = optional_bool(&params, "include_finished").unwrap_or(false);
        let tasks = self.manager.list(include_finished).await;
        let items: Vec<serde_json::Value> = tasks.iter().map(task_json).collect();
        Ok(ToolOutput::json(serde_json::json!({ "tasks": items }), started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::tasks::TaskLimits;
    use tempfile::tempdir;

    fn tools_in(dir: &std::path::Path) -> TaskManager {
        let bus = EventBus::new(dir.join("events.jsonl"), 64, 1024 * 1024);
        TaskManager::new(
            dir.join("tasks.json"),
            dir.join("logs"),
            TaskLimits::default(),
            bus,
        )
    }

    #[tokio::test]
    async fn test_run_tool_roundtrip() {
        let dir = tempdir().unwrap();
        let manager = tools_in(dir.path());
        manager.start().await;
        let tool = TaskRunTool::new(manager);

        let out = tool
            .execute(serde_json::json!({ "command": "echo tool-run" }))
            .await
            .unwrap();
        assert_eq!(out.result["status"], "completed");
        assert_eq!(out.result["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_run_tool_validates() {
        let dir = tempdir().unwrap();
        let manager = tools_in(dir.path());
        let tool = TaskRunTool::new(manager);
        let err = tool.execute(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_schedule_tool_validates_interval() {
        let dir = tempdir().unwrap();
        let manager = tools_in(dir.path());
        manager.start().await;
        let tool = TaskScheduleTool::new(manager);

        let err = tool
            .execute(serde_json::json!({ "name": "x", "command": "echo y", "interval_ms": 10 }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn test_stop_and_list_tools() {
        let dir = tempdir().unwrap();
        let manager = tools_in(dir.path());
        manager.start().await;

        let run = TaskRunTool::new(manager.clone());
        let out = run
            .execute(serde_json::json!({ "command": "sleep 5", "background": true }))
            .await
            .unwrap();
        let id = out.result["id"].as_str().unwrap().to_string();

        let list = TaskListTool::new(manager.clone());
        let listed = list.execute(serde_json::json!({})).await.unwrap();
        assert!(listed.result["tasks"].as_array().unwrap().len() >= 1);

        let stop = TaskStopTool::new(manager);
        let stopped = stop
            .execute(serde_json::json!({ "task_id": id }))
            .await
            .unwrap();
        assert_eq!(stopped.result["stopped"], true);
    }
}
