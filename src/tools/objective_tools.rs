//! Objective management tools.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::objectives::{ObjectiveQueue, ObjectiveStatus, ObjectiveUpdate};
use crate::tools::{optional_str, optional_u64, required_str, Tool, ToolError, ToolOutput};

fn objective_json(o: &crate::objectives::Objective) -> serde_json::Value {
    serde_json::json!({
        "id": o.id,
        "title": o.title,
        "description": o.description,
        "priority": o.priority,
        "status": o.status.as_str(),
        "run_count": o.run_count,
        "updated_at": o.updated_at.to_rfc3339(),
    })
}

fn parse_status(value: &str) -> Result<ObjectiveStatus, ToolError> {
    match value {
        "pending" => Ok(ObjectiveStatus::Pending),
        "in_progress" => Ok(ObjectiveStatus::InProgress),
        "blocked" => Ok(ObjectiveStatus::Blocked),
        "completed" => Ok(ObjectiveStatus::Completed),
        "failed" => Ok(ObjectiveStatus::Failed),
        "cancelled" => Ok(ObjectiveStatus::Cancelled),
        other => Err(ToolError::InvalidParameters(format!("unknown status '{other}'"))),
    }
}

/// Add an objective.
pub struct ObjectiveAddTool {
    queue: Arc<Mutex<ObjectiveQueue>>,
}

impl ObjectiveAddTool {
    pub fn new(queue: Arc<Mutex<ObjectiveQueue>>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Tool for ObjectiveAddTool {
    fn name(&self) -> &str {
        "nx_objective_add"
    }

    fn label(&self) -> &str {
        "Add objective"
    }

    fn description(&self) -> &str {
        "Add a durable objective for autonomous work. Priority 1 (highest) to 5."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "description": { "type": "string" },
                "priority": { "type": "integer", "minimum": 1, "maximum": 5 }
            },
            "required": ["title"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let title = required_str(&params, "title")?;
        let description = optional_str(&params, "description").unwrap_or("");
        let priority = optional_u64(&params, "priority").unwrap_or(3) as u8;

        let mut queue = self.queue.lock().await;
        let objective = queue
            .add(title, description, priority, "agent")
            .map_err(|e| ToolError::InvalidParameters(e.to_string()))?;
        Ok(ToolOutput::json(objective_json(&objective), started.elapsed()))
    }
}

/// List objectives.
pub struct ObjectiveListTool {
    queue: Arc<Mutex<ObjectiveQueue>>,
}

impl ObjectiveListTool {
    pub fn new(queue: Arc<Mutex<ObjectiveQueue>>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Tool for ObjectiveListTool {
    fn name(&self) -> &str {
        "nx_objective_list"
    }

    fn label(&self) -> &str {
        "List objectives"
    }

    fn description(&self) -> &str {
        "List objectives, optionally filtered by status."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["pending", "in_progress", "blocked", "completed", "failed", "cancelled"]
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let status = match optional_str(&params, "status") {
            Some(value) => Some(parse_status(value)?),
            None => None,
        };
        let queue = self.queue.lock().await;
        let items: Vec<serde_json::Value> = queue.list(status).iter().map(objective_json).collect();
        Ok(ToolOutput::json(
            serde_json::json!({ "objectives": items }),
            started.elapsed(),
        ))
    }
}

/// Update an objective's status or append a note.
pub struct ObjectiveUpdateTool {
    queue: Arc<Mutex<ObjectiveQueue>>,
}

impl ObjectiveUpdateTool {
    pub fn new(queue: Arc<Mutex<ObjectiveQueue>>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Tool for ObjectiveUpdateTool {
    fn name(&self) -> &str {
        "nx_objective_update"
    }

    fn label(&self) -> &str {
        "Update objective"
    }

    fn description(&self) -> &str {
        "Change an objective's status, priority, or append a progress note."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "status": {
                    "type": "string",
                    "enum": ["pending", "in_progress", "blocked", "completed", "failed", "cancelled"]
                },
                "priority": { "type": "integer", "minimum": 1, "maximum": 5 },
                "note": { "type": "string" }
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let id = required_str(&params, "id")?;
        let update = ObjectiveUpdate {
            status: match optional_str(&params, "status") {
                Some(value) => Some(parse_status(value)?),
                None => None,
            },
            priority: optional_u64(&params, "priority").map(|p| p as u8),
            note: optional_str(&params, "note").map(String::from),
            ..Default::default()
        };

        let mut queue = self.queue.lock().await;
        let objective = queue
            .update(id, update)
            .map_err(|e| ToolError::InvalidParameters(e.to_string()))?;
        Ok(ToolOutput::json(objective_json(&objective), started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue_in(dir: &std::path::Path) -> Arc<Mutex<ObjectiveQueue>> {
        Arc::new(Mutex::new(ObjectiveQueue::load(dir.join("objectives.json"))))
    }

    #[tokio::test]
    async fn test_add_update_list_flow() {
        let dir = tempdir().unwrap();
        let queue = queue_in(dir.path());

        let add = ObjectiveAddTool::new(Arc::clone(&queue));
        let added = add
            .execute(serde_json::json!({ "title": "write weekly summary", "priority": 2 }))
            .await
            .unwrap();
        let id = added.result["id"].as_str().unwrap().to_string();

        let update = ObjectiveUpdateTool::new(Arc::clone(&queue));
        let updated = update
            .execute(serde_json::json!({ "id": id, "status": "completed", "note": "done" }))
            .await
            .unwrap();
        assert_eq!(updated.result["status"], "completed");

        let list = ObjectiveListTool::new(queue);
        let listed = list
            .execute(serde_json::json!({ "status": "completed" }))
            .await
            .unwrap();
        assert_eq!(listed.result["objectives"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_status_rejected() {
        let dir = tempdir().unwrap();
        let queue = queue_in(dir.path());
        let list = ObjectiveListTool::new(queue);
        let err = list
            .execute(serde_json::json!({ "status": "doing-stuff" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
