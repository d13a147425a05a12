//! Memory tools: notes, search, recent turns, compaction, SOUL writes.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::memory::{MemoryStore, SearchMode, SearchOptions};
use crate::tools::{optional_bool, optional_str, optional_u64, required_str, Tool, ToolError, ToolOutput};

/// Save a long-term note.
pub struct MemoryNoteTool {
    store: Arc<MemoryStore>,
}

impl MemoryNoteTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemoryNoteTool {
    fn name(&self) -> &str {
        "nx_memory_note"
    }

    fn label(&self) -> &str {
        "Save note"
    }

    fn description(&self) -> &str {
        "Store a titled long-term note in durable memory."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "content": { "type": "string" },
                "tags": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["title", "content"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let title = required_str(&params, "title")?;
        let content = required_str(&params, "content")?;
        let tags: Vec<String> = params
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let note = self
            .store
            .add_note(title, content, "tool", tags)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::json(
            serde_json::json!({ "id": note.id, "title": note.title }),
            started.elapsed(),
        ))
    }
}

/// Hybrid memory search.
pub struct MemorySearchTool {
    store: Arc<MemoryStore>,
}

impl MemorySearchTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "nx_memory_search"
    }

    fn label(&self) -> &str {
        "Search memory"
    }

    fn description(&self) -> &str {
        "Search long-term memory, daily logs and session history. Mode 'session_strict' limits results to one session."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer", "minimum": 1, "maximum": 50 },
                "session_key": { "type": "string" },
                "mode": { "type": "string", "enum": ["global", "session_strict"] }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let query = required_str(&params, "query")?;
        let limit = optional_u64(&params, "limit").unwrap_or(8) as usize;
        let options = SearchOptions {
            session_key: optional_str(&params, "session_key").map(String::from),
            mode: SearchMode::parse(optional_str(&params, "mode").unwrap_or("global")),
        };
        let hits = self
            .store
            .search(query, limit, options)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        let items: Vec<serde_json::Value> = hits
            .iter()
            .map(|h| {
                serde_json::json!({
                    "text": h.text,
                    "source": h.source_type,
                    "path": h.path,
                    "score": h.score,
                })
            })
            .collect();
        Ok(ToolOutput::json(serde_json::json!({ "hits": items }), started.elapsed()))
    }
}

/// Recent raw conversation turns.
pub struct MemoryRecentTool {
    store: Arc<MemoryStore>,
}

impl MemoryRecentTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemoryRecentTool {
    fn name(&self) -> &str {
        "nx_memory_recent"
    }

    fn label(&self) -> &str {
        "Recent memory"
    }

    fn description(&self) -> &str {
        "Read the most recent recorded conversation turns."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "limit": { "type": "integer", "minimum": 1, "maximum": 100 } }
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let limit = optional_u64(&params, "limit").unwrap_or(20) as usize;
        let entries = self.store.recent(limit.clamp(1, 100)).await;
        let items: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "actor": e.actor,
                    "content": e.content,
                    "source": e.source,
                    "at": e.created_at.to_rfc3339(),
                })
            })
            .collect();
        Ok(ToolOutput::json(serde_json::json!({ "entries": items }), started.elapsed()))
    }
}

/// Force a compaction pass.
pub struct MemoryCompactTool {
    store: Arc<MemoryStore>,
}

impl MemoryCompactTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemoryCompactTool {
    fn name(&self) -> &str {
        "nx_memory_compact"
    }

    fn label(&self) -> &str {
        "Compact memory"
    }

    fn description(&self) -> &str {
        "Summarize older raw conversation history into long-term memory."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let note = self
            .store
            .compact_now("tool")
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::json(
            match note {
                Some(note) => serde_json::json!({
                    "compacted": note.compacted_count,
                    "summary": note.title,
                }),
                None => serde_json::json!({ "compacted": 0 }),
            },
            started.elapsed(),
        ))
    }
}

/// Update the SOUL identity file.
pub struct SoulWriteTool {
    store: Arc<MemoryStore>,
}

impl SoulWriteTool {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SoulWriteTool {
    fn name(&self) -> &str {
        "nx_soul_write"
    }

    fn label(&self) -> &str {
        "Write SOUL"
    }

    fn description(&self) -> &str {
        "Append to (default) or replace the durable identity file. Replacements snapshot the prior text to the journal."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": { "type": "string" },
                "replace": { "type": "boolean" }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let content = required_str(&params, "content")?;
        let replace = optional_bool(&params, "replace").unwrap_or(false);
        self.store
            .write_soul(content, replace)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::json(serde_json::json!({ "ok": true }), started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn store_in(dir: &std::path::Path) -> Arc<MemoryStore> {
        let mut config = Config::load(dir.to_path_buf());
        config.memory.vector.provider = "local".to_string();
        config.memory.vector.dims = 32;
        config.ensure_layout().unwrap();
        Arc::new(MemoryStore::new(&config).unwrap())
    }

    #[tokio::test]
    async fn test_note_then_search_tools() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let note = MemoryNoteTool::new(Arc::clone(&store));
        note.execute(serde_json::json!({
            "title": "deploy runbook",
            "content": "always drain the queue before deploying"
        }))
        .await
        .unwrap();

        let search = MemorySearchTool::new(store);
        let out = search
            .execute(serde_json::json!({ "query": "deploy runbook" }))
            .await
            .unwrap();
        let hits = out.result["hits"].as_array().unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0]["text"].as_str().unwrap().contains("deploy"));
    }

    #[tokio::test]
    async fn test_soul_write_tool() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());

        let tool = SoulWriteTool::new(Arc::clone(&store));
        tool.execute(serde_json::json!({ "content": "principled and curious", "replace": true }))
            .await
            .unwrap();
        assert_eq!(store.read_soul().unwrap(), "principled and curious\n");
    }

    #[tokio::test]
    async fn test_recent_tool() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .record_conversation("user", "note the anniversary", "test", vec![], None)
            .await
            .unwrap();

        let tool = MemoryRecentTool::new(store);
        let out = tool.execute(serde_json::json!({})).await.unwrap();
        assert_eq!(out.result["entries"].as_array().unwrap().len(), 1);
    }
}
