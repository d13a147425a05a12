//! Prompt composition.
//!
//! Every turn gets a fixed preamble, the compiled core markdown context
//! (compressed and cached when it outgrows its budget), bounded snapshots
//! of objectives / tasks / memory matches, the SOUL summary, working
//! memory, enabled skill previews, a short behaviour block, and finally
//! the user text.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::fsutil;
use crate::memory::chunker::content_hash;

/// Compression threshold for the concatenated core files.
const CORE_CONTEXT_BUDGET: usize = 12_000;
/// Per-file budget once compression kicks in.
const COMPRESSED_FILE_BUDGET: usize = 1_200;

/// Workspace files compiled into every prompt, in order.
const CORE_FILES: &[&str] = &[
    "IDENTITY.md",
    "USER.md",
    "AGENTS.md",
    "BOOTSTRAP.md",
    "HEARTBEAT.md",
    "TOOLS.md",
];

/// Caching compiler for the core markdown context.
pub struct CoreContextCompiler {
    /// SHA-1 of the raw concatenation → compiled text.
    cache: Mutex<HashMap<String, String>>,
}

impl CoreContextCompiler {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Compile the core context from the workspace files plus the runtime
    /// tool list. Over-budget input is compressed extractively; results
    /// are cached by the hash of the raw inputs.
    pub fn compile(&self, workspace_dir: &Path, tool_names: &[String]) -> String {
        let mut raw_parts: Vec<(String, String)> = Vec::new();
        for name in CORE_FILES {
            let text = fsutil::read_text_or_empty(&workspace_dir.join(name)).unwrap_or_default();
            if !text.trim().is_empty() {
                raw_parts.push((name.to_string(), text));
            }
        }
        if !tool_names.is_empty() {
            raw_parts.push((
                "RUNTIME TOOLS".to_string(),
                tool_names
                    .iter()
                    .map(|n| format!("- {n}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ));
        }

        let raw: String = raw_parts
            .iter()
            .map(|(name, text)| format!("### {name}\n{text}\n"))
            .collect();
        if raw.len() <= CORE_CONTEXT_BUDGET {
            return raw;
        }

        let key = content_hash(&raw);
        {
            let cache = self.cache.lock().expect("core context cache");
            if let Some(hit) = cache.get(&key) {
                return hit.clone();
            }
        }

        let compiled: String = raw_parts
            .iter()
            .map(|(name, text)| format!("### {name}\n{}\n", summarize_markdown(text, COMPRESSED_FILE_BUDGET)))
            .collect();
        self.cache
            .lock()
            .expect("core context cache")
            .insert(key, compiled.clone());
        compiled
    }
}

impl Default for CoreContextCompiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Extractive compression: keep headings and leading lines of each section
/// until the budget runs out.
fn summarize_markdown(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.trim_end().to_string();
    }
    let mut out = String::new();
    let mut lines_after_heading = 0usize;
    for line in text.lines() {
        let keep = if line.starts_with('#') {
            lines_after_heading = 0;
            true
        } else if !line.trim().is_empty() {
            lines_after_heading += 1;
            lines_after_heading <= 2
        } else {
            false
        };
        if keep {
            if out.len() + line.len() + 1 > budget {
                out.push_str("…\n");
                break;
            }
            out.push_str(line);
            out.push('\n');
        }
    }
    out.trim_end().to_string()
}

/// Everything the turn prompt is assembled from.
pub struct PromptParts<'a> {
    pub source: &'a str,
    pub channel_id: &'a str,
    pub session_id: Option<&'a str>,
    pub queue_depth: usize,
    pub core_context: &'a str,
    pub objectives_block: &'a str,
    pub tasks_block: &'a str,
    pub memory_matches: &'a [String],
    pub soul_summary: &'a str,
    pub working_memory: &'a str,
    pub skill_previews: &'a [String],
    pub user_text: &'a str,
}

/// Assemble the final turn prompt.
pub fn compose(parts: &PromptParts<'_>) -> String {
    let mut prompt = String::with_capacity(4096);

    prompt.push_str(&format!(
        "[request] source={} channel={} session={} queue_depth={}\n\n",
        parts.source,
        parts.channel_id,
        parts.session_id.unwrap_or("-"),
        parts.queue_depth
    ));

    if !parts.core_context.is_empty() {
        prompt.push_str("## Core context\n");
        prompt.push_str(parts.core_context);
        prompt.push('\n');
    }
    if !parts.objectives_block.is_empty() {
        prompt.push_str("## Active objectives\n");
        prompt.push_str(parts.objectives_block);
        prompt.push('\n');
    }
    if !parts.tasks_block.is_empty() {
        prompt.push_str("## Tasks\n");
        prompt.push_str(parts.tasks_block);
        prompt.push('\n');
    }
    if !parts.memory_matches.is_empty() {
        prompt.push_str("## Relevant memory\n");
        for hit in parts.memory_matches {
            prompt.push_str(&format!("- {hit}\n"));
        }
        prompt.push('\n');
    }
    if !parts.soul_summary.is_empty() {
        prompt.push_str("## Identity\n");
        prompt.push_str(parts.soul_summary);
        prompt.push('\n');
    }
    if !parts.working_memory.is_empty() {
        prompt.push_str("## Working memory\n");
        prompt.push_str(parts.working_memory);
        prompt.push('\n');
    }
    if !parts.skill_previews.is_empty() {
        prompt.push_str("## Enabled skills\n");
        for preview in parts.skill_previews {
            prompt.push_str(&format!("- {preview}\n"));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "## Behaviour\n\
         Reply directly and concretely. Use tools when they help. Record \
         durable facts as memory notes. Never invent tool results.\n\n",
    );
    prompt.push_str("## Request\n");
    prompt.push_str(parts.user_text);
    prompt
}

/// Keep only characters safe for identifiers; bound the length.
pub fn sanitize_identifier(value: &str) -> String {
    let mut out: String = value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@'))
        .collect();
    out.truncate(64);
    if out.is_empty() {
        out.push_str("unknown");
    }
    out
}

/// Lane key: `source:channel` plus an optional session discriminator.
pub fn lane_key(source: &str, channel_id: &str, session_id: Option<&str>) -> String {
    let base = format!(
        "{}:{}",
        sanitize_identifier(source),
        sanitize_identifier(channel_id)
    );
    match session_id {
        Some(session) if !session.trim().is_empty() => {
            format!("{base}::session::{}", sanitize_identifier(session))
        }
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lane_key_shapes() {
        assert_eq!(lane_key("slack", "C042", None), "slack:C042");
        assert_eq!(
            lane_key("slack", "C042", Some("thread 9!")),
            "slack:C042::session::thread9"
        );
        assert_eq!(lane_key("", "", None), "unknown:unknown");
    }

    #[test]
    fn test_sanitize_strips_and_bounds() {
        assert_eq!(sanitize_identifier("user name/../../etc"), "username....etc");
        let long = "x".repeat(200);
        assert_eq!(sanitize_identifier(&long).len(), 64);
    }

    #[test]
    fn test_compose_orders_sections() {
        let matches = vec!["remembered fact".to_string()];
        let skills = vec!["weather: fetch forecasts".to_string()];
        let prompt = compose(&PromptParts {
            source: "slack",
            channel_id: "C1",
            session_id: Some("s1"),
            queue_depth: 2,
            core_context: "### IDENTITY.md\nI am the runtime\n",
            objectives_block: "- [p1] ship release\n",
            tasks_block: "- running: build\n",
            memory_matches: &matches,
            soul_summary: "- Principles\n",
            working_memory: "### Recent days\n…\n",
            skill_previews: &skills,
            user_text: "what is next?",
        });

        let order = [
            "[request]",
            "## Core context",
            "## Active objectives",
            "## Tasks",
            "## Relevant memory",
            "## Identity",
            "## Working memory",
            "## Enabled skills",
            "## Behaviour",
            "## Request",
        ];
        let mut last = 0;
        for marker in order {
            let pos = prompt.find(marker).unwrap_or_else(|| panic!("missing {marker}"));
            assert!(pos >= last, "{marker} out of order");
            last = pos;
        }
        assert!(prompt.ends_with("what is next?"));
        assert!(prompt.contains("queue_depth=2"));
    }

    #[test]
    fn test_compose_skips_empty_sections() {
        let prompt = compose(&PromptParts {
            source: "cli",
            channel_id: "local",
            session_id: None,
            queue_depth: 0,
            core_context: "",
            objectives_block: "",
            tasks_block: "",
            memory_matches: &[],
            soul_summary: "",
            working_memory: "",
            skill_previews: &[],
            user_text: "hello",
        });
        assert!(!prompt.contains("## Active objectives"));
        assert!(!prompt.contains("## Relevant memory"));
        assert!(prompt.contains("## Request\nhello"));
    }

    #[test]
    fn test_core_context_small_passthrough() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("IDENTITY.md"), "# Identity\nshort").unwrap();
        let compiler = CoreContextCompiler::new();
        let out = compiler.compile(dir.path(), &["nx_task_run".to_string()]);
        assert!(out.contains("# Identity"));
        assert!(out.contains("nx_task_run"));
    }

    #[test]
    fn test_core_context_compresses_and_caches() {
        let dir = tempdir().unwrap();
        let mut big = String::from("# Manual\n");
        for i in 0..600 {
            big.push_str(&format!("## Section {i}\nline one of {i}\nline two of {i}\nline three of {i}\n"));
        }
        std::fs::write(dir.path().join("AGENTS.md"), &big).unwrap();

        let compiler = CoreContextCompiler::new();
        let first = compiler.compile(dir.path(), &[]);
        assert!(first.len() < big.len());
        // Headings survive, deep section bodies get clipped.
        assert!(first.contains("### AGENTS.md"));

        // Second compile is a cache hit (same content hash, same output).
        let second = compiler.compile(dir.path(), &[]);
        assert_eq!(first, second);
        assert_eq!(compiler.cache.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_summarize_markdown_keeps_headings() {
        let mut text = String::new();
        for i in 0..100 {
            text.push_str(&format!("## H{i}\nbody a {i}\nbody b {i}\nbody c {i}\n"));
        }
        let out = summarize_markdown(&text, 500);
        assert!(out.len() <= 520);
        assert!(out.starts_with("## H0"));
        assert!(!out.contains("body c 0"));
    }
}
