//! LLM provider abstraction.
//!
//! The runtime only needs `complete()` over a message history; concrete
//! providers (Anthropic, OpenAI, Gemini) live in `providers`. Credential
//! presence is tracked in an auth snapshot loaded from `agent/auth.json`
//! plus environment keys.

mod providers;

pub use providers::{AnthropicProvider, GeminiProvider, OpenAiProvider};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsutil;

/// Error type for LLM calls.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no authenticated provider")]
    NoProvider,

    #[error("prompt timed out after {0} ms")]
    Timeout(u64),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Whether this error signals a context-window overflow that memory
    /// compaction or history truncation can recover from.
    pub fn is_context_overflow(&self) -> bool {
        match self {
            LlmError::Provider(text) | LlmError::InvalidResponse(text) => {
                is_overflow_signature(text)
            }
            _ => false,
        }
    }
}

/// Known overflow signatures across providers.
pub fn is_overflow_signature(text: &str) -> bool {
    let lower = text.to_lowercase();
    [
        "maximum context",
        "context length",
        "context_length_exceeded",
        "context window",
        "prompt is too long",
        "input is too long",
        "too many tokens",
        "exceeds the maximum",
    ]
    .iter()
    .any(|sig| lower.contains(sig))
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Request for one completion over a message history.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Completion result. `content` is the concatenation of every text part of
/// the assistant message.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
}

/// Trait over chat-completion providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider family name ("anthropic", "openai-codex", "gemini-cli").
    fn name(&self) -> &str;

    /// Run one completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

// ---------------------------------------------------------------------------
// Auth snapshot
// ---------------------------------------------------------------------------

/// Persisted credential bookkeeping (never the secrets themselves — keys
/// stay in the environment; the file records which families were set up).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSnapshot {
    #[serde(default)]
    pub providers: HashMap<String, bool>,
    #[serde(default)]
    pub active: Option<String>,
}

impl AuthSnapshot {
    /// Load from `agent/auth.json` and overlay environment keys.
    pub fn refresh(path: &Path) -> Self {
        let mut snapshot: AuthSnapshot = fsutil::read_json_or_quarantine(path).unwrap_or_default();

        let env_pairs = [
            ("anthropic", "ANTHROPIC_API_KEY"),
            ("openai-codex", "OPENAI_API_KEY"),
            ("gemini-cli", "GEMINI_API_KEY"),
        ];
        for (provider, var) in env_pairs {
            if std::env::var(var).map(|v| !v.trim().is_empty()).unwrap_or(false) {
                snapshot.providers.insert(provider.to_string(), true);
            }
        }
        snapshot
    }

    pub fn save(&self, path: &Path) -> Result<(), fsutil::FsError> {
        fsutil::write_json_atomic(path, self)
    }

    /// Whether any provider family is usable.
    pub fn any_authenticated(&self) -> bool {
        self.providers.values().any(|v| *v)
    }

    pub fn is_authenticated(&self, provider: &str) -> bool {
        self.providers.get(provider).copied().unwrap_or(false)
    }

    /// Pick the provider to use: the preferred family when authenticated,
    /// else the first authenticated one.
    pub fn select(&self, preferred: &str) -> Option<String> {
        if self.is_authenticated(preferred) {
            return Some(preferred.to_string());
        }
        let mut names: Vec<&String> = self
            .providers
            .iter()
            .filter(|(_, ok)| **ok)
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names.first().map(|s| s.to_string())
    }
}

/// Build the provider for an authenticated family.
pub fn create_provider(
    family: &str,
    model_override: Option<&str>,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match family {
        "anthropic" => {
            let key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| LlmError::NoProvider)?;
            Ok(Arc::new(AnthropicProvider::new(key, model_override)))
        }
        "openai-codex" => {
            let key = std::env::var("OPENAI_API_KEY").map_err(|_| LlmError::NoProvider)?;
            Ok(Arc::new(OpenAiProvider::new(key, model_override)))
        }
        "gemini-cli" => {
            let key = std::env::var("GEMINI_API_KEY").map_err(|_| LlmError::NoProvider)?;
            Ok(Arc::new(GeminiProvider::new(key, model_override)))
        }
        other => Err(LlmError::Provider(format!("unknown provider family: {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Scripted provider (tests and dry runs)
// ---------------------------------------------------------------------------

/// Deterministic provider driven by a queue of scripted outcomes; the final
/// outcome replays once the queue drains. Lets runtime tests exercise the
/// retry and overflow recovery paths without a network.
pub struct ScriptedProvider {
    script: std::sync::Mutex<std::collections::VecDeque<Result<String, String>>>,
    calls: std::sync::atomic::AtomicUsize,
    /// Last message content of every request, for assertions.
    pub seen: std::sync::Mutex<Vec<String>>,
}

impl ScriptedProvider {
    /// `Ok(reply)` completes; `Err(text)` fails with a provider error
    /// carrying `text` (overflow signatures are classified as usual).
    pub fn new(outcomes: Vec<Result<String, String>>) -> Self {
        Self {
            script: std::sync::Mutex::new(outcomes.into()),
            calls: std::sync::atomic::AtomicUsize::new(0),
            seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn always(reply: &str) -> Self {
        Self::new(vec![Ok(reply.to_string())])
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(last) = request.messages.last() {
            self.seen.lock().expect("seen lock").push(last.content.clone());
        }
        let outcome = {
            let mut script = self.script.lock().expect("script lock");
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match outcome {
            Some(Ok(content)) => Ok(CompletionResponse {
                content,
                model: "scripted".to_string(),
            }),
            Some(Err(text)) => Err(LlmError::Provider(text)),
            None => Err(LlmError::Provider("script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_overflow_signatures() {
        assert!(is_overflow_signature("Error: maximum context length exceeded"));
        assert!(is_overflow_signature("request failed: context_length_exceeded"));
        assert!(is_overflow_signature("Prompt is too long: 210000 tokens"));
        assert!(!is_overflow_signature("rate limit exceeded"));
        assert!(!is_overflow_signature("connection reset"));
    }

    #[test]
    fn test_llm_error_overflow_classification() {
        assert!(LlmError::Provider("maximum context reached".to_string()).is_context_overflow());
        assert!(!LlmError::Timeout(1000).is_context_overflow());
        assert!(!LlmError::NoProvider.is_context_overflow());
    }

    #[test]
    fn test_auth_snapshot_selects_preferred() {
        let mut snapshot = AuthSnapshot::default();
        snapshot.providers.insert("anthropic".to_string(), true);
        snapshot.providers.insert("gemini-cli".to_string(), true);

        assert_eq!(snapshot.select("anthropic"), Some("anthropic".to_string()));
        // Preferred not authenticated: first authenticated (sorted) wins.
        assert_eq!(snapshot.select("openai-codex"), Some("anthropic".to_string()));
    }

    #[test]
    fn test_auth_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("auth.json");

        let mut snapshot = AuthSnapshot::default();
        snapshot.providers.insert("anthropic".to_string(), true);
        snapshot.active = Some("anthropic".to_string());
        snapshot.save(&path).unwrap();

        let loaded = AuthSnapshot::refresh(&path);
        assert!(loaded.is_authenticated("anthropic"));
        assert!(loaded.any_authenticated());
    }

    #[tokio::test]
    async fn test_scripted_provider_sequence() {
        let provider = ScriptedProvider::new(vec![
            Err("maximum context".to_string()),
            Ok("recovered".to_string()),
        ]);

        let request = CompletionRequest::new(vec![ChatMessage::user("hi")]);
        let first = provider.complete(request.clone()).await;
        assert!(first.unwrap_err().is_context_overflow());

        let second = provider.complete(request.clone()).await.unwrap();
        assert_eq!(second.content, "recovered");

        // Final outcome replays.
        let third = provider.complete(request).await.unwrap();
        assert_eq!(third.content, "recovered");
        assert_eq!(provider.call_count(), 3);
    }
}
