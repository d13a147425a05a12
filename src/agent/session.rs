//! One LLM conversation bound to a lane.
//!
//! The session owns the message history and the per-turn prompt call with
//! its timeout. History survives restarts via a JSON file per lane under
//! `state/lane-sessions/`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fsutil;
use crate::llm::{ChatMessage, CompletionRequest, LlmError, LlmProvider, Role};

/// Messages kept from the front of the history on truncation.
const TRUNCATE_KEEP_FIRST: usize = 2;
/// Messages kept from the back of the history on truncation.
const TRUNCATE_KEEP_LAST: usize = 8;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedHistory {
    messages: Vec<ChatMessage>,
}

/// An LLM conversation with durable history.
pub struct AgentSession {
    pub id: String,
    pub lane_key: String,
    provider: Arc<dyn LlmProvider>,
    history_path: Option<PathBuf>,
    messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl AgentSession {
    /// Create a session, reloading any persisted history for the lane.
    pub fn new(
        lane_key: &str,
        provider: Arc<dyn LlmProvider>,
        history_path: Option<PathBuf>,
    ) -> Self {
        let messages = history_path
            .as_deref()
            .and_then(|p| fsutil::read_json_or_quarantine::<PersistedHistory>(p))
            .map(|h| h.messages)
            .unwrap_or_default();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            lane_key: lane_key.to_string(),
            provider,
            history_path,
            messages,
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.messages
    }

    fn persist_history(&self) {
        if let Some(path) = &self.history_path {
            let snapshot = PersistedHistory {
                messages: self.messages.clone(),
            };
            if let Err(e) = fsutil::write_json_atomic(path, &snapshot) {
                tracing::warn!("history persist failed for {}: {}", self.lane_key, e);
            }
        }
    }

    /// Run one turn: the prompt joins the history, the provider sees the
    /// whole conversation, and the assistant reply is recorded on success.
    /// On error the prompt message is rolled back so a retry can re-issue
    /// a (possibly rebuilt) prompt.
    pub async fn prompt(&mut self, text: &str, timeout: Duration) -> Result<String, LlmError> {
        self.messages.push(ChatMessage::user(text));
        self.last_used_at = Utc::now();

        let request = CompletionRequest::new(self.messages.clone());
        let outcome = tokio::time::timeout(timeout, self.provider.complete(request)).await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.messages.pop();
                return Err(e);
            }
            Err(_) => {
                self.messages.pop();
                return Err(LlmError::Timeout(timeout.as_millis() as u64));
            }
        };

        self.messages.push(ChatMessage::assistant(&response.content));
        self.persist_history();
        Ok(response.content)
    }

    /// Drop the middle of the history, keeping the first two and last
    /// eight messages with a placeholder marking the cut. Returns how many
    /// messages were removed.
    pub fn truncate_history(&mut self) -> usize {
        let keep = TRUNCATE_KEEP_FIRST + TRUNCATE_KEEP_LAST;
        if self.messages.len() <= keep + 1 {
            return 0;
        }
        let removed = self.messages.len() - keep;
        let tail = self
            .messages
            .split_off(self.messages.len() - TRUNCATE_KEEP_LAST);
        self.messages.truncate(TRUNCATE_KEEP_FIRST);
        self.messages.push(ChatMessage {
            role: Role::Assistant,
            content: format!("[{removed} earlier messages were summarized away to free context]"),
        });
        self.messages.extend(tail);
        self.persist_history();
        removed
    }

    /// Forget the lane's durable history (used on archive).
    pub fn delete_history(&self) {
        if let Some(path) = &self.history_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedProvider;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_prompt_appends_history() {
        let provider = Arc::new(ScriptedProvider::always("the reply"));
        let mut session = AgentSession::new("test:lane", provider, None);

        let reply = session
            .prompt("first question", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, "the reply");
        assert_eq!(session.message_count(), 2);
        assert_eq!(session.history()[0].content, "first question");
        assert_eq!(session.history()[1].content, "the reply");
    }

    #[tokio::test]
    async fn test_failed_prompt_rolls_back() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err("maximum context".to_string()),
            Ok("ok now".to_string()),
        ]));
        let mut session = AgentSession::new("test:lane", provider, None);

        let err = session
            .prompt("question", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_context_overflow());
        // Rolled back: retrying does not double the user message.
        assert_eq!(session.message_count(), 0);

        session.prompt("question", Duration::from_secs(5)).await.unwrap();
        assert_eq!(session.message_count(), 2);
    }

    #[tokio::test]
    async fn test_truncate_keeps_first_two_last_eight() {
        let provider = Arc::new(ScriptedProvider::always("r"));
        let mut session = AgentSession::new("test:lane", provider, None);
        for i in 0..25 {
            session
                .prompt(&format!("message {i}"), Duration::from_secs(5))
                .await
                .unwrap();
        }
        assert_eq!(session.message_count(), 50);

        let removed = session.truncate_history();
        assert_eq!(removed, 40);
        assert_eq!(session.message_count(), 11); // 2 + placeholder + 8

        assert_eq!(session.history()[0].content, "message 0");
        assert!(session.history()[2].content.contains("40 earlier messages"));
        assert_eq!(session.history()[10].content, "r");
    }

    #[tokio::test]
    async fn test_truncate_noop_on_short_history() {
        let provider = Arc::new(ScriptedProvider::always("r"));
        let mut session = AgentSession::new("test:lane", provider, None);
        session.prompt("one", Duration::from_secs(5)).await.unwrap();
        assert_eq!(session.truncate_history(), 0);
        assert_eq!(session.message_count(), 2);
    }

    #[tokio::test]
    async fn test_history_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        let provider = Arc::new(ScriptedProvider::always("remembered"));

        {
            let mut session =
                AgentSession::new("test:lane", Arc::clone(&provider) as _, Some(path.clone()));
            session
                .prompt("store this", Duration::from_secs(5))
                .await
                .unwrap();
        }

        let reloaded = AgentSession::new("test:lane", provider, Some(path));
        assert_eq!(reloaded.message_count(), 2);
        assert_eq!(reloaded.history()[0].content, "store this");
    }

    #[tokio::test]
    async fn test_prompt_timeout() {
        struct SlowProvider;
        #[async_trait::async_trait]
        impl crate::llm::LlmProvider for SlowProvider {
            fn name(&self) -> &str {
                "slow"
            }
            async fn complete(
                &self,
                _request: crate::llm::CompletionRequest,
            ) -> Result<crate::llm::CompletionResponse, LlmError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!()
            }
        }

        let mut session = AgentSession::new("test:lane", Arc::new(SlowProvider), None);
        let err = session
            .prompt("hello", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
        assert_eq!(session.message_count(), 0);
    }
}
