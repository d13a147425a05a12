//! The runtime orchestrator.
//!
//! Routes every request — chat channels, dashboard, autonomous ticks —
//! through the per-conversation lane queue into an agent session, with
//! context-overflow recovery, memory bookkeeping, and state aggregation.

pub mod autonomous;
pub mod prompt;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::agent::SessionRegistry;
use crate::channels::{ChannelHealth, IncomingRequest};
use crate::chrome::ChromeController;
use crate::config::Config;
use crate::events::EventBus;
use crate::fsutil;
use crate::lanes::LaneQueue;
use crate::llm::{self, AuthSnapshot, LlmProvider};
use crate::memory::store::is_important;
use crate::memory::{MemoryStore, MemoryWatcher, SearchMode, SearchOptions};
use crate::objectives::{ObjectiveQueue, ObjectiveStatus};
use crate::skills::SkillManager;
use crate::tasks::{TaskLimits, TaskManager};
use crate::tools::{
    chrome_tools, memory_tools, objective_tools, task_tools, ToolRegistry,
};

use prompt::{compose, lane_key, sanitize_identifier, CoreContextCompiler, PromptParts};

/// Canonical reply when no LLM credential family is usable.
pub const AUTH_REQUIRED_MESSAGE: &str = "Authentication required: no LLM provider is \
    configured. Run `nxclaw auth`, or set ANTHROPIC_API_KEY, OPENAI_API_KEY, or \
    GEMINI_API_KEY and restart.";

/// Error type for runtime construction.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Memory(#[from] crate::memory::MemoryError),

    #[error(transparent)]
    Storage(#[from] fsutil::FsError),
}

/// The orchestrator: explicit root object owning every subsystem.
pub struct Runtime {
    config: StdMutex<Config>,
    pub bus: Arc<EventBus>,
    lanes: LaneQueue,
    registry: SessionRegistry,
    pub memory: Arc<MemoryStore>,
    pub tasks: TaskManager,
    pub chrome: Arc<ChromeController>,
    pub objectives: Arc<Mutex<ObjectiveQueue>>,
    pub skills: Arc<SkillManager>,
    tools: ToolRegistry,
    core_compiler: CoreContextCompiler,
    injected_provider: Option<Arc<dyn LlmProvider>>,
    provider_cache: Mutex<Option<(String, Arc<dyn LlmProvider>)>>,
    active_lanes: StdMutex<HashSet<String>>,
    channel_health: StdMutex<HashMap<String, ChannelHealth>>,
    watcher: StdMutex<Option<MemoryWatcher>>,
}

impl Runtime {
    /// Build the runtime from config, creating the directory layout and
    /// loading all durable state.
    pub fn new(config: Config) -> Result<Arc<Self>, RuntimeError> {
        Self::build(config, None)
    }

    /// Build with a fixed provider (tests, `--once` dry runs). Skips the
    /// auth gate.
    pub fn with_provider(
        config: Config,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Arc<Self>, RuntimeError> {
        Self::build(config, Some(provider))
    }

    fn build(
        config: Config,
        injected_provider: Option<Arc<dyn LlmProvider>>,
    ) -> Result<Arc<Self>, RuntimeError> {
        config.ensure_layout()?;

        let bus = EventBus::new(config.events_path(), 512, 8 * 1024 * 1024);
        let memory = Arc::new(MemoryStore::new(&config)?);
        let tasks = TaskManager::new(
            config.tasks_path(),
            config.logs_dir(),
            TaskLimits {
                max_concurrent: config.runtime.max_concurrent_tasks,
                max_finished: config.runtime.max_finished_tasks,
                default_max_retries: config.runtime.task_retry_limit,
                default_retry_delay_ms: config.runtime.task_retry_delay_ms,
            },
            Arc::clone(&bus),
        );
        let chrome = Arc::new(ChromeController::new(
            config.chrome.clone(),
            config.chrome_shots_dir(),
            config.home.join("chrome").join("profile"),
        ));
        let objectives = Arc::new(Mutex::new(ObjectiveQueue::load(config.objectives_path())));
        let skills = Arc::new(SkillManager::new(
            config.skills_dir(),
            config.skills_state_path(),
            config.skills.clone(),
        ));

        let mut tools = ToolRegistry::new(true);
        tools.register(Arc::new(task_tools::TaskRunTool::new(tasks.clone())));
        tools.register(Arc::new(task_tools::TaskScheduleTool::new(tasks.clone())));
        tools.register(Arc::new(task_tools::TaskStopTool::new(tasks.clone())));
        tools.register(Arc::new(task_tools::TaskTailTool::new(tasks.clone())));
        tools.register(Arc::new(task_tools::TaskListTool::new(tasks.clone())));
        tools.register(Arc::new(memory_tools::MemoryNoteTool::new(Arc::clone(&memory))));
        tools.register(Arc::new(memory_tools::MemorySearchTool::new(Arc::clone(&memory))));
        tools.register(Arc::new(memory_tools::MemoryRecentTool::new(Arc::clone(&memory))));
        tools.register(Arc::new(memory_tools::MemoryCompactTool::new(Arc::clone(&memory))));
        tools.register(Arc::new(memory_tools::SoulWriteTool::new(Arc::clone(&memory))));
        tools.register(Arc::new(chrome_tools::ChromeOpenTool::new(Arc::clone(&chrome))));
        tools.register(Arc::new(chrome_tools::ChromeSnapshotTool::new(Arc::clone(&chrome))));
        tools.register(Arc::new(chrome_tools::ChromeClickTool::new(Arc::clone(&chrome))));
        tools.register(Arc::new(chrome_tools::ChromeTypeTool::new(Arc::clone(&chrome))));
        tools.register(Arc::new(chrome_tools::ChromeEvaluateTool::new(Arc::clone(&chrome))));
        tools.register(Arc::new(chrome_tools::ChromeScreenshotTool::new(Arc::clone(&chrome))));
        tools.register(Arc::new(chrome_tools::ChromeCloseTool::new(Arc::clone(&chrome))));
        tools.register(Arc::new(objective_tools::ObjectiveAddTool::new(Arc::clone(&objectives))));
        tools.register(Arc::new(objective_tools::ObjectiveListTool::new(Arc::clone(&objectives))));
        tools.register(Arc::new(objective_tools::ObjectiveUpdateTool::new(Arc::clone(&objectives))));

        let registry = SessionRegistry::new(
            config.state_dir().join("lane-sessions"),
            config.runtime.max_session_lanes,
            config.runtime.max_session_idle_minutes,
        );
        let lanes = LaneQueue::new(config.runtime.max_queue_depth, Arc::clone(&bus));

        Ok(Arc::new(Self {
            lanes,
            registry,
            memory,
            tasks,
            chrome,
            objectives,
            skills,
            tools,
            core_compiler: CoreContextCompiler::new(),
            injected_provider,
            provider_cache: Mutex::new(None),
            active_lanes: StdMutex::new(HashSet::new()),
            channel_health: StdMutex::new(HashMap::new()),
            watcher: StdMutex::new(None),
            bus,
            config: StdMutex::new(config),
        }))
    }

    /// Start background machinery: task recovery and the memory watcher.
    pub async fn start(&self) {
        self.tasks.start().await;
        let watcher = MemoryWatcher::spawn(Arc::clone(&self.memory));
        *self.watcher.lock().expect("watcher slot") = Some(watcher);
        self.bus.emit("runtime_started", serde_json::json!({}));
    }

    /// Current config (cloned).
    pub fn config(&self) -> Config {
        self.config.lock().expect("config lock").clone()
    }

    /// Apply and persist a config mutation (dashboard settings patch).
    pub fn update_config(&self, apply: impl FnOnce(&mut Config)) -> Result<Config, RuntimeError> {
        let mut config = self.config.lock().expect("config lock");
        apply(&mut config);
        config.save()?;
        Ok(config.clone())
    }

    async fn resolve_provider(&self) -> Result<Arc<dyn LlmProvider>, llm::LlmError> {
        if let Some(provider) = &self.injected_provider {
            return Ok(Arc::clone(provider));
        }
        let (auth_path, preferred, model) = {
            let config = self.config.lock().expect("config lock");
            (
                config.auth_path(),
                config.default_provider.clone(),
                config.default_model.clone(),
            )
        };
        let snapshot = AuthSnapshot::refresh(&auth_path);
        if !snapshot.any_authenticated() {
            return Err(llm::LlmError::NoProvider);
        }
        let family = snapshot.select(&preferred).ok_or(llm::LlmError::NoProvider)?;

        let mut cache = self.provider_cache.lock().await;
        if let Some((cached_family, provider)) = cache.as_ref() {
            if *cached_family == family {
                return Ok(Arc::clone(provider));
            }
        }
        let provider = llm::create_provider(&family, model.as_deref())?;
        *cache = Some((family.clone(), Arc::clone(&provider)));
        tracing::info!("using LLM provider family {}", family);
        Ok(provider)
    }

    /// Global pending+active depth across all lanes.
    pub fn queue_depth(&self) -> usize {
        self.lanes.total_depth()
    }

    /// Handle one request end-to-end and return the reply text. Failures
    /// come back as a `"Runtime error: …"` string, never a panic.
    pub async fn handle_incoming(&self, request: &IncomingRequest, text: &str) -> String {
        let provider = match self.resolve_provider().await {
            Ok(provider) => provider,
            Err(_) => return AUTH_REQUIRED_MESSAGE.to_string(),
        };

        let source = sanitize_identifier(&request.source);
        let channel_id = sanitize_identifier(&request.channel_id);
        let lane = lane_key(&request.source, &request.channel_id, request.session_id.as_deref());

        let (depth, max_depth) = (
            self.lanes.total_depth(),
            self.config.lock().expect("config lock").runtime.max_queue_depth,
        );
        if depth >= max_depth {
            return format!("Runtime error: queue overflow: depth {depth} at limit {max_depth}");
        }

        self.active_lanes.lock().expect("active lanes").insert(lane.clone());
        let result = self
            .lanes
            .enqueue(&lane, async {
                self.run_turn(
                    provider,
                    &lane,
                    &source,
                    &channel_id,
                    request.session_id.as_deref(),
                    text,
                )
                .await
            })
            .await;
        self.active_lanes.lock().expect("active lanes").remove(&lane);

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(detail)) => format!("Runtime error: {detail}"),
            Err(e) => format!("Runtime error: {e}"),
        }
    }

    async fn run_turn(
        &self,
        provider: Arc<dyn LlmProvider>,
        lane: &str,
        source: &str,
        channel_id: &str,
        session_id: Option<&str>,
        text: &str,
    ) -> Result<String, String> {
        let config = self.config();
        let active = self.active_lanes.lock().expect("active lanes").clone();
        let session = self
            .registry
            .acquire(lane, source, channel_id, session_id, provider, &active)
            .await;

        if let Err(e) = self
            .memory
            .record_conversation("user", text, source, vec![], Some(lane))
            .await
        {
            tracing::warn!("user turn not recorded: {}", e);
        }

        let hits = self
            .memory
            .search(
                text,
                5,
                SearchOptions {
                    session_key: Some(lane.to_string()),
                    mode: SearchMode::SessionStrict,
                },
            )
            .await
            .unwrap_or_default();
        let memory_matches: Vec<String> = hits
            .iter()
            .map(|h| {
                let mut line = h.text.replace('\n', " ");
                line.truncate(200);
                line
            })
            .collect();

        let objectives_block = {
            let queue = self.objectives.lock().await;
            let mut block = String::new();
            for objective in queue
                .list(None)
                .into_iter()
                .filter(|o| {
                    matches!(o.status, ObjectiveStatus::Pending | ObjectiveStatus::InProgress)
                })
                .take(5)
            {
                block.push_str(&format!(
                    "- [p{}] {} ({})\n",
                    objective.priority,
                    objective.title,
                    objective.status.as_str()
                ));
            }
            block
        };

        let tasks_block = {
            let mut block = String::new();
            for task in self.tasks.list(false).await.into_iter().take(6) {
                block.push_str(&format!("- {} [{}] {}\n", task.name, task.status.as_str(), task.id));
            }
            block
        };

        let core_context = self
            .core_compiler
            .compile(&config.workspace_dir(), &self.tools.names());
        let soul_summary = {
            let mut soul = self.memory.read_soul().unwrap_or_default();
            soul.truncate(600);
            soul
        };
        let working_memory = self.memory.working_memory_context().unwrap_or_default();
        let skill_previews = self.skills.prompt_previews();

        let turn_prompt = compose(&PromptParts {
            source,
            channel_id,
            session_id,
            queue_depth: self.lanes.total_depth(),
            core_context: &core_context,
            objectives_block: &objectives_block,
            tasks_block: &tasks_block,
            memory_matches: &memory_matches,
            soul_summary: &soul_summary,
            working_memory: &working_memory,
            skill_previews: &skill_previews,
            user_text: text,
        });

        // Prompt with overflow recovery: first overflow compacts memory,
        // the next truncates session history; attempts are bounded overall.
        let timeout = Duration::from_millis(config.runtime.prompt_timeout_ms.max(1_000));
        let max_attempts = config.runtime.max_prompt_retries.max(1);
        let mut overflow_recoveries = 0u32;
        let mut compacted = false;
        let mut attempts = 0u32;

        let reply = loop {
            attempts += 1;
            let outcome = {
                let mut session = session.lock().await;
                session.prompt(&turn_prompt, timeout).await
            };
            match outcome {
                Ok(reply) => break reply,
                Err(e) => {
                    let overflow = e.is_context_overflow();
                    tracing::warn!(
                        "prompt attempt {}/{} failed (overflow={}): {}",
                        attempts,
                        max_attempts,
                        overflow,
                        e
                    );
                    if attempts >= max_attempts {
                        return Err(format!("prompt failed after {attempts} attempts: {e}"));
                    }
                    if overflow
                        && overflow_recoveries < config.runtime.max_overflow_compaction_attempts
                    {
                        overflow_recoveries += 1;
                        if !compacted {
                            compacted = true;
                            if let Err(e) = self.memory.compact_now("context overflow").await {
                                tracing::warn!("overflow compaction failed: {}", e);
                            }
                        } else {
                            let removed = session.lock().await.truncate_history();
                            tracing::info!("truncated {} history messages after overflow", removed);
                        }
                    }
                }
            }
        };

        if let Err(e) = self
            .memory
            .record_conversation("assistant", &reply, source, vec![], Some(lane))
            .await
        {
            tracing::warn!("assistant turn not recorded: {}", e);
        }
        if is_important(&reply) {
            let mut excerpt = reply.clone();
            excerpt.truncate(400);
            let _ = self.memory.append_soul_journal(&excerpt);
        }
        if let Err(e) = self.memory.compact_if_needed().await {
            tracing::warn!("threshold compaction failed: {}", e);
        }

        let message_count = session.lock().await.message_count();
        self.registry.touch(lane, message_count).await;
        let active = self.active_lanes.lock().expect("active lanes").clone();
        self.registry.enforce_limits(&active).await;

        self.persist_dashboard_snapshot().await;
        self.bus.emit(
            "turn_complete",
            serde_json::json!({ "lane": lane, "attempts": attempts, "chars": reply.len() }),
        );
        Ok(reply)
    }

    // ==================== Auxiliary operations ====================

    /// Aggregate state for the dashboard and CLI.
    pub async fn state_snapshot(&self) -> serde_json::Value {
        let config = self.config();
        let provider_name = match &self.injected_provider {
            Some(provider) => provider.name().to_string(),
            None => AuthSnapshot::refresh(&config.auth_path())
                .select(&config.default_provider)
                .unwrap_or_else(|| "unauthenticated".to_string()),
        };
        let health: HashMap<String, ChannelHealth> =
            self.channel_health.lock().expect("channel health").clone();

        serde_json::json!({
            "provider": provider_name,
            "queue_depth": self.lanes.total_depth(),
            "lanes": self.lanes.snapshot(),
            "sessions": self.registry.list().await,
            "tasks": {
                "health": self.tasks.health().await,
                "recent": self.tasks.list(true).await.into_iter().take(12).collect::<Vec<_>>(),
            },
            "memory": self.memory.stats().await,
            "chrome": self.chrome.state().await,
            "objectives": self.objectives.lock().await.stats(),
            "channels": health,
        })
    }

    async fn persist_dashboard_snapshot(&self) {
        let path = self.config().dashboard_snapshot_path();
        let snapshot = self.state_snapshot().await;
        if let Err(e) = fsutil::write_json_atomic(&path, &snapshot) {
            tracing::warn!("dashboard snapshot persist failed: {}", e);
        }
    }

    pub async fn list_conversation_sessions(&self) -> Vec<crate::agent::LaneInfo> {
        self.registry.list().await
    }

    /// Create (or revive) a conversation session for a lane.
    pub async fn create_conversation_session(
        &self,
        source: &str,
        channel_id: &str,
        session_id: Option<&str>,
    ) -> Result<crate::agent::LaneInfo, String> {
        let provider = self
            .resolve_provider()
            .await
            .map_err(|e| e.to_string())?;
        let lane = lane_key(source, channel_id, session_id);
        let active = self.active_lanes.lock().expect("active lanes").clone();
        self.registry
            .acquire(
                &lane,
                &sanitize_identifier(source),
                &sanitize_identifier(channel_id),
                session_id,
                provider,
                &active,
            )
            .await;
        self.registry
            .list()
            .await
            .into_iter()
            .find(|info| info.lane_key == lane)
            .ok_or_else(|| "session vanished after creation".to_string())
    }

    /// Archive a conversation session. Refuses lanes that are executing.
    pub async fn archive_conversation_session(&self, lane: &str) -> Result<bool, String> {
        if self.active_lanes.lock().expect("active lanes").contains(lane) {
            return Err(format!("lane {lane} is currently executing"));
        }
        Ok(self.registry.archive(lane).await)
    }

    pub fn set_channel_health(&self, channel: &str, health: ChannelHealth) {
        self.channel_health
            .lock()
            .expect("channel health")
            .insert(channel.to_string(), health);
    }

    /// Graceful stop: terminate children, close the browser, stop the
    /// watcher, flush events, persist a final snapshot.
    pub async fn shutdown(&self) {
        tracing::info!("runtime shutting down");
        self.tasks.shutdown().await;
        self.chrome.close_all().await;
        if let Some(watcher) = self.watcher.lock().expect("watcher slot").take() {
            watcher.stop();
        }
        self.persist_dashboard_snapshot().await;
        self.bus.emit("runtime_stopped", serde_json::json!({}));
        self.bus.flush_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedProvider;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::load(dir.to_path_buf());
        config.memory.vector.provider = "local".to_string();
        config.memory.vector.dims = 32;
        config.runtime.prompt_timeout_ms = 5_000;
        config
    }

    async fn runtime_with(
        dir: &std::path::Path,
        provider: ScriptedProvider,
    ) -> (Arc<Runtime>, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let runtime = Runtime::with_provider(test_config(dir), Arc::clone(&provider) as _).unwrap();
        runtime.start().await;
        (runtime, provider)
    }

    fn request() -> IncomingRequest {
        IncomingRequest::new("test", "chan", "user-1")
    }

    #[tokio::test]
    async fn test_happy_path_reply_and_memory() {
        let dir = tempdir().unwrap();
        let (runtime, provider) = runtime_with(dir.path(), ScriptedProvider::always("hello back")).await;

        let reply = runtime.handle_incoming(&request(), "hello runtime").await;
        assert_eq!(reply, "hello back");
        assert_eq!(provider.call_count(), 1);

        // Both turns recorded.
        let recent = runtime.memory.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].actor, "user");
        assert_eq!(recent[1].actor, "assistant");
        assert_eq!(recent[0].session_key.as_deref(), Some("test:chan"));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_prompt_carries_context_sections() {
        let dir = tempdir().unwrap();
        let (runtime, provider) = runtime_with(dir.path(), ScriptedProvider::always("ok")).await;

        std::fs::write(
            runtime.config().workspace_dir().join("IDENTITY.md"),
            "# Identity\nThe resident runtime.\n",
        )
        .unwrap();
        runtime
            .objectives
            .lock()
            .await
            .add("ship the release", "", 1, "test")
            .unwrap();

        runtime.handle_incoming(&request(), "what should I do").await;

        let seen = provider.seen.lock().unwrap();
        let prompt = seen.last().unwrap();
        assert!(prompt.contains("source=test"));
        assert!(prompt.contains("The resident runtime."));
        assert!(prompt.contains("ship the release"));
        assert!(prompt.contains("nx_task_run"));
        assert!(prompt.ends_with("what should I do"));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_runtime_error_after_retries() {
        let dir = tempdir().unwrap();
        let (runtime, provider) =
            runtime_with(dir.path(), ScriptedProvider::new(vec![Err("boom".to_string())])).await;

        let reply = runtime.handle_incoming(&request(), "hi").await;
        assert!(reply.starts_with("Runtime error:"), "got: {reply}");
        assert!(reply.contains("boom"));
        // Default max_prompt_retries = 3 attempts total.
        assert_eq!(provider.call_count(), 3);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_overflow_recovery_compacts_then_truncates() {
        let dir = tempdir().unwrap();
        let (runtime, provider) = runtime_with(
            dir.path(),
            ScriptedProvider::new(vec![
                Err("maximum context length exceeded".to_string()),
                Err("maximum context length exceeded".to_string()),
                Ok("recovered".to_string()),
            ]),
        )
        .await;

        // Seed enough raw history that compaction has something to move.
        for i in 0..130 {
            runtime
                .memory
                .record_conversation("user", &format!("filler {i}"), "seed", vec![], None)
                .await
                .unwrap();
        }

        let reply = runtime.handle_incoming(&request(), "long question").await;
        assert_eq!(reply, "recovered");
        assert_eq!(provider.call_count(), 3);
        // First overflow compacted the raw log (130 + 1 user turn - batch).
        assert!(runtime.memory.raw_count().await < 131);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_overflow_reply() {
        struct SlowProvider;
        #[async_trait::async_trait]
        impl crate::llm::LlmProvider for SlowProvider {
            fn name(&self) -> &str {
                "slow"
            }
            async fn complete(
                &self,
                _request: crate::llm::CompletionRequest,
            ) -> Result<crate::llm::CompletionResponse, crate::llm::LlmError> {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(crate::llm::CompletionResponse {
                    content: "slow".to_string(),
                    model: "slow".to_string(),
                })
            }
        }

        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.runtime.max_queue_depth = 1;
        let runtime = Runtime::with_provider(config, Arc::new(SlowProvider)).unwrap();
        runtime.start().await;

        // Saturate the queue with a turn that sits in the slow prompt call.
        let blocker_runtime = Arc::clone(&runtime);
        let blocker = tokio::spawn(async move {
            blocker_runtime
                .handle_incoming(&IncomingRequest::new("test", "other", "u"), "block")
                .await
        });
        // Wait until the blocker occupies the slot.
        while runtime.queue_depth() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let reply = runtime.handle_incoming(&request(), "rejected").await;
        assert!(reply.contains("queue overflow"), "got: {reply}");
        assert!(reply.contains("depth 1"));

        assert_eq!(blocker.await.unwrap(), "slow");
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_sessions_lifecycle() {
        let dir = tempdir().unwrap();
        let (runtime, _provider) = runtime_with(dir.path(), ScriptedProvider::always("ok")).await;

        runtime.handle_incoming(&request(), "start a conversation").await;
        let sessions = runtime.list_conversation_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].lane_key, "test:chan");
        assert_eq!(sessions[0].message_count, 2);

        assert!(runtime
            .archive_conversation_session("test:chan")
            .await
            .unwrap());
        assert!(runtime.list_conversation_sessions().await.is_empty());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_state_snapshot_shape() {
        let dir = tempdir().unwrap();
        let (runtime, _provider) = runtime_with(dir.path(), ScriptedProvider::always("ok")).await;
        runtime.set_channel_health("slack", ChannelHealth::unhealthy("socket closed"));

        let state = runtime.state_snapshot().await;
        assert_eq!(state["provider"], "scripted");
        assert!(state["memory"]["raw_entries"].is_number());
        assert!(state["tasks"]["health"]["max_concurrent"].is_number());
        assert_eq!(state["channels"]["slack"]["healthy"], false);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_important_reply_hits_soul_journal() {
        let dir = tempdir().unwrap();
        let (runtime, _provider) = runtime_with(
            dir.path(),
            ScriptedProvider::always("I will remember this milestone forever"),
        )
        .await;

        runtime.handle_incoming(&request(), "we shipped v1 today").await;

        let journal_dir = runtime.config().workspace_memory_dir().join("soul-journal");
        let entries: Vec<_> = std::fs::read_dir(journal_dir).unwrap().flatten().collect();
        assert_eq!(entries.len(), 1);
        let text = std::fs::read_to_string(entries[0].path()).unwrap();
        assert!(text.contains("milestone"));

        runtime.shutdown().await;
    }
}
