//! Runtime configuration.
//!
//! Precedence: compiled defaults < `<home>/config.json` < `NXCLAW_*`
//! environment variables. The loaded `Config` is materialized once at
//! startup and passed by value; nothing reads the environment afterwards.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fsutil;

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_dashboard_host() -> String {
    "127.0.0.1".to_string()
}

fn default_dashboard_port() -> u16 {
    7171
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_dashboard_host")]
    pub host: String,
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
    /// Shared token required from non-loopback clients when set.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: default_dashboard_host(),
            port: default_dashboard_port(),
            token: None,
        }
    }
}

fn default_prompt_timeout_ms() -> u64 {
    180_000
}

fn default_max_prompt_retries() -> u32 {
    3
}

fn default_max_queue_depth() -> usize {
    24
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_task_retry_limit() -> u32 {
    2
}

fn default_task_retry_delay_ms() -> u64 {
    2_000
}

fn default_max_overflow_compaction_attempts() -> u32 {
    2
}

fn default_max_session_lanes() -> usize {
    32
}

fn default_max_session_idle_minutes() -> i64 {
    240
}

fn default_max_stored_tasks() -> usize {
    400
}

fn default_max_finished_tasks() -> usize {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_prompt_timeout_ms")]
    pub prompt_timeout_ms: u64,
    #[serde(default = "default_max_prompt_retries")]
    pub max_prompt_retries: u32,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_task_retry_limit")]
    pub task_retry_limit: u32,
    #[serde(default = "default_task_retry_delay_ms")]
    pub task_retry_delay_ms: u64,
    #[serde(default = "default_max_overflow_compaction_attempts")]
    pub max_overflow_compaction_attempts: u32,
    #[serde(default = "default_max_session_lanes")]
    pub max_session_lanes: usize,
    #[serde(default = "default_max_session_idle_minutes")]
    pub max_session_idle_minutes: i64,
    #[serde(default = "default_max_stored_tasks")]
    pub max_stored_tasks: usize,
    #[serde(default = "default_max_finished_tasks")]
    pub max_finished_tasks: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            prompt_timeout_ms: default_prompt_timeout_ms(),
            max_prompt_retries: default_max_prompt_retries(),
            max_queue_depth: default_max_queue_depth(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_retry_limit: default_task_retry_limit(),
            task_retry_delay_ms: default_task_retry_delay_ms(),
            max_overflow_compaction_attempts: default_max_overflow_compaction_attempts(),
            max_session_lanes: default_max_session_lanes(),
            max_session_idle_minutes: default_max_session_idle_minutes(),
            max_stored_tasks: default_max_stored_tasks(),
            max_finished_tasks: default_max_finished_tasks(),
        }
    }
}

fn default_autonomous_goal() -> String {
    "Review open objectives, tidy the workspace, and note anything that needs attention.".to_string()
}

fn default_autonomous_interval_ms() -> u64 {
    15 * 60 * 1000
}

fn default_skip_when_queue_above() -> usize {
    4
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_stale_pending_hours() -> i64 {
    7 * 24
}

fn default_stale_in_progress_idle_hours() -> i64 {
    48
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomousConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_autonomous_goal")]
    pub goal: String,
    #[serde(default = "default_autonomous_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_skip_when_queue_above")]
    pub skip_when_queue_above: usize,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_stale_pending_hours")]
    pub stale_pending_hours: i64,
    #[serde(default = "default_stale_in_progress_idle_hours")]
    pub stale_in_progress_idle_hours: i64,
}

impl Default for AutonomousConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            goal: default_autonomous_goal(),
            interval_ms: default_autonomous_interval_ms(),
            skip_when_queue_above: default_skip_when_queue_above(),
            max_consecutive_failures: default_max_consecutive_failures(),
            stale_pending_hours: default_stale_pending_hours(),
            stale_in_progress_idle_hours: default_stale_in_progress_idle_hours(),
        }
    }
}

fn default_vector_dims() -> usize {
    256
}

fn default_vector_batch_size() -> usize {
    16
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// "openai", "gemini", "local", or empty for auto-detection by key.
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_vector_dims")]
    pub dims: usize,
    #[serde(default = "default_vector_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: String::new(),
            model: String::new(),
            dims: default_vector_dims(),
            batch_size: default_vector_batch_size(),
            cache_enabled: true,
        }
    }
}

fn default_vector_weight() -> f32 {
    0.65
}

fn default_text_weight() -> f32 {
    0.35
}

fn default_min_score() -> f32 {
    0.12
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_text_weight")]
    pub text_weight: f32,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            text_weight: default_text_weight(),
            min_score: default_min_score(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryConfig {
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default = "default_true")]
    pub session_memory_enabled: bool,
    /// Extra markdown roots indexed alongside the workspace memory.
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
}

fn default_chrome_mode() -> String {
    "launch".to_string()
}

fn default_cdp_url() -> String {
    "http://127.0.0.1:9222".to_string()
}

fn default_cdp_connect_timeout_ms() -> u64 {
    4_000
}

fn default_max_browser_sessions() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChromeConfig {
    /// "launch" or "cdp".
    #[serde(default = "default_chrome_mode")]
    pub mode: String,
    #[serde(default = "default_cdp_url")]
    pub cdp_url: String,
    #[serde(default = "default_cdp_connect_timeout_ms")]
    pub cdp_connect_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub cdp_reuse_existing_page: bool,
    #[serde(default = "default_true")]
    pub cdp_fallback_to_launch: bool,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default)]
    pub executable_path: Option<PathBuf>,
    #[serde(default = "default_max_browser_sessions")]
    pub max_sessions: usize,
    #[serde(default)]
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for ChromeConfig {
    fn default() -> Self {
        Self {
            mode: default_chrome_mode(),
            cdp_url: default_cdp_url(),
            cdp_connect_timeout_ms: default_cdp_connect_timeout_ms(),
            cdp_reuse_existing_page: true,
            cdp_fallback_to_launch: true,
            headless: true,
            executable_path: None,
            max_sessions: default_max_browser_sessions(),
            screenshot_dir: None,
        }
    }
}

fn default_max_catalog_entries() -> usize {
    200
}

fn default_max_skill_file_bytes() -> u64 {
    256 * 1024
}

fn default_max_install_files() -> usize {
    64
}

fn default_max_install_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_install_timeout_ms() -> u64 {
    60_000
}

fn default_max_prompt_skills() -> usize {
    6
}

fn default_max_prompt_chars() -> usize {
    4_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_catalog_entries")]
    pub max_catalog_entries: usize,
    #[serde(default = "default_max_skill_file_bytes")]
    pub max_skill_file_bytes: u64,
    #[serde(default = "default_max_install_files")]
    pub max_install_files: usize,
    #[serde(default = "default_max_install_bytes")]
    pub max_install_bytes: u64,
    #[serde(default = "default_install_timeout_ms")]
    pub install_timeout_ms: u64,
    #[serde(default = "default_max_prompt_skills")]
    pub max_prompt_skills: usize,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_true")]
    pub auto_enable_on_install: bool,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_catalog_entries: default_max_catalog_entries(),
            max_skill_file_bytes: default_max_skill_file_bytes(),
            max_install_files: default_max_install_files(),
            max_install_bytes: default_max_install_bytes(),
            install_timeout_ms: default_install_timeout_ms(),
            max_prompt_skills: default_max_prompt_skills(),
            max_prompt_chars: default_max_prompt_chars(),
            auto_enable_on_install: true,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(skip)]
    pub home: PathBuf,
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub autonomous: AutonomousConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub chrome: ChromeConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
}

impl Config {
    /// Resolve the home directory: `NXCLAW_HOME`, else `~/.nxclaw`.
    pub fn resolve_home() -> PathBuf {
        if let Ok(home) = env::var("NXCLAW_HOME") {
            if !home.trim().is_empty() {
                return PathBuf::from(home);
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nxclaw")
    }

    /// Load from `<home>/config.json` (quarantining a corrupt file), then
    /// apply environment overrides.
    pub fn load(home: PathBuf) -> Self {
        let path = home.join("config.json");
        let mut config: Config = fsutil::read_json_or_quarantine(&path).unwrap_or_default();
        if config.default_provider.is_empty() {
            config.default_provider = default_provider();
        }
        config.home = home;
        config.apply_env_overrides();
        config
    }

    /// Persist to `<home>/config.json` atomically.
    pub fn save(&self) -> Result<(), fsutil::FsError> {
        fsutil::write_json_atomic(&self.home.join("config.json"), self)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("NXCLAW_PROVIDER") {
            if !v.trim().is_empty() {
                self.default_provider = v;
            }
        }
        if let Ok(v) = env::var("NXCLAW_MODEL") {
            if !v.trim().is_empty() {
                self.default_model = Some(v);
            }
        }
        if let Ok(v) = env::var("NXCLAW_DASHBOARD_HOST") {
            if !v.trim().is_empty() {
                self.dashboard.host = v;
            }
        }
        if let Ok(v) = env::var("NXCLAW_DASHBOARD_PORT") {
            if let Ok(port) = v.parse() {
                self.dashboard.port = port;
            }
        }
        if let Ok(v) = env::var("NXCLAW_DASHBOARD_TOKEN") {
            if !v.trim().is_empty() {
                self.dashboard.token = Some(v);
            }
        }
        if let Ok(v) = env::var("NXCLAW_AUTONOMOUS") {
            self.autonomous.enabled = matches!(v.as_str(), "1" | "true" | "on");
        }
        if let Ok(v) = env::var("NXCLAW_CHROME_MODE") {
            if v == "launch" || v == "cdp" {
                self.chrome.mode = v;
            }
        }
        if let Ok(v) = env::var("NXCLAW_CDP_URL") {
            if !v.trim().is_empty() {
                self.chrome.cdp_url = v;
            }
        }
    }

    // Directory layout helpers. Everything lives under `home`.

    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }

    pub fn agent_dir(&self) -> PathBuf {
        self.home.join("agent")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.home.join("memory")
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.home.join("workspace")
    }

    pub fn workspace_memory_dir(&self) -> PathBuf {
        self.workspace_dir().join("memory")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.home.join("skills")
    }

    pub fn chrome_shots_dir(&self) -> PathBuf {
        self.chrome
            .screenshot_dir
            .clone()
            .unwrap_or_else(|| self.home.join("chrome").join("shots"))
    }

    pub fn objectives_path(&self) -> PathBuf {
        self.state_dir().join("objectives.json")
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.state_dir().join("tasks.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir().join("events.jsonl")
    }

    pub fn dashboard_snapshot_path(&self) -> PathBuf {
        self.state_dir().join("dashboard.json")
    }

    pub fn memory_index_path(&self) -> PathBuf {
        self.state_dir().join("memory-index.json")
    }

    pub fn embedding_cache_path(&self) -> PathBuf {
        self.state_dir().join("embedding-cache.json")
    }

    pub fn skills_state_path(&self) -> PathBuf {
        self.state_dir().join("skills.json")
    }

    pub fn auth_path(&self) -> PathBuf {
        self.agent_dir().join("auth.json")
    }

    /// Create the on-disk layout (0700 dirs).
    pub fn ensure_layout(&self) -> Result<(), fsutil::FsError> {
        for dir in [
            self.home.clone(),
            self.state_dir(),
            self.agent_dir(),
            self.memory_dir(),
            self.workspace_dir(),
            self.workspace_memory_dir(),
            self.workspace_memory_dir().join("sessions"),
            self.workspace_memory_dir().join("soul-journal"),
            self.workspace_memory_dir().join("compact-md"),
            self.logs_dir(),
            self.skills_dir(),
            self.chrome_shots_dir(),
            self.home.join("docs"),
        ] {
            fsutil::ensure_dir(&dir)?;
        }
        Ok(())
    }
}

/// Validate a config patch scope name from the settings API.
pub fn is_patchable_scope(scope: &str) -> bool {
    matches!(
        scope,
        "default_provider" | "default_model" | "runtime" | "autonomous" | "memory" | "chrome"
    )
}
