//! Background task supervision: shell children with bounded concurrency,
//! a timed retry queue, recurring schedules, and crash-resilient state.

mod manager;

pub use manager::{TaskLimits, TaskManager};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for task operations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("command must not be empty")]
    MissingCommand,

    #[error("schedule interval must be at least 1000 ms (got {0})")]
    BadInterval(u64),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] crate::fsutil::FsError),
}

/// Command task or recurring schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Command,
    Schedule,
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Stopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Stopped => "stopped",
        }
    }
}

/// Maximum lines kept in the in-memory tail buffer.
pub const TAIL_LIMIT: usize = 120;

/// One supervised task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub kind: TaskKind,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<std::path::PathBuf>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Schedules only.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    /// Set on children launched by a schedule tick.
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub log_path: Option<std::path::PathBuf>,
    /// Most recent output lines, bounded by `TAIL_LIMIT`.
    #[serde(default)]
    pub tail: Vec<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub background: bool,
}

/// Parameters for `run_command`.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub name: Option<String>,
    pub command: String,
    pub cwd: Option<std::path::PathBuf>,
    /// 0 disables the timeout.
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub background: bool,
    /// Return an already-running identical task instead of starting another.
    pub dedupe_running: bool,
    /// Always queue instead of launching straight into a free slot.
    pub force_queue: bool,
    pub parent_task_id: Option<String>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            name: None,
            command: String::new(),
            cwd: None,
            timeout_ms: 0,
            max_retries: 0,
            retry_delay_ms: 2_000,
            background: true,
            dedupe_running: false,
            force_queue: false,
            parent_task_id: None,
        }
    }
}

impl RunRequest {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

/// Summary counters for pressure checks.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHealth {
    pub total: usize,
    pub queue_depth: usize,
    pub running: usize,
    pub max_concurrent: usize,
    /// Failures recorded in the last 15 minutes.
    pub failed_recent: usize,
    pub schedules: usize,
}

/// Preview of a queued task awaiting a slot or retry.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedPreview {
    pub task_id: String,
    pub name: String,
    pub command: String,
    pub retry_at: DateTime<Utc>,
    pub attempts: u32,
}
