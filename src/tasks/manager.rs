//! The task manager: process supervision with bounded concurrency, a timed
//! retry queue, recurring schedules, per-task log tailing, and debounced
//! crash-resilient persistence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::events::EventBus;
use crate::fsutil;
use crate::tasks::{
    QueuedPreview, RunRequest, Task, TaskError, TaskHealth, TaskKind, TaskStatus, TAIL_LIMIT,
};

/// Floor on retry delays.
const MIN_RETRY_DELAY_MS: u64 = 250;
/// Ceiling on retry delays (one hour).
const MAX_RETRY_DELAY_MS: u64 = 3_600_000;
/// Ceiling on retry counts.
const MAX_RETRIES_CAP: u32 = 20;
/// Debounce for state persistence.
const PERSIST_DEBOUNCE: Duration = Duration::from_millis(300);
/// Window for the `failed_recent` health counter.
const FAILED_RECENT_MINUTES: i64 = 15;

/// Concurrency and retention limits.
#[derive(Debug, Clone)]
pub struct TaskLimits {
    pub max_concurrent: usize,
    pub max_finished: usize,
    pub default_max_retries: u32,
    pub default_retry_delay_ms: u64,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_finished: 120,
            default_max_retries: 2,
            default_retry_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone)]
struct QueueItem {
    task_id: String,
    retry_at: DateTime<Utc>,
}

struct RunningHandle {
    kill_tx: mpsc::Sender<()>,
}

struct LaunchPlan {
    task_id: String,
    command: String,
    cwd: Option<PathBuf>,
    timeout_ms: u64,
    log_path: PathBuf,
}

#[derive(Default)]
struct State {
    tasks: HashMap<String, Task>,
    queue: Vec<QueueItem>,
    running: HashMap<String, RunningHandle>,
    schedules: HashMap<String, JoinHandle<()>>,
    waiters: HashMap<String, Vec<oneshot::Sender<Task>>>,
    wakeup: Option<JoinHandle<()>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedTasks {
    tasks: Vec<Task>,
}

struct Inner {
    state_path: PathBuf,
    logs_dir: PathBuf,
    limits: TaskLimits,
    bus: Arc<EventBus>,
    state: Mutex<State>,
    /// Chains writes so a later persist never races an earlier one.
    persist_lock: Mutex<()>,
    persist_scheduled: AtomicBool,
    dispatch_active: AtomicBool,
    shutting_down: AtomicBool,
}

/// Supervises at most `max_concurrent` shell children.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    /// Load persisted state. Previously running or queued commands are
    /// re-queued; schedules keep their running sentinel until `start()`
    /// reinstalls the timers.
    pub fn new(
        state_path: PathBuf,
        logs_dir: PathBuf,
        limits: TaskLimits,
        bus: Arc<EventBus>,
    ) -> Self {
        let persisted: PersistedTasks =
            fsutil::read_json_or_quarantine(&state_path).unwrap_or_default();

        let mut state = State::default();
        let now = Utc::now();
        for mut task in persisted.tasks {
            match task.kind {
                TaskKind::Schedule => {
                    if task.status != TaskStatus::Cancelled {
                        task.status = TaskStatus::Running;
                    }
                }
                TaskKind::Command => {
                    if matches!(task.status, TaskStatus::Running | TaskStatus::Queued) {
                        task.status = TaskStatus::Queued;
                        task.updated_at = now;
                        task.pid = None;
                        state.queue.push(QueueItem {
                            task_id: task.id.clone(),
                            retry_at: now,
                        });
                    }
                }
            }
            state.tasks.insert(task.id.clone(), task);
        }

        Self {
            inner: Arc::new(Inner {
                state_path,
                logs_dir,
                limits,
                bus,
                state: Mutex::new(state),
                persist_lock: Mutex::new(()),
                persist_scheduled: AtomicBool::new(false),
                dispatch_active: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Reinstall schedule timers and dispatch anything recovered into the
    /// queue. Call once after construction, inside the runtime.
    pub async fn start(&self) {
        let schedules: Vec<(String, String, Option<PathBuf>, u64)> = {
            let state = self.inner.state.lock().await;
            state
                .tasks
                .values()
                .filter(|t| t.kind == TaskKind::Schedule && t.status == TaskStatus::Running)
                .map(|t| {
                    (
                        t.id.clone(),
                        t.command.clone(),
                        t.cwd.clone(),
                        t.interval_ms.unwrap_or(60_000),
                    )
                })
                .collect()
        };
        for (id, command, cwd, interval_ms) in schedules {
            self.install_schedule_timer(id, command, cwd, interval_ms).await;
        }
        dispatch(&self.inner).await;
    }

    // ==================== Public operations ====================

    /// Run a shell command. When `background` is false this awaits the
    /// final state of the task (including retries).
    pub async fn run_command(&self, req: RunRequest) -> Result<Task, TaskError> {
        if req.command.trim().is_empty() {
            return Err(TaskError::MissingCommand);
        }
        let max_retries = req.max_retries.min(MAX_RETRIES_CAP);
        let retry_delay_ms = req
            .retry_delay_ms
            .clamp(MIN_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS);

        let now = Utc::now();
        let (task, waiter) = {
            let mut state = self.inner.state.lock().await;

            if req.dedupe_running {
                let existing = state.tasks.values().find(|t| {
                    t.kind == TaskKind::Command
                        && t.command == req.command
                        && t.cwd == req.cwd
                        && matches!(t.status, TaskStatus::Running | TaskStatus::Queued)
                });
                if let Some(existing) = existing {
                    tracing::debug!("deduped command onto running task {}", existing.id);
                    return Ok(existing.clone());
                }
            }

            let id = Uuid::new_v4().to_string();
            let task = Task {
                id: id.clone(),
                name: req
                    .name
                    .clone()
                    .unwrap_or_else(|| summarize_command(&req.command)),
                kind: TaskKind::Command,
                command: req.command.clone(),
                cwd: req.cwd.clone(),
                status: TaskStatus::Queued,
                created_at: now,
                updated_at: now,
                last_run_at: None,
                next_run_at: Some(now),
                interval_ms: None,
                parent_task_id: req.parent_task_id.clone(),
                exit_code: None,
                pid: None,
                error: None,
                log_path: Some(self.inner.logs_dir.join(format!("{id}.log"))),
                tail: Vec::new(),
                attempts: 0,
                max_retries,
                retry_delay_ms,
                timeout_ms: req.timeout_ms,
                background: req.background,
            };
            state.tasks.insert(id.clone(), task.clone());
            state.queue.push(QueueItem {
                task_id: id.clone(),
                retry_at: now,
            });

            self.inner.bus.emit(
                "task_created",
                serde_json::json!({ "id": id, "name": task.name, "command": task.command }),
            );

            let waiter = if req.background {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.entry(id).or_default().push(tx);
                Some(rx)
            };
            (task, waiter)
        };

        persist_soon(&self.inner);
        dispatch(&self.inner).await;

        match waiter {
            None => Ok(task),
            Some(rx) => Ok(rx.await.unwrap_or(task)),
        }
    }

    /// Queue a command without waiting: background, never launched inline.
    pub async fn enqueue_command(&self, mut req: RunRequest) -> Result<Task, TaskError> {
        req.background = true;
        req.force_queue = true;
        self.run_command(req).await
    }

    /// Install a recurring schedule. The schedule task itself stays in a
    /// `running` sentinel status; each tick launches a child command task.
    pub async fn schedule_command(
        &self,
        name: &str,
        command: &str,
        interval_ms: u64,
        cwd: Option<PathBuf>,
    ) -> Result<Task, TaskError> {
        if command.trim().is_empty() {
            return Err(TaskError::MissingCommand);
        }
        if interval_ms < 1000 {
            return Err(TaskError::BadInterval(interval_ms));
        }

        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let task = Task {
            id: id.clone(),
            name: name.to_string(),
            kind: TaskKind::Schedule,
            command: command.to_string(),
            cwd: cwd.clone(),
            status: TaskStatus::Running,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: Some(now + chrono::Duration::milliseconds(interval_ms as i64)),
            interval_ms: Some(interval_ms),
            parent_task_id: None,
            exit_code: None,
            pid: None,
            error: None,
            log_path: None,
            tail: Vec::new(),
            attempts: 0,
            max_retries: 0,
            retry_delay_ms: self.inner.limits.default_retry_delay_ms,
            timeout_ms: 0,
            background: true,
        };

        {
            let mut state = self.inner.state.lock().await;
            state.tasks.insert(id.clone(), task.clone());
        }
        self.inner.bus.emit(
            "task_created",
            serde_json::json!({ "id": id, "name": name, "schedule": true, "interval_ms": interval_ms }),
        );
        persist_soon(&self.inner);
        self.install_schedule_timer(id, command.to_string(), cwd, interval_ms)
            .await;
        Ok(task)
    }

    async fn install_schedule_timer(
        &self,
        id: String,
        command: String,
        cwd: Option<PathBuf>,
        interval_ms: u64,
    ) {
        let inner = Arc::clone(&self.inner);
        let manager = self.clone();
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            let period = Duration::from_millis(interval_ms.max(1000));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                if inner.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                let now = Utc::now();
                {
                    let mut state = inner.state.lock().await;
                    match state.tasks.get_mut(&timer_id) {
                        Some(task) if task.status == TaskStatus::Running => {
                            task.last_run_at = Some(now);
                            task.next_run_at =
                                Some(now + chrono::Duration::milliseconds(interval_ms as i64));
                            task.updated_at = now;
                        }
                        // Schedule was stopped or removed; stop ticking.
                        _ => break,
                    }
                }
                persist_soon(&inner);
                let child = RunRequest {
                    name: Some(format!("schedule tick {}", &timer_id[..8])),
                    command: command.clone(),
                    cwd: cwd.clone(),
                    background: true,
                    parent_task_id: Some(timer_id.clone()),
                    max_retries: 0,
                    ..Default::default()
                };
                if let Err(e) = manager.run_command(child).await {
                    tracing::warn!("schedule {} tick failed to launch: {}", timer_id, e);
                }
            }
        });

        let mut state = self.inner.state.lock().await;
        if let Some(old) = state.schedules.insert(id, handle) {
            old.abort();
        }
    }

    /// Stop a task: clears timers, cancels its queue slot, terminates a
    /// running child, and marks it cancelled. Returns false when unknown.
    pub async fn stop(&self, task_id: &str) -> bool {
        let (found, was_running, finished) = {
            let mut state = self.inner.state.lock().await;
            if let Some(handle) = state.schedules.remove(task_id) {
                handle.abort();
            }
            state.queue.retain(|q| q.task_id != task_id);

            let was_running = if let Some(running) = state.running.get(task_id) {
                let _ = running.kill_tx.try_send(());
                true
            } else {
                false
            };

            match state.tasks.get_mut(task_id) {
                Some(task) => {
                    task.status = TaskStatus::Cancelled;
                    task.updated_at = Utc::now();
                    let finished = task.clone();
                    if !was_running {
                        notify_waiters(&mut state, task_id);
                    }
                    (true, was_running, Some(finished))
                }
                None => (false, was_running, None),
            }
        };

        if let Some(task) = finished {
            if !was_running {
                self.inner.bus.emit(
                    "task_end",
                    serde_json::json!({ "id": task.id, "status": task.status.as_str() }),
                );
            }
            persist_soon(&self.inner);
        }
        found
    }

    /// Remove a finished task record (and its log). No-op on active tasks.
    pub async fn remove(&self, task_id: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().await;
            let removable = state
                .tasks
                .get(task_id)
                .map(|t| t.status.is_terminal())
                .unwrap_or(false);
            if removable {
                state.tasks.remove(task_id)
            } else {
                None
            }
        };
        match removed {
            Some(task) => {
                if let Some(log) = task.log_path {
                    let _ = std::fs::remove_file(log);
                }
                persist_soon(&self.inner);
                true
            }
            None => false,
        }
    }

    /// Tail of a task's log: the file when present, else the in-memory
    /// buffer. `lines` is clamped to 1..=500.
    pub async fn tail(&self, task_id: &str, lines: usize) -> Result<Vec<String>, TaskError> {
        let lines = lines.clamp(1, 500);
        let (log_path, memory_tail) = {
            let state = self.inner.state.lock().await;
            let task = state
                .tasks
                .get(task_id)
                .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
            (task.log_path.clone(), task.tail.clone())
        };

        if let Some(path) = log_path {
            if let Ok(text) = std::fs::read_to_string(&path) {
                let all: Vec<&str> = text.lines().collect();
                let skip = all.len().saturating_sub(lines);
                return Ok(all[skip..].iter().map(|s| s.to_string()).collect());
            }
        }
        let skip = memory_tail.len().saturating_sub(lines);
        Ok(memory_tail[skip..].to_vec())
    }

    /// Snapshot of tasks sorted by most recent update.
    pub async fn list(&self, include_finished: bool) -> Vec<Task> {
        let state = self.inner.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| include_finished || !t.status.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        tasks
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.inner.state.lock().await.tasks.get(task_id).cloned()
    }

    /// Pressure counters for the autonomous loop and the dashboard.
    pub async fn health(&self) -> TaskHealth {
        let state = self.inner.state.lock().await;
        let recent_cutoff = Utc::now() - chrono::Duration::minutes(FAILED_RECENT_MINUTES);
        TaskHealth {
            total: state.tasks.len(),
            queue_depth: state.queue.len(),
            running: state.running.len(),
            max_concurrent: self.inner.limits.max_concurrent,
            failed_recent: state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Failed && t.updated_at >= recent_cutoff)
                .count(),
            schedules: state
                .tasks
                .values()
                .filter(|t| t.kind == TaskKind::Schedule && t.status == TaskStatus::Running)
                .count(),
        }
    }

    /// Previews of queued work, soonest first.
    pub async fn queue_snapshot(&self, limit: usize) -> Vec<QueuedPreview> {
        let state = self.inner.state.lock().await;
        let mut items: Vec<QueuedPreview> = state
            .queue
            .iter()
            .filter_map(|q| {
                state.tasks.get(&q.task_id).map(|t| QueuedPreview {
                    task_id: t.id.clone(),
                    name: t.name.clone(),
                    command: t.command.clone(),
                    retry_at: q.retry_at,
                    attempts: t.attempts,
                })
            })
            .collect();
        items.sort_by_key(|q| q.retry_at);
        items.truncate(limit.max(1));
        items
    }

    /// Terminate children, cancel timers, persist once. No new dispatch
    /// happens afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        {
            let mut state = self.inner.state.lock().await;
            for (_, handle) in state.schedules.drain() {
                handle.abort();
            }
            if let Some(handle) = state.wakeup.take() {
                handle.abort();
            }
            for (id, running) in state.running.iter() {
                tracing::info!("terminating task {} on shutdown", id);
                let _ = running.kill_tx.try_send(());
            }
        }
        persist_now(&self.inner).await;
    }
}

fn summarize_command(command: &str) -> String {
    let first = command.trim().lines().next().unwrap_or("");
    if first.len() > 48 {
        format!("{}…", &first[..first.char_indices().take(47).last().map(|(i, c)| i + c.len_utf8()).unwrap_or(47)])
    } else {
        first.to_string()
    }
}

fn notify_waiters(state: &mut State, task_id: &str) {
    if let Some(task) = state.tasks.get(task_id).cloned() {
        if let Some(waiters) = state.waiters.remove(task_id) {
            for tx in waiters {
                let _ = tx.send(task.clone());
            }
        }
    }
}

fn prune_finished(state: &mut State, max_finished: usize) {
    let mut finished: Vec<(String, DateTime<Utc>)> = state
        .tasks
        .values()
        .filter(|t| t.kind == TaskKind::Command && t.status.is_terminal())
        .map(|t| (t.id.clone(), t.updated_at))
        .collect();
    if finished.len() <= max_finished {
        return;
    }
    finished.sort_by(|a, b| b.1.cmp(&a.1));
    for (id, _) in finished.into_iter().skip(max_finished) {
        state.tasks.remove(&id);
    }
}

// ==================== Persistence ====================

fn persist_soon(inner: &Arc<Inner>) {
    if inner.persist_scheduled.swap(true, Ordering::SeqCst) {
        return;
    }
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(PERSIST_DEBOUNCE).await;
        inner.persist_scheduled.store(false, Ordering::SeqCst);
        persist_now(&inner).await;
    });
}

async fn persist_now(inner: &Arc<Inner>) {
    let _guard = inner.persist_lock.lock().await;
    let snapshot = {
        let state = inner.state.lock().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        PersistedTasks { tasks }
    };
    if let Err(e) = fsutil::write_json_atomic(&inner.state_path, &snapshot) {
        tracing::warn!("task state persist failed: {}", e);
    }
}

// ==================== Dispatch ====================

/// Single-shot dispatch: while free slots exist, launch the earliest ready
/// queue item; when only future retries remain, arm one wakeup at the
/// minimum retry time.
async fn dispatch(inner: &Arc<Inner>) {
    if inner.shutting_down.load(Ordering::SeqCst) {
        return;
    }
    if inner.dispatch_active.swap(true, Ordering::SeqCst) {
        return;
    }

    let plans: Vec<LaunchPlan> = {
        let mut state = inner.state.lock().await;
        let mut plans = Vec::new();
        loop {
            if state.running.len() + plans.len() >= inner.limits.max_concurrent {
                break;
            }
            let now = Utc::now();
            let ready = state
                .queue
                .iter()
                .enumerate()
                .filter(|(_, q)| q.retry_at <= now)
                .min_by_key(|(_, q)| q.retry_at)
                .map(|(i, _)| i);
            let Some(idx) = ready else { break };
            let item = state.queue.remove(idx);
            if let Some(plan) = prepare_launch(inner, &mut state, &item.task_id) {
                plans.push(plan);
            }
        }

        if let Some(handle) = state.wakeup.take() {
            handle.abort();
        }
        if let Some(min_retry) = state.queue.iter().map(|q| q.retry_at).min() {
            let delay = (min_retry - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_millis(0));
            let wake_inner = Arc::clone(inner);
            state.wakeup = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                dispatch_boxed(wake_inner).await;
            }));
        }
        plans
    };

    inner.dispatch_active.store(false, Ordering::SeqCst);

    for plan in plans {
        launch(inner, plan).await;
    }
}

fn dispatch_boxed(
    inner: Arc<Inner>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move { dispatch(&inner).await })
}

fn prepare_launch(inner: &Arc<Inner>, state: &mut State, task_id: &str) -> Option<LaunchPlan> {
    let task = state.tasks.get_mut(task_id)?;
    if task.status.is_terminal() {
        return None;
    }
    let now = Utc::now();
    task.status = TaskStatus::Running;
    task.attempts += 1;
    task.last_run_at = Some(now);
    task.next_run_at = None;
    task.updated_at = now;
    task.error = None;

    inner.bus.emit(
        "task_start",
        serde_json::json!({
            "id": task.id,
            "name": task.name,
            "attempt": task.attempts,
        }),
    );

    Some(LaunchPlan {
        task_id: task.id.clone(),
        command: task.command.clone(),
        cwd: task.cwd.clone(),
        timeout_ms: task.timeout_ms,
        log_path: task
            .log_path
            .clone()
            .unwrap_or_else(|| inner.logs_dir.join(format!("{task_id}.log"))),
    })
}

async fn launch(inner: &Arc<Inner>, plan: LaunchPlan) {
    let mut command = shell_command(&plan.command);
    if let Some(cwd) = &plan.cwd {
        command.current_dir(cwd);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!("spawn failed for task {}: {}", plan.task_id, e);
            let mut state = inner.state.lock().await;
            if let Some(task) = state.tasks.get_mut(&plan.task_id) {
                task.status = TaskStatus::Failed;
                task.error = Some(format!("spawn failed: {e}"));
                task.updated_at = Utc::now();
            }
            notify_waiters(&mut state, &plan.task_id);
            prune_finished(&mut state, inner.limits.max_finished);
            drop(state);
            inner.bus.emit(
                "task_end",
                serde_json::json!({ "id": plan.task_id, "status": "failed", "error": format!("spawn failed: {e}") }),
            );
            persist_soon(inner);
            return;
        }
    };

    let (kill_tx, kill_rx) = mpsc::channel(1);
    {
        let mut state = inner.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&plan.task_id) {
            task.pid = child.id();
        }
        state
            .running
            .insert(plan.task_id.clone(), RunningHandle { kill_tx });
    }
    persist_soon(inner);

    let monitor_inner = Arc::clone(inner);
    let _ = (monitor_inner, plan, child, kill_rx);
}

#[allow(dead_code)]
fn _probe_dispatch(inner: &Arc<Inner>) {
    fn is_send<T: Send>(_: T) {}
    is_send(dispatch(inner));
}

#[cfg(unix)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Drive one child to completion: split stdout/stderr into lines feeding
/// the log file and tail buffer, honor kill requests and the optional
/// timeout, then run the retry/terminal bookkeeping.
async fn monitor(
    inner: Arc<Inner>,
    plan: LaunchPlan,
    mut child: tokio::process::Child,
    mut kill_rx: mpsc::Receiver<()>,
) {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);

    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, line_tx.clone());
    }
    drop(line_tx);

    let mut timeout_armed = plan.timeout_ms > 0;
    let timeout = tokio::time::sleep(if timeout_armed {
        Duration::from_millis(plan.timeout_ms)
    } else {
        Duration::from_secs(365 * 24 * 3600)
    });
    tokio::pin!(timeout);
    let mut lines_open = true;

    let exit = loop {
        tokio::select! {
            maybe_line = line_rx.recv(), if lines_open => {
                match maybe_line {
                    Some(line) => record_output(&inner, &plan, &line).await,
                    None => lines_open = false,
                }
            }
            status = child.wait() => break status,
            Some(()) = kill_rx.recv() => {
                tracing::debug!("terminating task {} on request", plan.task_id);
                let _ = child.start_kill();
            }
            _ = &mut timeout, if timeout_armed => {
                timeout_armed = false;
                tracing::info!("task {} timed out after {} ms", plan.task_id, plan.timeout_ms);
                {
                    let mut state = inner.state.lock().await;
                    if let Some(task) = state.tasks.get_mut(&plan.task_id) {
                        task.status = TaskStatus::Stopped;
                        task.error = Some(format!("timed out after {} ms", plan.timeout_ms));
                        task.updated_at = Utc::now();
                    }
                }
                let _ = child.start_kill();
            }
        }
    };

    // Drain whatever the readers still have buffered.
    while let Some(line) = line_rx.recv().await {
        record_output(&inner, &plan, &line).await;
    }

    let exit_code = match exit {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!("wait failed for task {}: {}", plan.task_id, e);
            None
        }
    };

    finish_attempt(&inner, &plan.task_id, exit_code).await;
}

fn spawn_line_reader(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

async fn record_output(inner: &Arc<Inner>, plan: &LaunchPlan, line: &str) {
    if let Err(e) = fsutil::append_line(&plan.log_path, line) {
        tracing::warn!("log append failed for {}: {}", plan.task_id, e);
    }
    {
        let mut state = inner.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&plan.task_id) {
            task.tail.push(line.to_string());
            if task.tail.len() > TAIL_LIMIT {
                let excess = task.tail.len() - TAIL_LIMIT;
                task.tail.drain(..excess);
            }
        }
    }
    inner.bus.emit(
        "task_output",
        serde_json::json!({ "id": plan.task_id, "line": line }),
    );
}

/// Terminal/retry bookkeeping once an attempt's child has exited.
async fn finish_attempt(inner: &Arc<Inner>, task_id: &str, exit_code: Option<i32>) {
    let now = Utc::now();
    let mut end_event: Option<serde_json::Value> = None;
    let mut retry_event: Option<serde_json::Value> = None;
    let mut queue_item: Option<QueueItem> = None;

    {
        let mut state = inner.state.lock().await;
        state.running.remove(task_id);

        if let Some(task) = state.tasks.get_mut(task_id) {
            task.pid = None;
            task.exit_code = exit_code;
            task.updated_at = now;

            if matches!(task.status, TaskStatus::Stopped | TaskStatus::Cancelled) {
                // stop() or the timeout already decided the outcome.
                end_event = Some(
                    serde_json::json!({ "id": task_id, "status": task.status.as_str(), "exit_code": exit_code }),
                );
            } else if exit_code == Some(0) {
                task.status = TaskStatus::Completed;
                end_event = Some(
                    serde_json::json!({ "id": task_id, "status": "completed", "exit_code": 0 }),
                );
            } else if task.attempts <= task.max_retries {
                let delay_ms = task.retry_delay_ms.max(MIN_RETRY_DELAY_MS);
                let retry_at = now + chrono::Duration::milliseconds(delay_ms as i64);
                task.status = TaskStatus::Queued;
                task.next_run_at = Some(retry_at);
                retry_event = Some(serde_json::json!({
                    "id": task_id,
                    "attempt": task.attempts,
                    "max_retries": task.max_retries,
                    "retry_at": retry_at.timestamp_millis(),
                    "exit_code": exit_code,
                }));
                queue_item = Some(QueueItem {
                    task_id: task_id.to_string(),
                    retry_at,
                });
            } else {
                task.status = TaskStatus::Failed;
                task.error = Some(match exit_code {
                    Some(code) => format!("exited with code {code}"),
                    None => "terminated by signal".to_string(),
                });
                end_event = Some(
                    serde_json::json!({ "id": task_id, "status": "failed", "exit_code": exit_code }),
                );
            }

            if task.status.is_terminal() {
                notify_waiters(&mut state, task_id);
                prune_finished(&mut state, inner.limits.max_finished);
            }
        }

        if let Some(item) = queue_item {
            state.queue.push(item);
        }
    }

    if let Some(payload) = retry_event {
        inner.bus.emit("task_retry", payload);
    }
    if let Some(payload) = end_event {
        inner.bus.emit("task_end", payload);
    }
    persist_soon(inner);
    dispatch(inner).await;
}
