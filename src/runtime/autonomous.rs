//! Autonomous loop: the runtime driving itself on a timer.
//!
//! Each tick picks an objective (or falls back to the configured
//! maintenance goal) and pushes a synthesized prompt through the same
//! orchestrator path user requests take. Pressure checks keep it polite;
//! a circuit breaker stops it after repeated failures.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::channels::IncomingRequest;
use crate::config::AutonomousConfig;
use crate::objectives::Objective;
use crate::runtime::Runtime;

/// Floor on the tick interval.
const MIN_INTERVAL_MS: u64 = 5_000;

/// Observable controller state.
#[derive(Debug, Clone, Serialize)]
pub struct AutonomousState {
    pub enabled: bool,
    pub running: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    pub total_ticks: u64,
    pub skipped_ticks: u64,
    pub disabled_reason: Option<String>,
    pub interval_ms: u64,
    pub skip_when_queue_above: usize,
    pub stale_pending_hours: i64,
    pub stale_in_progress_idle_hours: i64,
    #[serde(skip)]
    pub goal: String,
}

impl AutonomousState {
    fn from_config(config: &AutonomousConfig) -> Self {
        Self {
            enabled: config.enabled,
            running: false,
            last_tick_at: None,
            last_error: None,
            consecutive_failures: 0,
            max_consecutive_failures: config.max_consecutive_failures,
            total_ticks: 0,
            skipped_ticks: 0,
            disabled_reason: None,
            interval_ms: config.interval_ms.max(MIN_INTERVAL_MS),
            skip_when_queue_above: config.skip_when_queue_above,
            stale_pending_hours: config.stale_pending_hours,
            stale_in_progress_idle_hours: config.stale_in_progress_idle_hours,
            goal: config.goal.clone(),
        }
    }
}

/// What one tick did. Returned for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Ran,
    Failed,
    Skipped(&'static str),
}

/// Periodic self-driving controller.
pub struct AutonomousLoop {
    runtime: Arc<Runtime>,
    state: StdMutex<AutonomousState>,
}

impl AutonomousLoop {
    pub fn new(runtime: Arc<Runtime>) -> Arc<Self> {
        let config = runtime.config().autonomous;
        Arc::new(Self {
            runtime,
            state: StdMutex::new(AutonomousState::from_config(&config)),
        })
    }

    pub fn state(&self) -> AutonomousState {
        self.state.lock().expect("autonomous state").clone()
    }

    /// Re-apply config: clears the circuit breaker.
    pub fn reconfigure(&self, config: &AutonomousConfig) {
        let mut state = self.state.lock().expect("autonomous state");
        let ticks = (state.total_ticks, state.skipped_ticks);
        *state = AutonomousState::from_config(config);
        state.total_ticks = ticks.0;
        state.skipped_ticks = ticks.1;
        tracing::info!("autonomous loop reconfigured (enabled={})", config.enabled);
    }

    /// Spawn the timer task.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self;
        tokio::spawn(async move {
            loop {
                let interval_ms = this.state.lock().expect("autonomous state").interval_ms;
                tokio::time::sleep(Duration::from_millis(interval_ms.max(MIN_INTERVAL_MS))).await;
                let outcome = this.tick().await;
                tracing::debug!("autonomous tick: {:?}", outcome);
            }
        })
    }

    fn skip(&self, reason: &'static str) -> TickOutcome {
        let mut state = self.state.lock().expect("autonomous state");
        state.skipped_ticks += 1;
        state.running = false;
        tracing::debug!("autonomous tick skipped: {}", reason);
        TickOutcome::Skipped(reason)
    }

    /// One tick: pressure checks, objective pick, synthesized prompt.
    pub async fn tick(&self) -> TickOutcome {
        let (skip_above, stale_pending, stale_idle, goal) = {
            let mut state = self.state.lock().expect("autonomous state");
            if !state.enabled {
                state.skipped_ticks += 1;
                return TickOutcome::Skipped("disabled");
            }
            if state.disabled_reason.is_some() {
                state.skipped_ticks += 1;
                return TickOutcome::Skipped("circuit breaker open");
            }
            if state.running {
                state.skipped_ticks += 1;
                return TickOutcome::Skipped("tick already running");
            }
            state.running = true;
            (
                state.skip_when_queue_above,
                state.stale_pending_hours,
                state.stale_in_progress_idle_hours,
                state.goal.clone(),
            )
        };

        if self.runtime.queue_depth() > skip_above {
            return self.skip("queue busy");
        }
        let health = self.runtime.tasks.health().await;
        if health.queue_depth > 3 * health.max_concurrent {
            return self.skip("task queue pressure");
        }
        if health.failed_recent > health.max_concurrent.max(6) {
            return self.skip("recent task failures");
        }

        // Pick work.
        let picked: Option<Objective> = {
            let mut objectives = self.runtime.objectives.lock().await;
            objectives.reload();
            if let Err(e) = objectives.expire_stale(stale_pending, stale_idle) {
                tracing::warn!("stale objective expiry failed: {}", e);
            }
            let picked = objectives.pick_for_autonomous().cloned();
            if let Some(objective) = &picked {
                if let Err(e) = objectives.mark_picked(&objective.id) {
                    tracing::warn!("mark_picked failed: {}", e);
                }
            }
            picked
        };

        let tick_prompt = match &picked {
            Some(objective) => format!(
                "Autonomous work cycle. Work on this objective and report concrete progress.\n\
                 Objective: {}\nPriority: {}\nDetails: {}\n\
                 Update the objective status with nx_objective_update when its state changes.",
                objective.title,
                objective.priority,
                if objective.description.is_empty() { "(none)" } else { &objective.description }
            ),
            None => format!(
                "Autonomous maintenance cycle. No objective is pending.\nGoal: {goal}\n\
                 Keep it brief; create objectives with nx_objective_add if you find real work."
            ),
        };

        let request = IncomingRequest::new("autonomous", "loop", "self");
        let reply = self.runtime.handle_incoming(&request, &tick_prompt).await;
        let failed = reply.starts_with("Runtime error:");

        let mut state = self.state.lock().expect("autonomous state");
        state.running = false;
        state.total_ticks += 1;
        state.last_tick_at = Some(Utc::now());
        if failed {
            state.consecutive_failures += 1;
            state.last_error = Some(reply.clone());
            tracing::warn!(
                "autonomous tick failed ({}/{}): {}",
                state.consecutive_failures,
                state.max_consecutive_failures,
                reply
            );
            if state.consecutive_failures >= state.max_consecutive_failures {
                state.disabled_reason = Some(format!(
                    "disabled after {} consecutive failures",
                    state.consecutive_failures
                ));
                tracing::error!("autonomous loop circuit breaker opened");
            }
            TickOutcome::Failed
        } else {
            state.consecutive_failures = 0;
            state.last_error = None;
            TickOutcome::Ran
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::ScriptedProvider;
    use crate::objectives::ObjectiveStatus;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::load(dir.to_path_buf());
        config.memory.vector.provider = "local".to_string();
        config.memory.vector.dims = 32;
        config.autonomous.enabled = true;
        config.autonomous.max_consecutive_failures = 2;
        config
    }

    async fn runtime_with(
        dir: &std::path::Path,
        provider: ScriptedProvider,
    ) -> (Arc<Runtime>, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let runtime =
            Runtime::with_provider(test_config(dir), Arc::clone(&provider) as _).unwrap();
        runtime.start().await;
        (runtime, provider)
    }

    #[tokio::test]
    async fn test_tick_works_objective_and_marks_picked() {
        let dir = tempdir().unwrap();
        let (runtime, provider) = runtime_with(dir.path(), ScriptedProvider::always("done")).await;
        let id = runtime
            .objectives
            .lock()
            .await
            .add("water the plants", "rooftop garden", 2, "test")
            .unwrap()
            .id;

        let looper = AutonomousLoop::new(Arc::clone(&runtime));
        assert_eq!(looper.tick().await, TickOutcome::Ran);

        // Objective bumped into in_progress with a counted run.
        let objectives = runtime.objectives.lock().await;
        let objective = objectives.get_by_id(&id).unwrap();
        assert_eq!(objective.status, ObjectiveStatus::InProgress);
        assert_eq!(objective.run_count, 1);
        drop(objectives);

        // The synthesized prompt names the objective.
        let seen = provider.seen.lock().unwrap();
        assert!(seen.last().unwrap().contains("water the plants"));
        drop(seen);

        let state = looper.state();
        assert_eq!(state.total_ticks, 1);
        assert_eq!(state.consecutive_failures, 0);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_tick_falls_back_to_goal() {
        let dir = tempdir().unwrap();
        let (runtime, provider) = runtime_with(dir.path(), ScriptedProvider::always("ok")).await;

        let looper = AutonomousLoop::new(Arc::clone(&runtime));
        assert_eq!(looper.tick().await, TickOutcome::Ran);

        let seen = provider.seen.lock().unwrap();
        assert!(seen.last().unwrap().contains("maintenance cycle"));
        drop(seen);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_and_reconfigure_clears() {
        let dir = tempdir().unwrap();
        let (runtime, provider) =
            runtime_with(dir.path(), ScriptedProvider::new(vec![Err("boom".to_string())])).await;

        let looper = AutonomousLoop::new(Arc::clone(&runtime));
        assert_eq!(looper.tick().await, TickOutcome::Failed);
        assert_eq!(looper.tick().await, TickOutcome::Failed);

        let state = looper.state();
        assert!(state.disabled_reason.is_some());
        let calls_when_opened = provider.call_count();

        // Breaker open: further ticks never reach the orchestrator.
        assert_eq!(looper.tick().await, TickOutcome::Skipped("circuit breaker open"));
        assert_eq!(looper.tick().await, TickOutcome::Skipped("circuit breaker open"));
        assert_eq!(provider.call_count(), calls_when_opened);

        // Reconfiguration clears the breaker.
        looper.reconfigure(&runtime.config().autonomous);
        let state = looper.state();
        assert!(state.disabled_reason.is_none());
        assert_eq!(state.consecutive_failures, 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_loop_skips() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.autonomous.enabled = false;
        let provider = Arc::new(ScriptedProvider::always("ok"));
        let runtime = Runtime::with_provider(config, Arc::clone(&provider) as _).unwrap();
        runtime.start().await;

        let looper = AutonomousLoop::new(Arc::clone(&runtime));
        assert_eq!(looper.tick().await, TickOutcome::Skipped("disabled"));
        assert_eq!(provider.call_count(), 0);
        assert_eq!(looper.state().skipped_ticks, 1);

        runtime.shutdown().await;
    }
}
