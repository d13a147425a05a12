//! Durable objective queue.
//!
//! Objectives are the agent's standing goals. The whole set lives in one
//! JSON file that is atomically rewritten on every mutation, so the queue
//! survives restarts without a database.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::fsutil;

/// Error type for objective operations.
#[derive(Debug, Error)]
pub enum ObjectiveError {
    #[error("objective title must not be empty")]
    EmptyTitle,

    #[error("priority {0} out of range (1-5)")]
    BadPriority(u8),

    #[error("objective not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] fsutil::FsError),
}

/// Lifecycle status of an objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl ObjectiveStatus {
    /// Completed, failed and cancelled objectives are settled; only the
    /// update API may move them again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ObjectiveStatus::Completed | ObjectiveStatus::Failed | ObjectiveStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectiveStatus::Pending => "pending",
            ObjectiveStatus::InProgress => "in_progress",
            ObjectiveStatus::Blocked => "blocked",
            ObjectiveStatus::Completed => "completed",
            ObjectiveStatus::Failed => "failed",
            ObjectiveStatus::Cancelled => "cancelled",
        }
    }
}

/// Timestamped free-text annotation on an objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveNote {
    pub at: DateTime<Utc>,
    pub text: String,
}

/// One standing goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: u8,
    pub status: ObjectiveStatus,
    #[serde(default)]
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Vec<ObjectiveNote>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ObjectiveFile {
    objectives: Vec<Objective>,
}

/// Parameters for `update()`. Unset fields are left alone.
#[derive(Debug, Default, Clone)]
pub struct ObjectiveUpdate {
    pub status: Option<ObjectiveStatus>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<u8>,
    pub note: Option<String>,
}

/// Summary counters for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectiveStats {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
}

/// Durable, ordered objective set.
pub struct ObjectiveQueue {
    path: PathBuf,
    objectives: Vec<Objective>,
}

impl ObjectiveQueue {
    /// Load the queue from `path`, starting empty when the file is missing
    /// or quarantined as corrupt.
    pub fn load(path: PathBuf) -> Self {
        let file: ObjectiveFile = fsutil::read_json_or_quarantine(&path).unwrap_or_default();
        Self {
            path,
            objectives: file.objectives,
        }
    }

    /// Reload from disk, replacing in-memory state.
    pub fn reload(&mut self) {
        let file: ObjectiveFile = fsutil::read_json_or_quarantine(&self.path).unwrap_or_default();
        self.objectives = file.objectives;
    }

    fn persist(&self) -> Result<(), ObjectiveError> {
        let file = ObjectiveFile {
            objectives: self.objectives.clone(),
        };
        fsutil::write_json_atomic(&self.path, &file)?;
        Ok(())
    }

    /// Add a new objective with status pending.
    pub fn add(
        &mut self,
        title: &str,
        description: &str,
        priority: u8,
        source: &str,
    ) -> Result<Objective, ObjectiveError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ObjectiveError::EmptyTitle);
        }
        if !(1..=5).contains(&priority) {
            return Err(ObjectiveError::BadPriority(priority));
        }

        let now = Utc::now();
        let objective = Objective {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            description: description.trim().to_string(),
            priority,
            status: ObjectiveStatus::Pending,
            source: source.to_string(),
            created_at: now,
            updated_at: now,
            run_count: 0,
            last_run_at: None,
            notes: Vec::new(),
        };
        self.objectives.push(objective.clone());
        self.persist()?;
        Ok(objective)
    }

    /// List objectives, optionally filtered by status, newest-updated first.
    pub fn list(&self, status: Option<ObjectiveStatus>) -> Vec<Objective> {
        let mut out: Vec<Objective> = self
            .objectives
            .iter()
            .filter(|o| status.map(|s| o.status == s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    pub fn get_by_id(&self, id: &str) -> Option<&Objective> {
        self.objectives.iter().find(|o| o.id == id)
    }

    /// Apply an update. This is the only path that may move an objective out
    /// of a terminal status.
    pub fn update(&mut self, id: &str, update: ObjectiveUpdate) -> Result<Objective, ObjectiveError> {
        let now = Utc::now();
        let objective = self
            .objectives
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| ObjectiveError::NotFound(id.to_string()))?;

        if let Some(title) = update.title {
            let title = title.trim().to_string();
            if title.is_empty() {
                return Err(ObjectiveError::EmptyTitle);
            }
            objective.title = title;
        }
        if let Some(description) = update.description {
            objective.description = description;
        }
        if let Some(priority) = update.priority {
            if !(1..=5).contains(&priority) {
                return Err(ObjectiveError::BadPriority(priority));
            }
            objective.priority = priority;
        }
        if let Some(status) = update.status {
            objective.status = status;
        }
        if let Some(text) = update.note {
            objective.notes.push(ObjectiveNote { at: now, text });
        }
        objective.updated_at = now;

        let updated = objective.clone();
        self.persist()?;
        Ok(updated)
    }

    /// Choose the objective the autonomous loop should work on next:
    /// the longest-idle in-progress objective, else the highest-priority
    /// (lowest number), oldest-created pending one.
    pub fn pick_for_autonomous(&self) -> Option<&Objective> {
        let in_progress = self
            .objectives
            .iter()
            .filter(|o| o.status == ObjectiveStatus::InProgress)
            .min_by_key(|o| o.updated_at);
        if in_progress.is_some() {
            return in_progress;
        }

        self.objectives
            .iter()
            .filter(|o| o.status == ObjectiveStatus::Pending)
            .min_by_key(|o| (o.priority, o.created_at))
    }

    /// Record that the autonomous loop picked an objective: bump to
    /// in-progress and count the run. Terminal objectives are left alone.
    pub fn mark_picked(&mut self, id: &str) -> Result<(), ObjectiveError> {
        let now = Utc::now();
        let objective = self
            .objectives
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| ObjectiveError::NotFound(id.to_string()))?;

        if objective.status.is_terminal() {
            return Ok(());
        }

        objective.status = ObjectiveStatus::InProgress;
        objective.run_count += 1;
        objective.last_run_at = Some(now);
        objective.updated_at = now;
        self.persist()?;
        Ok(())
    }

    /// Demote stale objectives with an audit note: pending past
    /// `pending_max_age_hours` are cancelled, in-progress idle past
    /// `in_progress_max_idle_hours` are blocked. Returns how many changed.
    pub fn expire_stale(
        &mut self,
        pending_max_age_hours: i64,
        in_progress_max_idle_hours: i64,
    ) -> Result<usize, ObjectiveError> {
        let now = Utc::now();
        let pending_cutoff = now - Duration::hours(pending_max_age_hours.max(1));
        let idle_cutoff = now - Duration::hours(in_progress_max_idle_hours.max(1));
        let mut changed = 0;

        for objective in &mut self.objectives {
            match objective.status {
                ObjectiveStatus::Pending if objective.created_at < pending_cutoff => {
                    objective.status = ObjectiveStatus::Cancelled;
                    objective.notes.push(ObjectiveNote {
                        at: now,
                        text: format!(
                            "auto-cancelled: pending for more than {pending_max_age_hours}h"
                        ),
                    });
                    objective.updated_at = now;
                    changed += 1;
                }
                ObjectiveStatus::InProgress if objective.updated_at < idle_cutoff => {
                    objective.status = ObjectiveStatus::Blocked;
                    objective.notes.push(ObjectiveNote {
                        at: now,
                        text: format!(
                            "auto-blocked: idle in progress for more than {in_progress_max_idle_hours}h"
                        ),
                    });
                    objective.updated_at = now;
                    changed += 1;
                }
                _ => {}
            }
        }

        if changed > 0 {
            self.persist()?;
        }
        Ok(changed)
    }

    /// Status counters for the dashboard.
    pub fn stats(&self) -> ObjectiveStats {
        let mut by_status: HashMap<String, usize> = HashMap::new();
        for objective in &self.objectives {
            *by_status
                .entry(objective.status.as_str().to_string())
                .or_default() += 1;
        }
        ObjectiveStats {
            total: self.objectives.len(),
            by_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue_in(dir: &std::path::Path) -> ObjectiveQueue {
        ObjectiveQueue::load(dir.join("objectives.json"))
    }

    #[test]
    fn test_add_rejects_empty_title() {
        let dir = tempdir().unwrap();
        let mut queue = queue_in(dir.path());
        assert!(matches!(
            queue.add("   ", "", 3, "test"),
            Err(ObjectiveError::EmptyTitle)
        ));
    }

    #[test]
    fn test_add_rejects_bad_priority() {
        let dir = tempdir().unwrap();
        let mut queue = queue_in(dir.path());
        assert!(matches!(
            queue.add("goal", "", 0, "test"),
            Err(ObjectiveError::BadPriority(0))
        ));
        assert!(matches!(
            queue.add("goal", "", 6, "test"),
            Err(ObjectiveError::BadPriority(6))
        ));
    }

    #[test]
    fn test_add_update_list_roundtrip() {
        let dir = tempdir().unwrap();
        let mut queue = queue_in(dir.path());

        let added = queue.add("ship release", "cut v1", 2, "cli").unwrap();
        queue
            .update(
                &added.id,
                ObjectiveUpdate {
                    status: Some(ObjectiveStatus::InProgress),
                    note: Some("started".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let listed = queue.list(Some(ObjectiveStatus::InProgress));
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, added.id);
        assert_eq!(listed[0].notes.len(), 1);

        // Survives reload from disk.
        let reloaded = queue_in(dir.path());
        assert_eq!(reloaded.get_by_id(&added.id).unwrap().title, "ship release");
    }

    #[test]
    fn test_pick_prefers_oldest_in_progress() {
        let dir = tempdir().unwrap();
        let mut queue = queue_in(dir.path());

        let a = queue.add("a", "", 1, "t").unwrap();
        let b = queue.add("b", "", 1, "t").unwrap();
        queue
            .update(
                &b.id,
                ObjectiveUpdate {
                    status: Some(ObjectiveStatus::InProgress),
                    ..Default::default()
                },
            )
            .unwrap();
        queue
            .update(
                &a.id,
                ObjectiveUpdate {
                    status: Some(ObjectiveStatus::InProgress),
                    ..Default::default()
                },
            )
            .unwrap();

        // b was updated before a, so b is the longest-idle in-progress one.
        assert_eq!(queue.pick_for_autonomous().unwrap().id, b.id);
    }

    #[test]
    fn test_pick_falls_back_to_priority_then_age() {
        let dir = tempdir().unwrap();
        let mut queue = queue_in(dir.path());

        let low = queue.add("low", "", 4, "t").unwrap();
        let high = queue.add("high", "", 1, "t").unwrap();
        let _also_high = queue.add("also high", "", 1, "t").unwrap();

        // Highest priority wins; among equals the oldest-created wins.
        assert_eq!(queue.pick_for_autonomous().unwrap().id, high.id);

        queue
            .update(
                &high.id,
                ObjectiveUpdate {
                    status: Some(ObjectiveStatus::Completed),
                    ..Default::default()
                },
            )
            .unwrap();
        queue
            .update(
                &low.id,
                ObjectiveUpdate {
                    status: Some(ObjectiveStatus::Completed),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(queue.pick_for_autonomous().unwrap().title, "also high");
    }

    #[test]
    fn test_mark_picked_skips_terminal() {
        let dir = tempdir().unwrap();
        let mut queue = queue_in(dir.path());

        let done = queue.add("done", "", 3, "t").unwrap();
        queue
            .update(
                &done.id,
                ObjectiveUpdate {
                    status: Some(ObjectiveStatus::Completed),
                    ..Default::default()
                },
            )
            .unwrap();

        queue.mark_picked(&done.id).unwrap();
        let after = queue.get_by_id(&done.id).unwrap();
        assert_eq!(after.status, ObjectiveStatus::Completed);
        assert_eq!(after.run_count, 0);
    }

    #[test]
    fn test_mark_picked_bumps_run_count() {
        let dir = tempdir().unwrap();
        let mut queue = queue_in(dir.path());
        let o = queue.add("work", "", 3, "t").unwrap();

        queue.mark_picked(&o.id).unwrap();
        queue.mark_picked(&o.id).unwrap();

        let after = queue.get_by_id(&o.id).unwrap();
        assert_eq!(after.status, ObjectiveStatus::InProgress);
        assert_eq!(after.run_count, 2);
        assert!(after.last_run_at.is_some());
    }

    #[test]
    fn test_expire_stale() {
        let dir = tempdir().unwrap();
        let mut queue = queue_in(dir.path());

        let stale_pending = queue.add("old pending", "", 3, "t").unwrap();
        let stale_running = queue.add("old running", "", 3, "t").unwrap();
        let fresh = queue.add("fresh", "", 3, "t").unwrap();
        queue.mark_picked(&stale_running.id).unwrap();

        // Backdate the stale ones directly.
        let past = Utc::now() - Duration::hours(100);
        for o in &mut queue.objectives {
            if o.id == stale_pending.id {
                o.created_at = past;
            }
            if o.id == stale_running.id {
                o.updated_at = past;
            }
        }

        let changed = queue.expire_stale(48, 24).unwrap();
        assert_eq!(changed, 2);

        assert_eq!(
            queue.get_by_id(&stale_pending.id).unwrap().status,
            ObjectiveStatus::Cancelled
        );
        assert_eq!(
            queue.get_by_id(&stale_running.id).unwrap().status,
            ObjectiveStatus::Blocked
        );
        assert_eq!(
            queue.get_by_id(&fresh.id).unwrap().status,
            ObjectiveStatus::Pending
        );
        // Audit notes recorded
        assert!(!queue.get_by_id(&stale_pending.id).unwrap().notes.is_empty());
    }

    #[test]
    fn test_stats_counts_by_status() {
        let dir = tempdir().unwrap();
        let mut queue = queue_in(dir.path());
        queue.add("a", "", 3, "t").unwrap();
        queue.add("b", "", 3, "t").unwrap();
        let c = queue.add("c", "", 3, "t").unwrap();
        queue
            .update(
                &c.id,
                ObjectiveUpdate {
                    status: Some(ObjectiveStatus::Failed),
                    ..Default::default()
                },
            )
            .unwrap();

        let stats = queue.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status["pending"], 2);
        assert_eq!(stats.by_status["failed"], 1);
    }
}
