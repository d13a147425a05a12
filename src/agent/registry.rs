//! Lane → session registry.
//!
//! Owns every agent session, keyed by lane. Capacity is bounded: idle
//! sessions time out, and once the lane cap is reached the least-recently
//! used session is evicted — never one that is currently executing.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::fsutil;
use crate::llm::LlmProvider;
use crate::memory::MemoryStore;

use super::session::AgentSession;

/// Metadata for one lane's conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneInfo {
    pub lane_key: String,
    pub base_lane_key: String,
    pub source: String,
    pub channel_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub message_count: usize,
}

struct Entry {
    session: Arc<Mutex<AgentSession>>,
    info: LaneInfo,
}

/// Registry of live sessions with idle/LRU eviction.
pub struct SessionRegistry {
    lanes_dir: PathBuf,
    max_lanes: usize,
    max_idle: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl SessionRegistry {
    pub fn new(lanes_dir: PathBuf, max_lanes: usize, max_idle_minutes: i64) -> Self {
        Self {
            lanes_dir,
            max_lanes: max_lanes.max(1),
            max_idle: Duration::minutes(max_idle_minutes.max(1)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lane_dir(&self, lane_key: &str) -> PathBuf {
        self.lanes_dir.join(MemoryStore::safe_session_key(lane_key))
    }

    /// Get or create the session for a lane. `active_lanes` are exempt from
    /// eviction while their turn is executing.
    pub async fn acquire(
        &self,
        lane_key: &str,
        source: &str,
        channel_id: &str,
        session_id: Option<&str>,
        provider: Arc<dyn LlmProvider>,
        active_lanes: &HashSet<String>,
    ) -> Arc<Mutex<AgentSession>> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(lane_key) {
            entry.info.last_used_at = Utc::now();
            return Arc::clone(&entry.session);
        }

        self.evict_locked(&mut entries, active_lanes);

        let lane_dir = self.lane_dir(lane_key);
        let _ = fsutil::ensure_dir(&lane_dir);
        let history_path = lane_dir.join("history.json");
        let session = Arc::new(Mutex::new(AgentSession::new(
            lane_key,
            provider,
            Some(history_path),
        )));
        let now = Utc::now();
        let info = LaneInfo {
            lane_key: lane_key.to_string(),
            base_lane_key: format!("{source}:{channel_id}"),
            source: source.to_string(),
            channel_id: channel_id.to_string(),
            session_id: session_id.map(String::from),
            created_at: now,
            last_used_at: now,
            message_count: 0,
        };
        let _ = fsutil::write_json_atomic(&lane_dir.join("meta.json"), &info);

        entries.insert(
            lane_key.to_string(),
            Entry {
                session: Arc::clone(&session),
                info,
            },
        );
        session
    }

    /// Drop idle sessions, then LRU-evict down to capacity. Lanes currently
    /// executing are never touched.
    fn evict_locked(&self, entries: &mut HashMap<String, Entry>, active_lanes: &HashSet<String>) {
        let idle_cutoff = Utc::now() - self.max_idle;
        let idle: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| {
                !active_lanes.contains(*key) && entry.info.last_used_at < idle_cutoff
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in idle {
            tracing::info!("evicting idle session lane {}", key);
            entries.remove(&key);
        }

        while entries.len() >= self.max_lanes {
            let victim = entries
                .iter()
                .filter(|(key, _)| !active_lanes.contains(*key))
                .min_by_key(|(_, entry)| entry.info.last_used_at)
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    tracing::info!("evicting LRU session lane {}", key);
                    entries.remove(&key);
                }
                // Everything left is executing; let the map exceed capacity
                // rather than kill a running turn.
                None => break,
            }
        }
    }

    /// Refresh lane bookkeeping after a completed turn.
    pub async fn touch(&self, lane_key: &str, message_count: usize) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(lane_key) {
            entry.info.last_used_at = Utc::now();
            entry.info.message_count = message_count;
            let _ = fsutil::write_json_atomic(
                &self.lane_dir(lane_key).join("meta.json"),
                &entry.info,
            );
        }
    }

    /// Run eviction explicitly (called after each turn).
    pub async fn enforce_limits(&self, active_lanes: &HashSet<String>) {
        let mut entries = self.entries.lock().await;
        self.evict_locked(&mut entries, active_lanes);
    }

    /// Live lane metadata, most recent first.
    pub async fn list(&self) -> Vec<LaneInfo> {
        let entries = self.entries.lock().await;
        let mut infos: Vec<LaneInfo> = entries.values().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        infos
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Archive a lane: drop the live session and its durable history.
    /// Returns false when the lane is unknown.
    pub async fn archive(&self, lane_key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.remove(lane_key) {
            Some(entry) => {
                let session = entry.session.lock().await;
                session.delete_history();
                drop(session);
                let _ = std::fs::remove_dir_all(self.lane_dir(lane_key));
                true
            }
            None => {
                // Not live; still remove any on-disk remnants.
                let dir = self.lane_dir(lane_key);
                if dir.exists() {
                    let _ = std::fs::remove_dir_all(dir);
                    true
                } else {
                    false
                }
            }
        }
    }
}
