//! Keyed FIFO lane scheduler.
//!
//! One lane per conversation: work on the same lane key runs strictly
//! serially in submission order, while distinct lanes run in parallel. A
//! single global depth counter provides backpressure across all lanes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::events::EventBus;

/// Error type for lane scheduling.
#[derive(Debug, Error)]
pub enum LaneError {
    #[error("queue overflow: depth {depth} at limit {max}")]
    QueueOverflow { depth: usize, max: usize },
}

struct LaneEntry {
    gate: Arc<tokio::sync::Mutex<()>>,
    /// Waiting plus running items for this lane.
    depth: usize,
    active: usize,
    last_used_at: DateTime<Utc>,
}

/// Point-in-time view of one lane, for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct LaneSnapshot {
    pub lane_key: String,
    pub depth: usize,
    pub active: usize,
    pub last_used_at: DateTime<Utc>,
}

/// Per-key serial queue with a global depth cap.
pub struct LaneQueue {
    max_depth: usize,
    total_depth: AtomicUsize,
    lanes: Mutex<HashMap<String, LaneEntry>>,
    bus: Arc<EventBus>,
}

/// Decrements counters and emits `lane_end` even if the work panics, so a
/// failing turn can never wedge its lane.
struct LaneTicket<'a> {
    queue: &'a LaneQueue,
    lane_key: String,
}

impl Drop for LaneTicket<'_> {
    fn drop(&mut self) {
        let (depth, active) = {
            let mut lanes = self.queue.lanes.lock().expect("lane map poisoned");
            let mut remove = false;
            let stats = match lanes.get_mut(&self.lane_key) {
                Some(entry) => {
                    entry.depth = entry.depth.saturating_sub(1);
                    entry.active = entry.active.saturating_sub(1);
                    entry.last_used_at = Utc::now();
                    if entry.depth == 0 && entry.active == 0 {
                        remove = true;
                    }
                    (entry.depth, entry.active)
                }
                None => (0, 0),
            };
            if remove {
                lanes.remove(&self.lane_key);
            }
            stats
        };
        let total = self.queue.total_depth.fetch_sub(1, Ordering::SeqCst) - 1;
        self.queue.bus.emit(
            "lane_end",
            serde_json::json!({
                "lane": self.lane_key,
                "depth": depth,
                "active": active,
                "total_depth": total,
            }),
        );
    }
}

impl LaneQueue {
    pub fn new(max_depth: usize, bus: Arc<EventBus>) -> Self {
        Self {
            max_depth: max_depth.max(1),
            total_depth: AtomicUsize::new(0),
            lanes: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Total pending plus active work across all lanes.
    pub fn total_depth(&self) -> usize {
        self.total_depth.load(Ordering::SeqCst)
    }

    /// Number of live lanes.
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().expect("lane map poisoned").len()
    }

    /// Snapshot of every live lane.
    pub fn snapshot(&self) -> Vec<LaneSnapshot> {
        let lanes = self.lanes.lock().expect("lane map poisoned");
        lanes
            .iter()
            .map(|(key, entry)| LaneSnapshot {
                lane_key: key.clone(),
                depth: entry.depth,
                active: entry.active,
                last_used_at: entry.last_used_at,
            })
            .collect()
    }

    /// Run `work` on the given lane, after everything enqueued before it on
    /// the same lane has finished. Fails fast with `QueueOverflow` when the
    /// global depth cap is reached; the failed call never joins the lane.
    pub async fn enqueue<T, F>(&self, lane_key: &str, work: F) -> Result<T, LaneError>
    where
        F: std::future::Future<Output = T>,
    {
        let gate = {
            let mut lanes = self.lanes.lock().expect("lane map poisoned");
            let depth = self.total_depth.load(Ordering::SeqCst);
            if depth >= self.max_depth {
                return Err(LaneError::QueueOverflow {
                    depth,
                    max: self.max_depth,
                });
            }
            self.total_depth.fetch_add(1, Ordering::SeqCst);

            let entry = lanes.entry(lane_key.to_string()).or_insert_with(|| LaneEntry {
                gate: Arc::new(tokio::sync::Mutex::new(())),
                depth: 0,
                active: 0,
                last_used_at: Utc::now(),
            });
            entry.depth += 1;
            entry.last_used_at = Utc::now();

            self.bus.emit(
                "lane_enqueue",
                serde_json::json!({
                    "lane": lane_key,
                    "depth": entry.depth,
                    "active": entry.active,
                    "total_depth": depth + 1,
                }),
            );
            Arc::clone(&entry.gate)
        };

        // FIFO: tokio's mutex queues waiters in lock-call order.
        let _guard = gate.lock().await;

        let ticket = LaneTicket {
            queue: self,
            lane_key: lane_key.to_string(),
        };

        {
            let mut lanes = self.lanes.lock().expect("lane map poisoned");
            if let Some(entry) = lanes.get_mut(lane_key) {
                entry.active += 1;
                self.bus.emit(
                    "lane_start",
                    serde_json::json!({
                        "lane": lane_key,
                        "depth": entry.depth,
                        "active": entry.active,
                        "total_depth": self.total_depth.load(Ordering::SeqCst),
                    }),
                );
            }
        }

        let result = work.await;
        drop(ticket);
        Ok(result)
    }
}
