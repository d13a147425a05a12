//! Append-only observability bus.
//!
//! Every subsystem reports through `emit()`. Events get a monotonic
//! sequence number and millisecond timestamp, land in a bounded in-memory
//! ring, are handed to live listeners synchronously, and are batched out to
//! an events JSONL file with a debounced flush and single-backup rotation.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub seq: u64,
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

type Listener = Box<dyn Fn(&BusEvent) + Send + Sync>;

struct BusState {
    ring: VecDeque<BusEvent>,
    listeners: Vec<(u64, Arc<Listener>)>,
    pending: Vec<BusEvent>,
}

/// In-memory ring + JSONL sink.
pub struct EventBus {
    path: PathBuf,
    buffer_size: usize,
    max_file_bytes: u64,
    flush_delay: Duration,
    seq: AtomicU64,
    next_listener_id: AtomicU64,
    flush_scheduled: AtomicBool,
    state: Mutex<BusState>,
    /// Back-reference for the flusher task spawned from `emit`.
    me: OnceLock<Weak<EventBus>>,
}

impl EventBus {
    /// Create a bus writing to `path` with the given ring size and rotation
    /// threshold.
    pub fn new(path: PathBuf, buffer_size: usize, max_file_bytes: u64) -> Arc<Self> {
        let bus = Arc::new(Self {
            path,
            buffer_size: buffer_size.max(16),
            max_file_bytes: max_file_bytes.max(64 * 1024),
            flush_delay: Duration::from_millis(250),
            seq: AtomicU64::new(1),
            next_listener_id: AtomicU64::new(1),
            flush_scheduled: AtomicBool::new(false),
            state: Mutex::new(BusState {
                ring: VecDeque::new(),
                listeners: Vec::new(),
                pending: Vec::new(),
            }),
            me: OnceLock::new(),
        });
        let _ = bus.me.set(Arc::downgrade(&bus));
        bus
    }

    /// Emit an event. Listener callbacks run synchronously on the caller;
    /// the file write is deferred to the debounced flusher.
    pub fn emit(&self, kind: &str, payload: serde_json::Value) -> u64 {
        let event = BusEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            ts: chrono::Utc::now().timestamp_millis(),
            kind: kind.to_string(),
            payload,
        };
        let seq = event.seq;

        let listeners: Vec<Arc<Listener>> = {
            let mut state = self.state.lock().expect("event bus poisoned");
            state.ring.push_back(event.clone());
            while state.ring.len() > self.buffer_size {
                state.ring.pop_front();
            }
            state.pending.push(event.clone());
            state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        for listener in listeners {
            listener(&event);
        }

        self.schedule_flush();
        seq
    }

    /// Register a listener. Returns an id for `off()`.
    pub fn on(&self, listener: impl Fn(&BusEvent) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("event bus poisoned");
        state.listeners.push((id, Arc::new(Box::new(listener))));
        id
    }

    /// Remove a listener registered with `on()`.
    pub fn off(&self, id: u64) {
        let mut state = self.state.lock().expect("event bus poisoned");
        state.listeners.retain(|(lid, _)| *lid != id);
    }

    /// Most recent `limit` events from the ring, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<BusEvent> {
        let state = self.state.lock().expect("event bus poisoned");
        let skip = state.ring.len().saturating_sub(limit);
        state.ring.iter().skip(skip).cloned().collect()
    }

    fn schedule_flush(&self) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = tokio::runtime::Handle::try_current().ok();
        let bus = self.me.get().and_then(Weak::upgrade);
        let (Some(handle), Some(bus)) = (handle, bus) else {
            // No runtime (e.g. sync CLI path); the next flush_now picks it up.
            self.flush_scheduled.store(false, Ordering::SeqCst);
            return;
        };
        handle.spawn(async move {
            tokio::time::sleep(bus.flush_delay).await;
            bus.flush_scheduled.store(false, Ordering::SeqCst);
            bus.flush_now();
        });
    }

    /// Write any pending batch to disk immediately. A failed write drops the
    /// batch; the in-memory ring stays intact.
    pub fn flush_now(&self) {
        let batch: Vec<BusEvent> = {
            let mut state = self.state.lock().expect("event bus poisoned");
            std::mem::take(&mut state.pending)
        };
        if batch.is_empty() {
            return;
        }

        let mut lines = String::new();
        for event in &batch {
            match serde_json::to_string(event) {
                Ok(line) => {
                    lines.push_str(&line);
                    lines.push('\n');
                }
                Err(e) => tracing::warn!("unserializable event dropped: {}", e),
            }
        }

        self.rotate_if_needed(lines.len() as u64);

        if let Err(e) = append_all(&self.path, &lines) {
            tracing::warn!("event flush failed, dropping {} events: {}", batch.len(), e);
        }
    }

    fn rotate_if_needed(&self, incoming: u64) {
        let current = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current == 0 || current + incoming <= self.max_file_bytes {
            return;
        }
        let backup = self.path.with_extension("jsonl.1");
        if let Err(e) = std::fs::rename(&self.path, &backup) {
            tracing::warn!("event log rotation failed: {}", e);
        } else {
            tracing::debug!("rotated event log to {}", backup.display());
        }
    }
}

fn append_all(path: &std::path::Path, text: &str) -> std::io::Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bus_in(dir: &std::path::Path) -> Arc<EventBus> {
        EventBus::new(dir.join("events.jsonl"), 64, 1024 * 1024)
    }

    #[tokio::test]
    async fn test_seq_is_monotonic() {
        let dir = tempdir().unwrap();
        let bus = bus_in(dir.path());

        let a = bus.emit("one", serde_json::json!({}));
        let b = bus.emit("two", serde_json::json!({}));
        let c = bus.emit("three", serde_json::json!({}));
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_ring_is_bounded() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path().join("events.jsonl"), 16, 1024 * 1024);

        for i in 0..100 {
            bus.emit("tick", serde_json::json!({ "i": i }));
        }

        let recent = bus.recent(1000);
        assert_eq!(recent.len(), 16);
        assert_eq!(recent.last().unwrap().payload["i"], 99);
    }

    #[tokio::test]
    async fn test_listener_receives_and_unsubscribes() {
        let dir = tempdir().unwrap();
        let bus = bus_in(dir.path());

        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = Arc::clone(&seen);
        let id = bus.on(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("a", serde_json::json!({}));
        bus.emit("b", serde_json::json!({}));
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        bus.off(id);
        bus.emit("c", serde_json::json!({}));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flush_writes_jsonl() {
        let dir = tempdir().unwrap();
        let bus = bus_in(dir.path());

        bus.emit("task_start", serde_json::json!({ "id": "t1" }));
        bus.flush_now();

        let text = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        let event: BusEvent = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(event.kind, "task_start");
        assert_eq!(event.payload["id"], "t1");
    }

    #[tokio::test]
    async fn test_rotation_keeps_single_backup() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new(dir.path().join("events.jsonl"), 16, 64 * 1024);

        // Overshoot the rotation threshold in two flushes.
        let big = "x".repeat(40 * 1024);
        bus.emit("blob", serde_json::json!({ "data": big.clone() }));
        bus.flush_now();
        bus.emit("blob", serde_json::json!({ "data": big }));
        bus.flush_now();

        assert!(dir.path().join("events.jsonl").exists());
        assert!(dir.path().join("events.jsonl.1").exists());
    }

    #[tokio::test]
    async fn test_recent_respects_limit() {
        let dir = tempdir().unwrap();
        let bus = bus_in(dir.path());
        for i in 0..10 {
            bus.emit("tick", serde_json::json!({ "i": i }));
        }
        let last3 = bus.recent(3);
        assert_eq!(last3.len(), 3);
        assert_eq!(last3[0].payload["i"], 7);
        assert_eq!(last3[2].payload["i"], 9);
    }
}
