//! Markdown change watcher.
//!
//! Polls the memory roots for `.md` modification-time changes and schedules
//! a debounced reindex (~1.2 s after the last observed change), so edits
//! made outside the runtime still land in the knowledge index.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;

use crate::fsutil;
use crate::memory::store::MemoryStore;

/// Default debounce after the last observed markdown change.
pub const REINDEX_DEBOUNCE: Duration = Duration::from_millis(1200);
/// Default poll cadence.
pub const POLL_INTERVAL: Duration = Duration::from_millis(600);

/// Handle to the background watcher task.
pub struct MemoryWatcher {
    handle: JoinHandle<()>,
}

impl MemoryWatcher {
    /// Spawn the watcher over the store's markdown roots.
    pub fn spawn(store: Arc<MemoryStore>) -> Self {
        Self::spawn_with(store, POLL_INTERVAL, REINDEX_DEBOUNCE)
    }

    /// Spawn with explicit timings (tests shrink them).
    pub fn spawn_with(store: Arc<MemoryStore>, poll: Duration, debounce: Duration) -> Self {
        let roots = store.watch_roots();
        let handle = tokio::spawn(async move {
            watch_loop(store, roots, poll, debounce).await;
        });
        Self { handle }
    }

    /// Stop watching. Idempotent.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn scan(roots: &[PathBuf]) -> HashMap<PathBuf, SystemTime> {
    let mut seen = HashMap::new();
    for root in roots {
        for path in fsutil::walk_files(root, "md") {
            if let Ok(meta) = std::fs::metadata(&path) {
                if let Ok(modified) = meta.modified() {
                    seen.insert(path, modified);
                }
            }
        }
    }
    seen
}

async fn watch_loop(
    store: Arc<MemoryStore>,
    roots: Vec<PathBuf>,
    poll: Duration,
    debounce: Duration,
) {
    let mut known = scan(&roots);
    let mut pending_since: Option<tokio::time::Instant> = None;
    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        let current = scan(&roots);
        let changed = current.len() != known.len()
            || current
                .iter()
                .any(|(path, mtime)| known.get(path) != Some(mtime));
        if changed {
            known = current;
            pending_since = Some(tokio::time::Instant::now());
            store.mark_index_dirty();
        }

        if let Some(since) = pending_since {
            if since.elapsed() >= debounce {
                pending_since = None;
                if let Err(e) = store.sync_knowledge_index().await {
                    tracing::warn!("watch-driven reindex failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_watcher_reindexes_after_external_edit() {
        let dir = tempdir().unwrap();
        let mut config = Config::load(dir.path().to_path_buf());
        config.memory.vector.provider = "local".to_string();
        config.memory.vector.dims = 32;
        config.ensure_layout().unwrap();
        let store = Arc::new(MemoryStore::new(&config).unwrap());

        // Settle the initial (empty) index.
        store.sync_knowledge_index().await.unwrap();
        assert!(!store.index_is_dirty());

        let watcher = MemoryWatcher::spawn_with(
            Arc::clone(&store),
            Duration::from_millis(20),
            Duration::from_millis(40),
        );

        // Simulate an external edit to a daily file.
        std::fs::write(
            config.workspace_memory_dir().join("2026-01-01.md"),
            "## 10:00 user\nan externally written fact about lighthouses\n",
        )
        .unwrap();

        // Give the watcher time to notice, debounce, and resync.
        let mut synced = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !store.index_is_dirty() && store.stats().await.indexed_chunks > 0 {
                synced = true;
                break;
            }
        }
        watcher.stop();
        assert!(synced, "watcher never picked up the external edit");

        let hits = store
            .search("lighthouses", 5, Default::default())
            .await
            .unwrap();
        assert!(!hits.is_empty());
    }

    #[tokio::test]
    async fn test_stop_aborts_task() {
        let dir = tempdir().unwrap();
        let mut config = Config::load(dir.path().to_path_buf());
        config.memory.vector.provider = "local".to_string();
        config.ensure_layout().unwrap();
        let store = Arc::new(MemoryStore::new(&config).unwrap());

        let watcher = MemoryWatcher::spawn_with(
            store,
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        watcher.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(watcher.handle.is_finished());
    }
}
