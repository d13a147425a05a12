//! The memory store: raw conversation log, markdown tiers, long-term
//! notes, SOUL, and compaction.
//!
//! Layout under the runtime home:
//! - `memory/raw.jsonl` — append-only conversation turns
//! - `memory/compact.jsonl` — long-term notes and compaction summaries
//! - `workspace/MEMORY.md` — curated long-term markdown
//! - `workspace/SOUL.md` — identity and principles
//! - `workspace/memory/YYYY-MM-DD.md` — daily logs
//! - `workspace/memory/sessions/<key>.md` — per-session logs
//! - `workspace/memory/soul-journal/YYYY-MM-DD.md` — identity journal
//! - `workspace/memory/compact-md/compact-<ts>.md` — compaction summaries

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::Config;
use crate::fsutil;
use crate::memory::chunker::content_hash;
use crate::memory::embeddings::{self, EmbeddingProvider};
use crate::memory::index::{
    self, tokenize, EmbeddingCache, IndexSource, KnowledgeChunk, KnowledgeIndex, SourceType,
};
use crate::memory::search::{self, SearchHit, SearchOptions, SearchWeights};
use crate::memory::MemoryError;

/// Raw count past which the runtime triggers a compaction pass.
pub const COMPACTION_THRESHOLD: usize = 120;
/// Recent entries kept out of any compaction batch.
const COMPACTION_KEEP_RECENT: usize = 80;
/// Default number of entries moved per compaction.
const COMPACTION_BATCH: usize = 250;
/// Window for the near-duplicate filter on raw appends.
const DUPLICATE_WINDOW_HOURS: i64 = 6;

fn health_ping_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(ping|health[-_ ]?check|heartbeat|are you (up|alive|there)\??|status\?)$")
            .expect("static regex")
    })
}

fn importance_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(important|remember|decision|deadline|milestone|credential|commit|promise|birthday|anniversary)\b",
        )
        .expect("static regex")
    })
}

/// Whether a reply is worth a soul-journal entry.
pub fn is_important(text: &str) -> bool {
    importance_regex().is_match(text)
}

/// One conversation turn in the raw log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEntry {
    pub id: String,
    pub actor: String,
    pub content: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub session_key: Option<String>,
}

/// Long-term note or compaction summary in `compact.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteEntry {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub compacted_range: Option<(String, String)>,
    #[serde(default)]
    pub compacted_count: Option<usize>,
    #[serde(default)]
    pub markdown_path: Option<String>,
}

/// Store counters for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub raw_entries: usize,
    pub notes: usize,
    pub indexed_chunks: usize,
    pub cached_embeddings: usize,
    pub embedding_model: String,
    pub vector_dims: usize,
    pub last_index_error: Option<String>,
    pub index_dirty: bool,
}

/// Multi-layer knowledge store with hybrid retrieval.
pub struct MemoryStore {
    raw_path: PathBuf,
    compact_path: PathBuf,
    main_md_path: PathBuf,
    soul_path: PathBuf,
    memory_md_dir: PathBuf,
    index_path: PathBuf,
    cache_path: PathBuf,
    extra_paths: Vec<PathBuf>,
    session_memory_enabled: bool,
    vectors_enabled: bool,
    batch_size: usize,
    weights: SearchWeights,
    provider: Box<dyn EmbeddingProvider>,
    raw: RwLock<Vec<RawEntry>>,
    notes_count: RwLock<usize>,
    index: RwLock<KnowledgeIndex>,
    cache: Mutex<EmbeddingCache>,
    index_dirty: AtomicBool,
    last_index_error: StdMutex<Option<String>>,
    /// Serializes reindex passes; concurrent callers wait for the running one.
    sync_lock: Mutex<()>,
}

impl MemoryStore {
    /// Build the store from config, loading the raw log and embedding cache
    /// and seeding the cache with vectors from the persisted index.
    pub fn new(config: &Config) -> Result<Self, MemoryError> {
        let raw_path = config.memory_dir().join("raw.jsonl");
        let compact_path = config.memory_dir().join("compact.jsonl");
        let raw: Vec<RawEntry> = fsutil::read_jsonl(&raw_path)?;
        let notes: Vec<NoteEntry> = fsutil::read_jsonl(&compact_path)?;

        let cache_path = config.embedding_cache_path();
        let mut cache = if config.memory.vector.cache_enabled {
            EmbeddingCache::load(&cache_path)
        } else {
            EmbeddingCache::default()
        };
        let index_path = config.memory_index_path();
        for (hash, vector) in index::load_prior_vectors(&index_path) {
            if cache.get(&hash).is_none() {
                cache.insert(hash, vector);
            }
        }

        let provider = embeddings::create_provider(&config.memory.vector);
        tracing::info!(
            "memory store: {} raw entries, {} notes, embeddings via {}",
            raw.len(),
            notes.len(),
            provider.model_name()
        );

        Ok(Self {
            raw_path,
            compact_path,
            main_md_path: config.workspace_dir().join("MEMORY.md"),
            soul_path: config.workspace_dir().join("SOUL.md"),
            memory_md_dir: config.workspace_memory_dir(),
            index_path,
            cache_path,
            extra_paths: config.memory.extra_paths.clone(),
            session_memory_enabled: config.memory.session_memory_enabled,
            vectors_enabled: config.memory.vector.enabled,
            batch_size: config.memory.vector.batch_size,
            weights: SearchWeights::resolve(
                config.memory.search.vector_weight,
                config.memory.search.text_weight,
                config.memory.search.min_score,
            ),
            provider,
            raw: RwLock::new(raw),
            notes_count: RwLock::new(notes.len()),
            index: RwLock::new(KnowledgeIndex::default()),
            cache: Mutex::new(cache),
            index_dirty: AtomicBool::new(true),
            last_index_error: StdMutex::new(None),
            sync_lock: Mutex::new(()),
        })
    }

    /// Sanitized session key safe for a filename.
    pub fn safe_session_key(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect()
    }

    /// Path of a session's markdown file.
    pub fn session_file(&self, session_key: &str) -> PathBuf {
        self.memory_md_dir
            .join("sessions")
            .join(format!("{}.md", Self::safe_session_key(session_key)))
    }

    fn daily_file(&self, at: DateTime<Utc>) -> PathBuf {
        self.memory_md_dir.join(format!("{}.md", at.format("%Y-%m-%d")))
    }

    fn soul_journal_file(&self, at: DateTime<Utc>) -> PathBuf {
        self.memory_md_dir
            .join("soul-journal")
            .join(format!("{}.md", at.format("%Y-%m-%d")))
    }

    /// Mark the index stale; the next search or watch tick re-syncs.
    pub fn mark_index_dirty(&self) {
        self.index_dirty.store(true, Ordering::SeqCst);
    }

    pub fn index_is_dirty(&self) -> bool {
        self.index_dirty.load(Ordering::SeqCst)
    }

    // ==================== Write paths ====================

    /// Append one conversation turn. Health pings and near-duplicates (same
    /// actor, source, and content within six hours) are dropped; returns
    /// `None` for a skipped entry.
    pub async fn record_conversation(
        &self,
        actor: &str,
        content: &str,
        source: &str,
        tags: Vec<String>,
        session_key: Option<&str>,
    ) -> Result<Option<RawEntry>, MemoryError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if health_ping_regex().is_match(trimmed) {
            tracing::debug!("skipping health ping from {}", source);
            return Ok(None);
        }

        let now = Utc::now();
        {
            let raw = self.raw.read().await;
            let cutoff = now - Duration::hours(DUPLICATE_WINDOW_HOURS);
            let duplicate = raw.iter().rev().take_while(|e| e.created_at >= cutoff).any(|e| {
                e.actor == actor && e.source == source && e.content.trim() == trimmed
            });
            if duplicate {
                tracing::debug!("skipping near-duplicate {} entry from {}", actor, source);
                return Ok(None);
            }
        }

        let entry = RawEntry {
            id: Uuid::new_v4().to_string(),
            actor: actor.to_string(),
            content: trimmed.to_string(),
            source: source.to_string(),
            tags,
            created_at: now,
            session_key: session_key.map(String::from),
        };

        fsutil::append_jsonl(&self.raw_path, &entry)?;
        let heading = format!("## {} {}\n\n{}\n", now.format("%H:%M:%S"), actor, trimmed);
        fsutil::append_line(&self.daily_file(now), &heading)?;

        if self.session_memory_enabled {
            if let Some(key) = session_key {
                fsutil::append_line(&self.session_file(key), &heading)?;
            }
        }

        self.raw.write().await.push(entry.clone());
        self.mark_index_dirty();
        Ok(Some(entry))
    }

    /// Append a long-term note to the compact log and mirror it into the
    /// main markdown file.
    pub async fn add_note(
        &self,
        title: &str,
        content: &str,
        source: &str,
        tags: Vec<String>,
    ) -> Result<NoteEntry, MemoryError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(MemoryError::InvalidInput("note title must not be empty".to_string()));
        }

        let now = Utc::now();
        let note = NoteEntry {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            content: content.trim().to_string(),
            source: source.to_string(),
            tags,
            created_at: now,
            compacted_range: None,
            compacted_count: None,
            markdown_path: None,
        };

        fsutil::append_jsonl(&self.compact_path, &note)?;
        let block = format!(
            "## {} — {}\n\n{}\n",
            now.format("%Y-%m-%d %H:%M"),
            note.title,
            note.content
        );
        fsutil::append_line(&self.main_md_path, &block)?;

        *self.notes_count.write().await += 1;
        self.mark_index_dirty();
        Ok(note)
    }

    /// Current SOUL text (empty when the file does not exist yet).
    pub fn read_soul(&self) -> Result<String, MemoryError> {
        Ok(fsutil::read_text_or_empty(&self.soul_path)?)
    }

    /// Write the SOUL file. Replace snapshots the prior text into today's
    /// soul journal first; append adds a timestamped update heading.
    pub fn write_soul(&self, content: &str, replace: bool) -> Result<(), MemoryError> {
        let now = Utc::now();
        if replace {
            let previous = fsutil::read_text_or_empty(&self.soul_path)?;
            if !previous.trim().is_empty() {
                self.append_soul_journal(&format!(
                    "Replaced SOUL; previous text preserved below.\n\n{}",
                    previous.trim()
                ))?;
            }
            let mut text = content.trim_end().to_string();
            text.push('\n');
            fsutil::write_atomic(&self.soul_path, text.as_bytes())?;
        } else {
            let block = format!("\n## Update {}\n\n{}\n", now.format("%Y-%m-%d %H:%M"), content.trim());
            fsutil::append_line(&self.soul_path, &block)?;
            self.append_soul_journal(content.trim())?;
        }
        self.mark_index_dirty();
        Ok(())
    }

    /// Append a timestamped entry to today's soul journal.
    pub fn append_soul_journal(&self, text: &str) -> Result<(), MemoryError> {
        let now = Utc::now();
        let block = format!("## {}\n\n{}\n", now.format("%H:%M:%S"), text.trim());
        fsutil::append_line(&self.soul_journal_file(now), &block)?;
        Ok(())
    }

    // ==================== Retrieval ====================

    /// Most recent raw entries, newest last.
    pub async fn recent(&self, limit: usize) -> Vec<RawEntry> {
        let raw = self.raw.read().await;
        let skip = raw.len().saturating_sub(limit);
        raw[skip..].to_vec()
    }

    pub async fn raw_count(&self) -> usize {
        self.raw.read().await.len()
    }

    /// Hybrid search. Re-syncs a dirty index first; an index failure is
    /// recorded but search still runs over whatever was indexed.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        options: SearchOptions,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        if self.index_is_dirty() {
            if let Err(e) = self.sync_knowledge_index().await {
                tracing::warn!("reindex before search failed: {}", e);
            }
        }

        let query_vector = if self.vectors_enabled {
            match self.provider.embed(query).await {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("query embedding failed, text-only search: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let extra = self.raw_chunks_for(&options).await;
        let session_file = options.session_key.as_deref().map(|k| self.session_file(k));

        let index = self.index.read().await;
        Ok(search::rank(
            &index,
            &extra,
            query,
            query_vector.as_deref(),
            self.weights,
            &options,
            session_file.as_deref(),
            limit.clamp(1, 50),
        ))
    }

    /// Transient chunks over in-memory raw entries for strict-mode search.
    async fn raw_chunks_for(&self, options: &SearchOptions) -> Vec<KnowledgeChunk> {
        let Some(key) = options.session_key.as_deref() else {
            return Vec::new();
        };
        if options.mode != search::SearchMode::SessionStrict {
            return Vec::new();
        }
        let session_file = self.session_file(key);
        let raw = self.raw.read().await;
        raw.iter()
            .filter(|e| e.session_key.as_deref() == Some(key))
            .map(|e| {
                let tokens = tokenize(&e.content);
                let doc_len = tokens.len();
                let mut term_freq: HashMap<String, u32> = HashMap::new();
                for t in tokens {
                    *term_freq.entry(t).or_default() += 1;
                }
                KnowledgeChunk {
                    content_hash: content_hash(&e.content),
                    text: e.content.clone(),
                    path: session_file.clone(),
                    source_type: SourceType::Raw,
                    start_line: 0,
                    end_line: 0,
                    vector: Vec::new(),
                    term_freq,
                    doc_len,
                }
            })
            .collect()
    }

    /// Short bounded context block injected into every prompt: main-memory
    /// excerpts, SOUL section summaries, and recent daily excerpts.
    pub fn working_memory_context(&self) -> Result<String, MemoryError> {
        let mut out = String::new();

        let main = fsutil::read_text_or_empty(&self.main_md_path)?;
        let main_sections = last_sections(&main, 4, 400);
        if !main_sections.is_empty() {
            out.push_str("### Long-term memory\n");
            for section in main_sections {
                out.push_str(&section);
                out.push('\n');
            }
        }

        let soul = fsutil::read_text_or_empty(&self.soul_path)?;
        let soul_lines = section_summaries(&soul, 3);
        if !soul_lines.is_empty() {
            out.push_str("### Identity\n");
            for line in soul_lines {
                out.push_str(&format!("- {line}\n"));
            }
        }

        let now = Utc::now();
        let mut daily_sections = Vec::new();
        for day in [now, now - Duration::days(1)] {
            let text = fsutil::read_text_or_empty(&self.daily_file(day))?;
            daily_sections.extend(last_sections(&text, 3, 300));
            if daily_sections.len() >= 6 {
                daily_sections.truncate(6);
                break;
            }
        }
        if !daily_sections.is_empty() {
            out.push_str("### Recent days\n");
            for section in daily_sections {
                out.push_str(&section);
                out.push('\n');
            }
        }

        Ok(out)
    }

    // ==================== Indexing ====================

    fn collect_sources(&self) -> Vec<IndexSource> {
        let mut sources = Vec::new();

        let push = |sources: &mut Vec<IndexSource>, path: PathBuf, source_type: SourceType| {
            if let Ok(content) = std::fs::read_to_string(&path) {
                if !content.trim().is_empty() {
                    sources.push(IndexSource {
                        path,
                        source_type,
                        content,
                    });
                }
            }
        };

        push(&mut sources, self.main_md_path.clone(), SourceType::MemoryMain);
        push(&mut sources, self.soul_path.clone(), SourceType::Soul);

        for path in fsutil::walk_files(&self.memory_md_dir, "md") {
            let source_type = if path.starts_with(self.memory_md_dir.join("sessions")) {
                SourceType::Session
            } else if path.starts_with(self.memory_md_dir.join("soul-journal")) {
                SourceType::Soul
            } else if path.starts_with(self.memory_md_dir.join("compact-md")) {
                SourceType::Compact
            } else {
                SourceType::MemoryDaily
            };
            push(&mut sources, path, source_type);
        }

        for root in &self.extra_paths {
            for path in fsutil::walk_files(root, "md") {
                push(&mut sources, path, SourceType::Extra);
            }
        }

        sources
    }

    /// Rebuild the knowledge index from the markdown tiers. Serialized by
    /// an internal guard; concurrent callers queue behind the running pass.
    pub async fn sync_knowledge_index(&self) -> Result<index::SyncReport, MemoryError> {
        let _guard = self.sync_lock.lock().await;

        // Another caller may have finished the work while we waited.
        if !self.index_is_dirty() {
            let index = self.index.read().await;
            return Ok(index::SyncReport {
                chunks: index.len(),
                embedded: 0,
                reused: 0,
            });
        }

        let sources = self.collect_sources();
        let mut index = self.index.write().await;
        let mut cache = self.cache.lock().await;

        let result = index::sync_index(
            &mut index,
            &mut cache,
            self.provider.as_ref(),
            &sources,
            &self.index_path,
            &self.cache_path,
            self.vectors_enabled,
            self.batch_size,
        )
        .await;

        match result {
            Ok(report) => {
                self.index_dirty.store(false, Ordering::SeqCst);
                *self.last_index_error.lock().expect("index error lock") = None;
                tracing::debug!(
                    "index synced: {} chunks ({} embedded, {} reused)",
                    report.chunks,
                    report.embedded,
                    report.reused
                );
                Ok(report)
            }
            Err(e) => {
                *self.last_index_error.lock().expect("index error lock") = Some(e.to_string());
                Err(e)
            }
        }
    }

    // ==================== Compaction ====================

    /// Compact when the raw log exceeds the runtime threshold.
    pub async fn compact_if_needed(&self) -> Result<Option<NoteEntry>, MemoryError> {
        if self.raw_count().await > COMPACTION_THRESHOLD {
            self.compact_now("threshold").await
        } else {
            Ok(None)
        }
    }

    /// Move a batch of the oldest raw entries into a summarized long-term
    /// record. Returns `None` when there is not enough history to compact.
    pub async fn compact_now(&self, reason: &str) -> Result<Option<NoteEntry>, MemoryError> {
        let now = Utc::now();
        let batch: Vec<RawEntry> = {
            let raw = self.raw.read().await;
            if raw.len() <= COMPACTION_KEEP_RECENT {
                return Ok(None);
            }
            let take = COMPACTION_BATCH.min(raw.len() - COMPACTION_KEEP_RECENT);
            raw[..take].to_vec()
        };
        if batch.is_empty() {
            return Ok(None);
        }

        // Memory flush: salient keywords and key events go to the daily and
        // long-term files before the batch disappears from the raw log.
        let key_events: Vec<&RawEntry> = batch
            .iter()
            .filter(|e| importance_regex().is_match(&e.content))
            .take(10)
            .collect();
        let keywords = top_keywords(&batch, 8);

        let mut flush = format!("## {} memory flush\n\n", now.format("%H:%M:%S"));
        if !keywords.is_empty() {
            flush.push_str(&format!("Keywords: {}\n", keywords.join(", ")));
        }
        for event in &key_events {
            flush.push_str(&format!("- [{}] {}\n", event.actor, truncate(&event.content, 160)));
        }
        fsutil::append_line(&self.daily_file(now), &flush)?;
        fsutil::append_line(&self.main_md_path, &flush)?;

        // Summary note.
        let first = batch.first().expect("non-empty batch");
        let last = batch.last().expect("non-empty batch");
        let mut actor_counts: HashMap<&str, usize> = HashMap::new();
        for entry in &batch {
            *actor_counts.entry(entry.actor.as_str()).or_default() += 1;
        }
        let actors = actor_counts
            .iter()
            .map(|(actor, count)| format!("{actor}: {count}"))
            .collect::<Vec<_>>()
            .join(", ");

        let md_name = format!("compact-{}.md", now.timestamp_millis());
        let md_path = self.memory_md_dir.join("compact-md").join(&md_name);

        let mut content = format!(
            "Compacted {} raw entries ({}). Range {} .. {}. Turns by actor: {}.",
            batch.len(),
            reason,
            first.created_at.format("%Y-%m-%d %H:%M"),
            last.created_at.format("%Y-%m-%d %H:%M"),
            actors
        );
        if !keywords.is_empty() {
            content.push_str(&format!(" Keywords: {}.", keywords.join(", ")));
        }
        if !key_events.is_empty() {
            content.push_str(&format!(" {} key events retained.", key_events.len()));
        }

        let note = NoteEntry {
            id: Uuid::new_v4().to_string(),
            title: format!("Compaction {}", now.format("%Y-%m-%d %H:%M")),
            content: content.clone(),
            source: "compaction".to_string(),
            tags: vec!["compaction".to_string()],
            created_at: now,
            compacted_range: Some((first.id.clone(), last.id.clone())),
            compacted_count: Some(batch.len()),
            markdown_path: Some(md_path.display().to_string()),
        };

        let mut md = format!("# Compaction {}\n\n{}\n", now.format("%Y-%m-%d %H:%M"), content);
        if !key_events.is_empty() {
            md.push_str("\n## Key events\n\n");
            for event in &key_events {
                md.push_str(&format!(
                    "- {} [{}] {}\n",
                    event.created_at.format("%Y-%m-%d %H:%M"),
                    event.actor,
                    truncate(&event.content, 240)
                ));
            }
        }
        fsutil::write_atomic(&md_path, md.as_bytes())?;

        fsutil::append_jsonl(&self.compact_path, &note)?;
        fsutil::append_line(
            &self.main_md_path,
            &format!("## {} — {}\n\n{}\n", now.format("%Y-%m-%d %H:%M"), note.title, content),
        )?;
        self.append_soul_journal(&format!("Compacted {} older memories into {}", batch.len(), md_name))?;

        // Rewrite the raw log without the compacted batch.
        {
            let mut raw = self.raw.write().await;
            raw.drain(..batch.len());
            let mut lines = String::new();
            for entry in raw.iter() {
                lines.push_str(&serde_json::to_string(entry).map_err(|e| {
                    MemoryError::InvalidInput(format!("unserializable raw entry: {e}"))
                })?);
                lines.push('\n');
            }
            fsutil::write_atomic(&self.raw_path, lines.as_bytes())?;
        }

        *self.notes_count.write().await += 1;
        self.mark_index_dirty();
        if let Err(e) = self.sync_knowledge_index().await {
            tracing::warn!("post-compaction reindex failed: {}", e);
        }

        tracing::info!("compacted {} raw entries ({})", batch.len(), reason);
        Ok(Some(note))
    }

    // ==================== Stats ====================

    pub async fn stats(&self) -> MemoryStats {
        MemoryStats {
            raw_entries: self.raw.read().await.len(),
            notes: *self.notes_count.read().await,
            indexed_chunks: self.index.read().await.len(),
            cached_embeddings: self.cache.lock().await.len(),
            embedding_model: self.provider.model_name().to_string(),
            vector_dims: self.provider.dimension(),
            last_index_error: self.last_index_error.lock().expect("index error lock").clone(),
            index_dirty: self.index_is_dirty(),
        }
    }

    /// Directories the watcher should poll for markdown changes.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.memory_md_dir.clone()];
        if let Some(parent) = self.main_md_path.parent() {
            roots.push(parent.to_path_buf());
        }
        roots.extend(self.extra_paths.clone());
        roots
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

/// Last `count` `##` sections of a markdown document, each clipped to
/// `max_chars`.
fn last_sections(content: &str, count: usize, max_chars: usize) -> Vec<String> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        if line.starts_with("## ") && !current.trim().is_empty() {
            sections.push(current.clone());
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    let skip = sections.len().saturating_sub(count);
    sections
        .into_iter()
        .skip(skip)
        .map(|s| truncate(s.trim(), max_chars))
        .collect()
}

/// First line of up to `count` `##` sections: section titles as one-liners.
fn section_summaries(content: &str, count: usize) -> Vec<String> {
    content
        .lines()
        .filter(|l| l.starts_with("## "))
        .take(count)
        .map(|l| l.trim_start_matches('#').trim().to_string())
        .collect()
}

/// Most frequent interesting tokens across a batch of entries.
fn top_keywords(batch: &[RawEntry], count: usize) -> Vec<String> {
    let mut freq: HashMap<String, usize> = HashMap::new();
    for entry in batch {
        for token in tokenize(&entry.content) {
            *freq.entry(token).or_default() += 1;
        }
    }
    let mut pairs: Vec<(String, usize)> = freq.into_iter().collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    pairs.into_iter().take(count).map(|(t, _)| t).collect()
}
