//! Knowledge index: chunk inventory, term statistics, and the hash-keyed
//! embedding cache.
//!
//! The index is rebuilt from the markdown tiers on demand. Vectors are
//! reused for any chunk whose content hash appeared in the previous index
//! or in the embedding cache; only genuinely new text reaches the provider.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fsutil;
use crate::memory::chunker::{self, TextChunk};
use crate::memory::embeddings::EmbeddingProvider;

/// Where a chunk came from; drives scoring boosts and session scoping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    MemoryMain,
    MemoryDaily,
    Session,
    Extra,
    Soul,
    Compact,
    Raw,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::MemoryMain => "memory_main",
            SourceType::MemoryDaily => "memory_daily",
            SourceType::Session => "session",
            SourceType::Extra => "extra",
            SourceType::Soul => "soul",
            SourceType::Compact => "compact",
            SourceType::Raw => "raw",
        }
    }
}

/// One indexed slice of a source file.
#[derive(Debug, Clone)]
pub struct KnowledgeChunk {
    pub content_hash: String,
    pub text: String,
    pub path: PathBuf,
    pub source_type: SourceType,
    pub start_line: usize,
    pub end_line: usize,
    pub vector: Vec<f32>,
    /// Term frequencies for BM25, derived from `text`.
    pub term_freq: HashMap<String, u32>,
    pub doc_len: usize,
}

/// Disk form of a chunk: everything except the text and term stats, which
/// are rebuilt from the markdown on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedChunk {
    content_hash: String,
    path: PathBuf,
    source_type: SourceType,
    start_line: usize,
    end_line: usize,
    vector: Vec<f32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedIndex {
    #[serde(default)]
    dims: usize,
    #[serde(default)]
    chunks: Vec<PersistedChunk>,
}

/// A source document to index.
pub struct IndexSource {
    pub path: PathBuf,
    pub source_type: SourceType,
    pub content: String,
}

/// In-memory index over all chunks.
#[derive(Default)]
pub struct KnowledgeIndex {
    pub chunks: Vec<KnowledgeChunk>,
    pub doc_freq: HashMap<String, usize>,
    pub avg_doc_len: f32,
}

impl KnowledgeIndex {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn recompute_stats(&mut self) {
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut total_len = 0usize;
        for chunk in &self.chunks {
            total_len += chunk.doc_len;
            for term in chunk.term_freq.keys() {
                *doc_freq.entry(term.clone()).or_default() += 1;
            }
        }
        self.doc_freq = doc_freq;
        self.avg_doc_len = if self.chunks.is_empty() {
            0.0
        } else {
            total_len as f32 / self.chunks.len() as f32
        };
    }
}

/// Hash-keyed vector cache. Grows monotonically except on explicit rebuild.
#[derive(Default)]
pub struct EmbeddingCache {
    entries: HashMap<String, Vec<f32>>,
    dirty: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedCache {
    #[serde(default)]
    entries: HashMap<String, Vec<f32>>,
}

impl EmbeddingCache {
    pub fn load(path: &Path) -> Self {
        let persisted: PersistedCache = fsutil::read_json_or_quarantine(path).unwrap_or_default();
        Self {
            entries: persisted.entries,
            dirty: false,
        }
    }

    pub fn get(&self, hash: &str) -> Option<&Vec<f32>> {
        self.entries.get(hash)
    }

    pub fn insert(&mut self, hash: String, vector: Vec<f32>) {
        self.entries.insert(hash, vector);
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty = true;
    }

    /// Persist if anything changed since the last save.
    pub fn save_if_dirty(&mut self, path: &Path) -> Result<(), fsutil::FsError> {
        if !self.dirty {
            return Ok(());
        }
        let persisted = PersistedCache {
            entries: self.entries.clone(),
        };
        fsutil::write_json_atomic(path, &persisted)?;
        self.dirty = false;
        Ok(())
    }
}

/// Tokenize for BM25: lowercase alphanumeric runs, dropping stop words and
/// anything shorter than three characters.
pub fn tokenize(text: &str) -> Vec<String> {
    const STOP_WORDS: &[&str] = &[
        "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
        "one", "our", "out", "has", "have", "this", "that", "with", "from", "they", "them", "will",
        "what", "when", "where", "which", "your", "about", "into", "than", "then", "there", "these",
        "some", "would", "could", "should", "been", "being", "were", "their", "its",
    ];
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2 && !STOP_WORDS.contains(t))
        .map(String::from)
        .collect()
}

fn term_stats(text: &str) -> (HashMap<String, u32>, usize) {
    let tokens = tokenize(text);
    let doc_len = tokens.len();
    let mut term_freq: HashMap<String, u32> = HashMap::new();
    for token in tokens {
        *term_freq.entry(token).or_default() += 1;
    }
    (term_freq, doc_len)
}

fn chunk_source(source: &IndexSource) -> Vec<TextChunk> {
    match source.source_type {
        SourceType::MemoryDaily | SourceType::Session | SourceType::Soul | SourceType::Compact => {
            chunker::chunk_by_sections(&source.content)
        }
        SourceType::MemoryMain => {
            chunker::chunk_by_window(&source.content, chunker::MAIN_WINDOW_CHARS)
        }
        SourceType::Extra | SourceType::Raw => {
            chunker::chunk_by_window(&source.content, chunker::EXTRA_WINDOW_CHARS)
        }
    }
}

/// Outcome of a sync pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub chunks: usize,
    pub embedded: usize,
    pub reused: usize,
}

/// Rebuild the index from `sources`, reusing vectors from the previous
/// index and the cache, embedding only unseen hashes, then persisting the
/// new index. The cache is updated with every vector that flowed through.
pub async fn sync_index(
    index: &mut KnowledgeIndex,
    cache: &mut EmbeddingCache,
    provider: &dyn EmbeddingProvider,
    sources: &[IndexSource],
    index_path: &Path,
    cache_path: &Path,
    vectors_enabled: bool,
    batch_size: usize,
) -> Result<SyncReport, crate::memory::MemoryError> {
    let prior_vectors: HashMap<String, Vec<f32>> = index
        .chunks
        .iter()
        .map(|c| (c.content_hash.clone(), c.vector.clone()))
        .collect();

    let mut chunks: Vec<KnowledgeChunk> = Vec::new();
    for source in sources {
        for piece in chunk_source(source) {
            let content_hash = chunker::content_hash(&piece.text);
            let (term_freq, doc_len) = term_stats(&piece.text);
            chunks.push(KnowledgeChunk {
                content_hash,
                text: piece.text,
                path: source.path.clone(),
                source_type: source.source_type,
                start_line: piece.start_line,
                end_line: piece.end_line,
                vector: Vec::new(),
                term_freq,
                doc_len,
            });
        }
    }

    let dims = provider.dimension();
    let mut reused = 0usize;
    let mut to_embed: Vec<usize> = Vec::new();
    let mut seen_pending: HashSet<String> = HashSet::new();

    // Reuse only vectors of the configured dimension; a dims change forces
    // a re-embed.
    for (idx, chunk) in chunks.iter_mut().enumerate() {
        let reusable = prior_vectors
            .get(&chunk.content_hash)
            .or_else(|| cache.get(&chunk.content_hash))
            .filter(|v| v.len() == dims);
        if let Some(vector) = reusable {
            chunk.vector = vector.clone();
            reused += 1;
        } else if vectors_enabled && seen_pending.insert(chunk.content_hash.clone()) {
            to_embed.push(idx);
        }
    }

    let mut embedded = 0usize;
    if vectors_enabled && !to_embed.is_empty() {
        let batch_size = batch_size.max(1);
        for group in to_embed.chunks(batch_size) {
            let texts: Vec<String> = group.iter().map(|i| chunks[*i].text.clone()).collect();
            let vectors = provider.embed_batch(&texts).await?;
            for (slot, vector) in group.iter().zip(vectors) {
                let hash = chunks[*slot].content_hash.clone();
                cache.insert(hash.clone(), vector.clone());
                chunks[*slot].vector = vector;
                embedded += 1;
            }
        }
        // Identical text can appear in several files; share the vector.
        let by_hash: HashMap<String, Vec<f32>> = chunks
            .iter()
            .filter(|c| !c.vector.is_empty())
            .map(|c| (c.content_hash.clone(), c.vector.clone()))
            .collect();
        for chunk in &mut chunks {
            if chunk.vector.is_empty() {
                if let Some(vector) = by_hash.get(&chunk.content_hash) {
                    chunk.vector = vector.clone();
                }
            }
        }
    }

    index.chunks = chunks;
    index.recompute_stats();

    persist_index(index, provider.dimension(), index_path)?;
    cache.save_if_dirty(cache_path)?;

    Ok(SyncReport {
        chunks: index.chunks.len(),
        embedded,
        reused,
    })
}

fn persist_index(
    index: &KnowledgeIndex,
    dims: usize,
    path: &Path,
) -> Result<(), fsutil::FsError> {
    let persisted = PersistedIndex {
        dims,
        chunks: index
            .chunks
            .iter()
            .map(|c| PersistedChunk {
                content_hash: c.content_hash.clone(),
                path: c.path.clone(),
                source_type: c.source_type,
                start_line: c.start_line,
                end_line: c.end_line,
                vector: c.vector.clone(),
            })
            .collect(),
    };
    fsutil::write_json_atomic(path, &persisted)
}

/// Load prior vectors from the persisted index so a fresh process reuses
/// them on its first sync.
pub fn load_prior_vectors(path: &Path) -> HashMap<String, Vec<f32>> {
    let persisted: PersistedIndex = fsutil::read_json_or_quarantine(path).unwrap_or_default();
    persisted
        .chunks
        .into_iter()
        .filter(|c| !c.vector.is_empty())
        .map(|c| (c.content_hash, c.vector))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::embeddings::MockEmbeddings;
    use tempfile::tempdir;

    fn source(path: &str, kind: SourceType, content: &str) -> IndexSource {
        IndexSource {
            path: PathBuf::from(path),
            source_type: kind,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_sync_builds_chunks_and_stats() {
        let dir = tempdir().unwrap();
        let provider = MockEmbeddings::new(32);
        let mut index = KnowledgeIndex::default();
        let mut cache = EmbeddingCache::default();

        let sources = vec![source(
            "daily/2026-08-02.md",
            SourceType::MemoryDaily,
            "## 09:00 user\ndiscussed database migration strategy\n\n## 09:10 assistant\nproposed an incremental rollout\n",
        )];

        let report = sync_index(
            &mut index,
            &mut cache,
            &provider,
            &sources,
            &dir.path().join("index.json"),
            &dir.path().join("cache.json"),
            true,
            8,
        )
        .await
        .unwrap();

        assert!(report.chunks >= 2);
        assert_eq!(report.reused, 0);
        assert_eq!(report.embedded, report.chunks);
        assert!(index.avg_doc_len > 0.0);
        assert!(index.doc_freq.contains_key("database"));
        // Every chunk got a vector of provider dimension.
        assert!(index.chunks.iter().all(|c| c.vector.len() == 32));
    }

    #[tokio::test]
    async fn test_resync_unchanged_reuses_all_vectors() {
        let dir = tempdir().unwrap();
        let provider = MockEmbeddings::new(32);
        let mut index = KnowledgeIndex::default();
        let mut cache = EmbeddingCache::default();
        let index_path = dir.path().join("index.json");
        let cache_path = dir.path().join("cache.json");

        let sources = vec![source(
            "memory/MEMORY.md",
            SourceType::MemoryMain,
            "long term note about the release checklist and signing keys",
        )];

        sync_index(
            &mut index, &mut cache, &provider, &sources, &index_path, &cache_path, true, 8,
        )
        .await
        .unwrap();
        let after_first = provider.embedded_count();
        assert!(after_first > 0);

        let report = sync_index(
            &mut index, &mut cache, &provider, &sources, &index_path, &cache_path, true, 8,
        )
        .await
        .unwrap();

        // No new provider calls on an unchanged corpus.
        assert_eq!(provider.embedded_count(), after_first);
        assert_eq!(report.embedded, 0);
        assert_eq!(report.reused, report.chunks);
    }

    #[tokio::test]
    async fn test_identical_text_across_files_shares_cache_entry() {
        let dir = tempdir().unwrap();
        let provider = MockEmbeddings::new(32);
        let mut index = KnowledgeIndex::default();
        let mut cache = EmbeddingCache::default();

        let same = "## note\nthe shared paragraph appears twice\n";
        let sources = vec![
            source("a.md", SourceType::MemoryDaily, same),
            source("b.md", SourceType::MemoryDaily, same),
        ];

        let report = sync_index(
            &mut index,
            &mut cache,
            &provider,
            &sources,
            &dir.path().join("index.json"),
            &dir.path().join("cache.json"),
            true,
            8,
        )
        .await
        .unwrap();

        assert_eq!(report.chunks, 2);
        // One embedding call serves both chunks.
        assert_eq!(provider.embedded_count(), 1);
        assert_eq!(index.chunks[0].vector, index.chunks[1].vector);
    }

    #[tokio::test]
    async fn test_vectors_disabled_skips_provider() {
        let dir = tempdir().unwrap();
        let provider = MockEmbeddings::new(32);
        let mut index = KnowledgeIndex::default();
        let mut cache = EmbeddingCache::default();

        let sources = vec![source("a.md", SourceType::MemoryDaily, "## x\nsome text\n")];
        sync_index(
            &mut index,
            &mut cache,
            &provider,
            &sources,
            &dir.path().join("index.json"),
            &dir.path().join("cache.json"),
            false,
            8,
        )
        .await
        .unwrap();

        assert_eq!(provider.embedded_count(), 0);
        assert!(!index.is_empty());
    }

    #[tokio::test]
    async fn test_persisted_index_feeds_prior_vectors() {
        let dir = tempdir().unwrap();
        let provider = MockEmbeddings::new(32);
        let mut index = KnowledgeIndex::default();
        let mut cache = EmbeddingCache::default();
        let index_path = dir.path().join("index.json");

        let sources = vec![source("a.md", SourceType::MemoryDaily, "## x\nstable text\n")];
        sync_index(
            &mut index,
            &mut cache,
            &provider,
            &sources,
            &index_path,
            &dir.path().join("cache.json"),
            true,
            8,
        )
        .await
        .unwrap();

        let prior = load_prior_vectors(&index_path);
        assert_eq!(prior.len(), 1);
        let hash = &index.chunks[0].content_hash;
        assert_eq!(prior.get(hash).unwrap(), &index.chunks[0].vector);
    }

    #[test]
    fn test_cache_roundtrip_and_clear() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = EmbeddingCache::default();
        cache.insert("abc".to_string(), vec![0.5, 0.5]);
        cache.save_if_dirty(&path).unwrap();

        let loaded = EmbeddingCache::load(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("abc").unwrap(), &vec![0.5, 0.5]);

        let mut cleared = loaded;
        cleared.clear();
        assert_eq!(cleared.len(), 0);
    }

    #[test]
    fn test_tokenize_filters_short_and_stop_words() {
        let tokens = tokenize("The quick brown fox and a dog ran to it");
        assert!(tokens.contains(&"quick".to_string()));
        assert!(tokens.contains(&"brown".to_string()));
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"and".to_string()));
        assert!(!tokens.contains(&"a".to_string()));
        assert!(!tokens.contains(&"it".to_string()));
    }
}
