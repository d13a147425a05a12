//! Hybrid retrieval over the knowledge index.
//!
//! Combines a BM25 text score (k1 = 1.4, b = 0.75) with cosine similarity
//! over chunk vectors, plus a small per-source boost. Session scoping rules:
//! strict mode restricts results to the session's own file and raw entries;
//! global mode with a session key still never leaks other sessions' files.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::memory::embeddings::cosine;
use crate::memory::index::{tokenize, KnowledgeChunk, KnowledgeIndex, SourceType};

const BM25_K1: f32 = 1.4;
const BM25_B: f32 = 0.75;

/// How a session key constrains the candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    /// Session file + general knowledge; other sessions excluded.
    #[default]
    Global,
    /// Only the session's own file and raw entries.
    SessionStrict,
}

impl SearchMode {
    pub fn parse(value: &str) -> SearchMode {
        match value {
            "session_strict" => SearchMode::SessionStrict,
            _ => SearchMode::Global,
        }
    }
}

/// Options for one search call.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub session_key: Option<String>,
    pub mode: SearchMode,
}

/// One scored hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub text: String,
    pub path: String,
    pub source_type: &'static str,
    pub start_line: usize,
    pub end_line: usize,
    pub score: f32,
    pub text_score: f32,
    pub vector_score: f32,
}

/// Weights resolved from config; vector + text always sum to one.
#[derive(Debug, Clone, Copy)]
pub struct SearchWeights {
    pub vector: f32,
    pub text: f32,
    pub min_score: f32,
}

impl SearchWeights {
    /// Normalize so the two weights sum to 1.0, falling back to the
    /// 0.65/0.35 defaults when both are zero.
    pub fn resolve(vector: f32, text: f32, min_score: f32) -> Self {
        let (vector, text) = if vector <= 0.0 && text <= 0.0 {
            (0.65, 0.35)
        } else {
            let sum = vector.max(0.0) + text.max(0.0);
            (vector.max(0.0) / sum, text.max(0.0) / sum)
        };
        Self {
            vector,
            text,
            min_score,
        }
    }
}

fn source_boost(source_type: SourceType) -> f32 {
    match source_type {
        SourceType::MemoryMain => 0.05,
        SourceType::Soul => 0.04,
        SourceType::MemoryDaily => 0.03,
        SourceType::Session => 0.03,
        SourceType::Compact => 0.02,
        SourceType::Extra => 0.0,
        SourceType::Raw => 0.0,
    }
}

/// Whether a chunk is eligible under the session scoping rules.
fn chunk_eligible(chunk: &KnowledgeChunk, options: &SearchOptions, session_file: Option<&Path>) -> bool {
    match (&options.session_key, options.mode) {
        (None, _) => true,
        (Some(_), SearchMode::SessionStrict) => {
            // Only the session's own file; compact and soul corpora excluded.
            match chunk.source_type {
                SourceType::Session | SourceType::Raw => {
                    session_file.map(|f| chunk.path == f).unwrap_or(false)
                }
                _ => false,
            }
        }
        (Some(_), SearchMode::Global) => {
            // General knowledge plus this session's file; never another
            // session's file.
            match chunk.source_type {
                SourceType::Session => session_file.map(|f| chunk.path == f).unwrap_or(false),
                _ => true,
            }
        }
    }
}

fn bm25_score(
    query_terms: &[String],
    chunk: &KnowledgeChunk,
    doc_freq: &HashMap<String, usize>,
    doc_count: usize,
    avg_doc_len: f32,
) -> f32 {
    if chunk.doc_len == 0 || doc_count == 0 {
        return 0.0;
    }
    let avg = avg_doc_len.max(1.0);
    let mut score = 0.0f32;
    for term in query_terms {
        let tf = *chunk.term_freq.get(term).unwrap_or(&0) as f32;
        if tf == 0.0 {
            continue;
        }
        let df = *doc_freq.get(term).unwrap_or(&0) as f32;
        let idf = (((doc_count as f32 - df + 0.5) / (df + 0.5)) + 1.0).ln();
        let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * chunk.doc_len as f32 / avg);
        score += idf * (tf * (BM25_K1 + 1.0)) / denom;
    }
    score
}

/// Run a hybrid search over `index` candidates (already filtered for
/// eligibility by the caller via `collect_candidates`).
pub fn rank(
    index: &KnowledgeIndex,
    extra_chunks: &[KnowledgeChunk],
    query: &str,
    query_vector: Option<&[f32]>,
    weights: SearchWeights,
    options: &SearchOptions,
    session_file: Option<&Path>,
    limit: usize,
) -> Vec<SearchHit> {
    let query_terms = tokenize(query);
    if query_terms.is_empty() && query_vector.is_none() {
        return Vec::new();
    }

    let candidates: Vec<&KnowledgeChunk> = index
        .chunks
        .iter()
        .filter(|c| chunk_eligible(c, options, session_file))
        .chain(extra_chunks.iter())
        .collect();
    if candidates.is_empty() {
        return Vec::new();
    }

    let doc_count = index.chunks.len() + extra_chunks.len();
    let mut raw: Vec<(usize, f32, f32)> = Vec::with_capacity(candidates.len());
    let mut max_text = 0.0f32;

    for (idx, chunk) in candidates.iter().enumerate() {
        let text_score = bm25_score(
            &query_terms,
            chunk,
            &index.doc_freq,
            doc_count,
            index.avg_doc_len,
        );
        let vector_score = match (query_vector, chunk.vector.is_empty()) {
            (Some(qv), false) => cosine(qv, &chunk.vector),
            _ => 0.0,
        };
        max_text = max_text.max(text_score);
        raw.push((idx, text_score, vector_score));
    }

    // BM25 is unbounded; normalize against the best candidate so the
    // combined score stays comparable with min_score.
    let mut hits: Vec<SearchHit> = raw
        .into_iter()
        .filter_map(|(idx, text_score, vector_score)| {
            let chunk = candidates[idx];
            let text_norm = if max_text > 0.0 { text_score / max_text } else { 0.0 };
            let score =
                weights.text * text_norm + weights.vector * vector_score + source_boost(chunk.source_type);
            if score < weights.min_score {
                return None;
            }
            Some(SearchHit {
                text: chunk.text.clone(),
                path: chunk.path.display().to_string(),
                source_type: chunk.source_type.as_str(),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                score,
                text_score: text_norm,
                vector_score,
            })
        })
        .collect();

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::chunker::content_hash;
    use std::path::PathBuf;

    fn chunk(text: &str, path: &str, source_type: SourceType) -> KnowledgeChunk {
        let tokens = tokenize(text);
        let mut term_freq: HashMap<String, u32> = HashMap::new();
        let doc_len = tokens.len();
        for t in tokens {
            *term_freq.entry(t).or_default() += 1;
        }
        KnowledgeChunk {
            content_hash: content_hash(text),
            text: text.to_string(),
            path: PathBuf::from(path),
            source_type,
            start_line: 1,
            end_line: 1,
            vector: Vec::new(),
            term_freq,
            doc_len,
        }
    }

    fn index_of(chunks: Vec<KnowledgeChunk>) -> KnowledgeIndex {
        let mut index = KnowledgeIndex {
            chunks,
            ..Default::default()
        };
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut total = 0usize;
        for c in &index.chunks {
            total += c.doc_len;
            for t in c.term_freq.keys() {
                *doc_freq.entry(t.clone()).or_default() += 1;
            }
        }
        index.doc_freq = doc_freq;
        index.avg_doc_len = if index.chunks.is_empty() {
            0.0
        } else {
            total as f32 / index.chunks.len() as f32
        };
        index
    }

    fn weights() -> SearchWeights {
        SearchWeights::resolve(0.65, 0.35, 0.05)
    }

    #[test]
    fn test_text_match_ranks_first() {
        let index = index_of(vec![
            chunk("release checklist signing keys deploy", "m.md", SourceType::MemoryMain),
            chunk("lunch plans friday pizza", "d.md", SourceType::MemoryDaily),
        ]);

        let hits = rank(
            &index,
            &[],
            "release checklist",
            None,
            weights(),
            &SearchOptions::default(),
            None,
            10,
        );
        assert!(!hits.is_empty());
        assert!(hits[0].text.contains("release checklist"));
    }

    #[test]
    fn test_session_strict_excludes_other_sessions() {
        let s1 = "workspace/memory/sessions/s1.md";
        let s2 = "workspace/memory/sessions/s2.md";
        let index = index_of(vec![
            chunk("## a\ntoken-x-only-for-s1 discussion", s1, SourceType::Session),
            chunk("## b\nsomething else entirely", s2, SourceType::Session),
            chunk("token-x mentioned in main memory", "m.md", SourceType::MemoryMain),
        ]);

        let options = SearchOptions {
            session_key: Some("s2".to_string()),
            mode: SearchMode::SessionStrict,
        };
        let hits = rank(
            &index,
            &[],
            "token-x",
            None,
            weights(),
            &options,
            Some(Path::new(s2)),
            10,
        );
        // s2 never sees s1's token, nor general memory in strict mode.
        assert!(hits.is_empty());

        let options = SearchOptions {
            session_key: Some("s1".to_string()),
            mode: SearchMode::SessionStrict,
        };
        let hits = rank(
            &index,
            &[],
            "token-x",
            None,
            weights(),
            &options,
            Some(Path::new(s1)),
            10,
        );
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("token-x-only-for-s1"));
    }

    #[test]
    fn test_global_with_session_key_excludes_foreign_sessions_only() {
        let s1 = "workspace/memory/sessions/s1.md";
        let s2 = "workspace/memory/sessions/s2.md";
        let index = index_of(vec![
            chunk("## a\nshared-term in my own session", s1, SourceType::Session),
            chunk("## b\nshared-term in another session", s2, SourceType::Session),
            chunk("shared-term in general memory", "m.md", SourceType::MemoryMain),
        ]);

        let options = SearchOptions {
            session_key: Some("s1".to_string()),
            mode: SearchMode::Global,
        };
        let hits = rank(
            &index,
            &[],
            "shared-term",
            None,
            weights(),
            &options,
            Some(Path::new(s1)),
            10,
        );
        let paths: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
        assert!(paths.contains(&s1));
        assert!(paths.contains(&"m.md"));
        assert!(!paths.contains(&s2));
    }

    #[test]
    fn test_vector_leg_contributes() {
        let mut a = chunk("alpha beta", "a.md", SourceType::MemoryDaily);
        let mut b = chunk("gamma delta", "b.md", SourceType::MemoryDaily);
        a.vector = vec![1.0, 0.0];
        b.vector = vec![0.0, 1.0];
        let index = index_of(vec![a, b]);

        let query_vector = vec![1.0, 0.0];
        let hits = rank(
            &index,
            &[],
            "unrelated words entirely",
            Some(&query_vector),
            SearchWeights::resolve(1.0, 0.0, 0.1),
            &SearchOptions::default(),
            None,
            10,
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "a.md");
        assert!(hits[0].vector_score > 0.9);
    }

    #[test]
    fn test_min_score_filters() {
        let index = index_of(vec![chunk("completely unrelated words", "a.md", SourceType::Extra)]);
        let hits = rank(
            &index,
            &[],
            "quantum entanglement",
            None,
            SearchWeights::resolve(0.65, 0.35, 0.12),
            &SearchOptions::default(),
            None,
            10,
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn test_weights_auto_normalize() {
        let w = SearchWeights::resolve(2.0, 2.0, 0.1);
        assert!((w.vector - 0.5).abs() < 1e-6);
        assert!((w.text - 0.5).abs() < 1e-6);

        let w = SearchWeights::resolve(0.0, 0.0, 0.1);
        assert!((w.vector - 0.65).abs() < 1e-6);
        assert!((w.text - 0.35).abs() < 1e-6);
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let index = index_of(vec![chunk("text", "a.md", SourceType::MemoryMain)]);
        let hits = rank(
            &index,
            &[],
            "a an",
            None,
            weights(),
            &SearchOptions::default(),
            None,
            10,
        );
        assert!(hits.is_empty());
    }
}
