//! Markdown chunking for the knowledge index.
//!
//! Daily and session files are cut along `##` headings so one conversation
//! block stays together; long-form files (main long-term, extra corpora)
//! use a sliding character window with overlap. Every chunk carries its
//! line range and a SHA-1 content hash used as the embedding cache key.

use sha1::{Digest, Sha1};

/// Maximum size of a heading section before it gets re-split.
const MAX_SECTION_CHARS: usize = 2200;
/// Window size for the main long-term file.
pub const MAIN_WINDOW_CHARS: usize = 1400;
/// Window size for extra corpora.
pub const EXTRA_WINDOW_CHARS: usize = 1100;
/// Overlap between adjacent windows.
const WINDOW_OVERLAP_CHARS: usize = 180;

/// A bounded slice of a source file.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    /// 1-based inclusive line range in the source file.
    pub start_line: usize,
    pub end_line: usize,
}

/// Hex SHA-1 of a chunk's text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(40);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Split a markdown document on `##` headings, further splitting oversized
/// sections into overlapping windows.
pub fn chunk_by_sections(content: &str) -> Vec<TextChunk> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let lines: Vec<&str> = content.lines().collect();
    let mut sections: Vec<(usize, usize)> = Vec::new(); // (start idx, end idx) 0-based inclusive
    let mut start = 0usize;

    for (idx, line) in lines.iter().enumerate() {
        if idx > 0 && line.starts_with("## ") {
            sections.push((start, idx - 1));
            start = idx;
        }
    }
    sections.push((start, lines.len().saturating_sub(1)));

    let mut chunks = Vec::new();
    for (lo, hi) in sections {
        let text = lines[lo..=hi].join("\n");
        if text.trim().is_empty() {
            continue;
        }
        if text.len() <= MAX_SECTION_CHARS {
            chunks.push(TextChunk {
                text,
                start_line: lo + 1,
                end_line: hi + 1,
            });
        } else {
            // Oversized section: window over its own lines so the ranges
            // stay anchored in the original file.
            chunks.extend(window_lines(&lines[lo..=hi], lo + 1, MAX_SECTION_CHARS / 2));
        }
    }
    chunks
}

/// Sliding-window split for long-form files.
pub fn chunk_by_window(content: &str, window_chars: usize) -> Vec<TextChunk> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    let lines: Vec<&str> = content.lines().collect();
    window_lines(&lines, 1, window_chars)
}

/// Accumulate whole lines into windows of roughly `window_chars`,
/// re-starting each window `WINDOW_OVERLAP_CHARS` worth of lines early.
fn window_lines(lines: &[&str], first_line_number: usize, window_chars: usize) -> Vec<TextChunk> {
    let window_chars = window_chars.max(200);
    let mut chunks = Vec::new();
    let mut idx = 0usize;

    while idx < lines.len() {
        let start = idx;
        let mut size = 0usize;
        let mut end = idx;
        while end < lines.len() {
            let add = lines[end].len() + 1;
            if size + add > window_chars && size > 0 {
                break;
            }
            size += add;
            end += 1;
        }

        let text = lines[start..end].join("\n");
        if !text.trim().is_empty() {
            chunks.push(TextChunk {
                text,
                start_line: first_line_number + start,
                end_line: first_line_number + end - 1,
            });
        }

        if end >= lines.len() {
            break;
        }

        // Walk back far enough to carry the overlap into the next window.
        let mut overlap = 0usize;
        let mut next = end;
        while next > start + 1 && overlap < WINDOW_OVERLAP_CHARS {
            next -= 1;
            overlap += lines[next].len() + 1;
        }
        idx = next.max(start + 1);
    }

    chunks
}
