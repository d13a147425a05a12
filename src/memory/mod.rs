//! Multi-layer memory: raw conversation log, markdown tiers, long-term
//! notes, identity file, and a hybrid text+vector knowledge index.

pub mod chunker;
pub mod embeddings;
pub mod index;
pub mod search;
pub mod store;
pub mod watch;

pub use search::{SearchHit, SearchMode, SearchOptions};
pub use store::{MemoryStats, MemoryStore, NoteEntry, RawEntry, COMPACTION_THRESHOLD};
pub use watch::MemoryWatcher;

use thiserror::Error;

/// Error type for memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Storage(#[from] crate::fsutil::FsError),

    #[error(transparent)]
    Embedding(#[from] embeddings::EmbeddingError),
}
