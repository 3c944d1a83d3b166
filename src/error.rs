//! Crate-wide error type and result alias.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tokenizer initialization failed: {0}")]
    TokenizerInit(String),

    #[error("chunk worker was recycled while the request was in flight")]
    WorkerRecycled,

    #[error("vector store unavailable: {0}")]
    VectorUnavailable(String),

    #[error("embedding provider failed: {0}")]
    Embedding(String),

    #[error("file watcher error: {0}")]
    Watcher(String),

    #[error("indexer is closed")]
    Closed,
}

impl Error {
    /// Whether the caller may retry the failed operation as-is.
    /// Only worker recycling qualifies; storage errors are surfaced unchanged
    /// and retried at the caller's discretion.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::WorkerRecycled)
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }
}
