use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] rusqlite::Error),
    #[error("Storage lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Flush already in progress for {0}")]
    FlushInProgress(String),
    #[error(
        "Commit failed on chunk {} of {chunk_count} (log ids {first_id}..={last_id}, {committed_chunks} chunk(s) committed before it): {source}",
        .chunk_index + 1
    )]
    CommitFailed {
        chunk_index: usize,
        chunk_count: usize,
        committed_chunks: usize,
        first_id: i64,
        last_id: i64,
        #[source]
        source: RemoteError,
    },
}

impl SyncError {
    /// Whether re-running the same operation later can succeed without
    /// changing its input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::StorageUnavailable(_)
                | SyncError::LockPoisoned(_)
                | SyncError::CommitFailed { .. }
                | SyncError::FlushInProgress(_)
        )
    }
}

/// Failures reported by a remote document store while building or committing a batch.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Batch exceeds {limit} operations")]
    BatchTooLarge { limit: usize },
    #[error("Invalid document path: {0}")]
    InvalidPath(String),
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Remote store lock poisoned")]
    LockPoisoned,
}
