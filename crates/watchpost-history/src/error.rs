//! Error types for the history store.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for history store operations.
pub type HistoryResult<T> = Result<T, HistoryError>;

/// Errors that can occur while opening, writing or compacting the history.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to open history file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed history entry on line {line}: {reason}")]
    Replay { line: usize, reason: String },

    #[error("invalid history options: {0}")]
    Options(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("compaction failed: {0}")]
    Compact(String),

    #[error("history store is closed")]
    Closed,
}
