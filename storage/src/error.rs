use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or writing the run history.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The history file could not be read or written.
    #[error("history I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The stored history is not valid JSON in a known layout.
    #[error("history at {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The history could not be encoded.
    #[error("failed to encode history: {0}")]
    Encode(#[from] serde_json::Error),

    /// A peak update arrived while the history held no runs.
    #[error("no active run to update")]
    NoActiveRun,
}
