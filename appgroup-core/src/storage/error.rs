//! Error types for the backing key-value store.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a [`Storage`](super::Storage) implementation or while
/// encoding the records kept in it.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing store could not complete the operation.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// An I/O operation on a file-backed store failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Context describing the operation.
        context: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored entry exists but its contents are malformed.
    #[error("corrupted entry at '{key}': {reason}")]
    Corrupted {
        /// Storage key of the malformed entry.
        key: String,
        /// Description of the problem.
        reason: String,
    },
}

impl StorageError {
    /// Creates an I/O error with context.
    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a corrupted entry error.
    pub fn corrupted<K: Into<String>, R: Into<String>>(key: K, reason: R) -> Self {
        Self::Corrupted {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
