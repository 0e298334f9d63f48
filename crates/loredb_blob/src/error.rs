//! Error types for blob storage.

use crate::key::BlobKey;
use std::io;
use thiserror::Error;

/// Result type for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during blob store operations.
#[derive(Debug, Error)]
pub enum BlobError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No blob exists for the requested key.
    #[error("no blob for key {key}")]
    NotFound {
        /// The key that was not found.
        key: BlobKey,
    },

    /// A writer operation was called in the wrong state.
    #[error("invalid writer state: {message}")]
    WriterState {
        /// Description of the misuse.
        message: String,
    },

    /// A key string could not be parsed.
    #[error("malformed blob key: {input}")]
    MalformedKey {
        /// The rejected input.
        input: String,
    },
}

impl BlobError {
    /// Creates a not-found error.
    pub fn not_found(key: BlobKey) -> Self {
        Self::NotFound { key }
    }

    /// Creates a writer-state error.
    pub fn writer_state(message: impl Into<String>) -> Self {
        Self::WriterState {
            message: message.into(),
        }
    }
}
