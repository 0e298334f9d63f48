//! Error types for codec operations.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or collating values.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A value cannot be represented in canonical JSON.
    #[error("bad encoding: {message}")]
    BadEncoding {
        /// Description of the offending value.
        message: String,
    },
}

impl CodecError {
    /// Creates a bad encoding error.
    pub fn bad_encoding(message: impl Into<String>) -> Self {
        Self::BadEncoding {
            message: message.into(),
        }
    }
}
