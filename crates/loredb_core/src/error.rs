//! Error types and the status taxonomy for LoreDB core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Outcome codes for store operations.
///
/// Mutations report `Created` (a new revision was written) or `Ok`
/// (an acknowledged no-op such as a deletion or a duplicate insert); the
/// remaining codes classify failures. `Conflict` and `NotFound` are
/// expected, recoverable outcomes a caller handles by refreshing its view
/// of the document and retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation succeeded.
    Ok,
    /// A new revision was created.
    Created,
    /// The request was malformed (bad document id, broken history, ...).
    BadRequest,
    /// The referenced document or revision does not exist.
    NotFound,
    /// The write lost an optimistic-concurrency race.
    Conflict,
    /// A validation function rejected the write.
    Forbidden,
    /// Attachment metadata or content was unusable.
    BadAttachment,
    /// Content could not be decoded (bad base64, unknown encoding, ...).
    BadEncoding,
    /// A storage-layer fault; the enclosing transaction was rolled back.
    InternalServerError,
}

/// Errors that can occur in LoreDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The request was malformed.
    #[error("bad request: {message}")]
    BadRequest {
        /// Description of the problem.
        message: String,
    },

    /// The referenced document or revision does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// What was looked up.
        message: String,
    },

    /// The write conflicts with the current revision.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflicting state.
        message: String,
    },

    /// A validation function rejected the write.
    #[error("forbidden: {reason}")]
    Forbidden {
        /// The validator's rejection message.
        reason: String,
    },

    /// Attachment metadata or content was unusable.
    #[error("bad attachment: {message}")]
    BadAttachment {
        /// Description of the problem.
        message: String,
    },

    /// Content could not be decoded.
    #[error("bad encoding: {message}")]
    BadEncoding {
        /// Description of the problem.
        message: String,
    },

    /// Codec-level failure.
    #[error("codec error: {0}")]
    Codec(#[from] loredb_codec::CodecError),

    /// Blob store failure.
    #[error("blob store error: {0}")]
    Blob(#[from] loredb_blob::BlobError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation or storage fault.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the fault.
        message: String,
    },
}

impl CoreError {
    /// Creates a bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a forbidden error carrying the validator's reason.
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    /// Creates a bad attachment error.
    pub fn bad_attachment(message: impl Into<String>) -> Self {
        Self::BadAttachment {
            message: message.into(),
        }
    }

    /// Creates a bad encoding error.
    pub fn bad_encoding(message: impl Into<String>) -> Self {
        Self::BadEncoding {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Maps this error onto the status taxonomy.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::BadRequest { .. } => Status::BadRequest,
            Self::NotFound { .. } => Status::NotFound,
            Self::Conflict { .. } => Status::Conflict,
            Self::Forbidden { .. } => Status::Forbidden,
            Self::BadAttachment { .. } => Status::BadAttachment,
            Self::BadEncoding { .. } | Self::Codec(_) => Status::BadEncoding,
            Self::Blob(_) | Self::Io(_) | Self::Internal { .. } => {
                Status::InternalServerError
            }
        }
    }
}
