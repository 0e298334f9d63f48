//! Revisions and their bodies.

use crate::error::{CoreError, CoreResult};
use crate::revid::RevId;
use crate::types::SequenceNumber;
use serde_json::{Map, Value};

/// A revision body: the user's key/value document.
pub type Body = Map<String, Value>;

/// Reserved body keys that are synthesized on read and stripped on write.
const RESERVED_KEYS: &[&str] = &[
    "_id",
    "_rev",
    "_deleted",
    "_attachments",
    "_revisions",
    "_revs_info",
    "_conflicts",
    "_local_seq",
    "_removed",
];

/// Availability of a revision's stored body.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyState {
    /// The body is stored and readable.
    Present(Body),
    /// The body was stripped by compaction; only linkage metadata remains.
    Compacted,
    /// A phantom ancestor inserted for linkage only; it never had a body.
    Missing,
}

impl BodyState {
    /// Returns the body if it is available.
    #[must_use]
    pub fn body(&self) -> Option<&Body> {
        match self {
            Self::Present(body) => Some(body),
            Self::Compacted | Self::Missing => None,
        }
    }

    /// Returns true if the body can be read.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Present(_))
    }
}

/// A single revision of a document.
///
/// Revisions are immutable once written; a document is mutated only by
/// appending new revisions. The `parent` back-reference (by sequence
/// number, not pointer) links the revision into its document's tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    doc_id: String,
    rev_id: RevId,
    deleted: bool,
    sequence: SequenceNumber,
    parent: Option<SequenceNumber>,
    body: BodyState,
}

impl Revision {
    /// Assembles a revision from its stored parts.
    #[must_use]
    pub fn new(
        doc_id: impl Into<String>,
        rev_id: RevId,
        deleted: bool,
        sequence: SequenceNumber,
        parent: Option<SequenceNumber>,
        body: BodyState,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            deleted,
            sequence,
            parent,
            body,
        }
    }

    /// The owning document's id.
    #[must_use]
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// This revision's id.
    #[must_use]
    pub fn rev_id(&self) -> &RevId {
        &self.rev_id
    }

    /// True if this revision is a tombstone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// The store-wide sequence number.
    #[must_use]
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    /// The parent revision's sequence, if any.
    #[must_use]
    pub fn parent_sequence(&self) -> Option<SequenceNumber> {
        self.parent
    }

    /// The stored body state.
    #[must_use]
    pub fn body(&self) -> &BodyState {
        &self.body
    }

    /// True if the body can be read (not a phantom, not compacted away).
    #[must_use]
    pub fn body_available(&self) -> bool {
        self.body.is_available()
    }

    /// The body with `_id`/`_rev` (and `_deleted` for tombstones)
    /// synthesized, or `None` when the body is unavailable.
    #[must_use]
    pub fn properties(&self) -> Option<Body> {
        let body = self.body.body()?;
        let mut props = body.clone();
        props.insert("_id".to_string(), Value::String(self.doc_id.clone()));
        props.insert(
            "_rev".to_string(),
            Value::String(self.rev_id.as_str().to_string()),
        );
        if self.deleted {
            props.insert("_deleted".to_string(), Value::Bool(true));
        }
        Some(props)
    }
}

/// Strips reserved `_`-prefixed keys from a body before persistence.
///
/// Known reserved keys are removed (they are metadata, synthesized on
/// read); an unknown `_`-prefixed key is a bad request.
pub fn strip_reserved_keys(properties: &Body) -> CoreResult<Body> {
    let mut body = Body::new();
    for (key, value) in properties {
        if let Some(stripped) = key.strip_prefix('_') {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                return Err(CoreError::bad_request(format!(
                    "invalid top-level key '_{stripped}' in document"
                )));
            }
            continue;
        }
        body.insert(key.clone(), value.clone());
    }
    Ok(body)
}
