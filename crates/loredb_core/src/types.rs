//! Core type definitions for LoreDB.

use std::fmt;

/// Sequence number of a stored revision.
///
/// Sequence numbers are allocated from a single store-wide counter: they
/// increase monotonically across all documents and are never reused. A
/// revision's parent is referenced by its sequence rather than by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Internal numeric identifier for a document.
///
/// The documents relation maps the external string id to this compact key;
/// revision rows reference documents through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocKey(pub u32);

impl DocKey {
    /// Creates a new document key.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw key value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_number_ordering() {
        let s1 = SequenceNumber::new(1);
        let s2 = SequenceNumber::new(2);
        assert!(s1 < s2);
    }

    #[test]
    fn sequence_number_next() {
        let s = SequenceNumber::new(5);
        assert_eq!(s.next().as_u64(), 6);
    }

    #[test]
    fn doc_key_display() {
        let d = DocKey::new(42);
        assert_eq!(format!("{d}"), "doc:42");
    }
}
