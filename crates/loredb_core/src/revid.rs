//! Revision identifiers.
//!
//! A revision id has the form `"<generation>-<suffix>"`: a positive decimal
//! generation number, a dash, and an opaque suffix token. Ids are compared
//! by generation first, then by byte-wise suffix comparison; malformed ids
//! collate as plain text and never cause an error.

use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// A revision identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevId(String);

/// Suffix marking a local (non-replicated) document revision.
pub(crate) const LOCAL_SUFFIX: &str = "local";

impl RevId {
    /// Wraps a revision id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits into (generation, suffix) if the id is well formed.
    ///
    /// Well formed means a non-empty all-digit generation part before the
    /// first dash. Leading/trailing whitespace in the generation part makes
    /// the id malformed.
    fn parse(&self) -> Option<(u64, &str)> {
        let (gen_str, suffix) = self.0.split_once('-')?;
        if gen_str.is_empty() || !gen_str.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let generation = gen_str.parse().ok()?;
        Some((generation, suffix))
    }

    /// Returns the generation number, or 0 for a malformed id.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.parse().map(|(generation, _)| generation).unwrap_or(0)
    }

    /// Returns the opaque suffix, or an empty string for a malformed id.
    #[must_use]
    pub fn suffix(&self) -> &str {
        self.parse().map(|(_, suffix)| suffix).unwrap_or("")
    }

    /// Returns true if the id has a valid `"<generation>-<suffix>"` shape.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.parse().is_some()
    }

    /// Returns true if this is a local-document revision id (`"<n>-local"`).
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.parse()
            .is_some_and(|(_, suffix)| suffix == LOCAL_SUFFIX)
    }

    /// Collates two revision ids.
    ///
    /// Generations compare numerically, then suffixes compare byte-wise.
    /// If either id is malformed, both compare as case-insensitive plain
    /// text so that sorting never fails.
    #[must_use]
    pub fn collate(&self, other: &Self) -> Ordering {
        match (self.parse(), other.parse()) {
            (Some((gen_a, suf_a)), Some((gen_b, suf_b))) => gen_a
                .cmp(&gen_b)
                .then_with(|| suf_a.as_bytes().cmp(suf_b.as_bytes())),
            _ => {
                let a = self.0.to_ascii_lowercase();
                let b = other.0.to_ascii_lowercase();
                a.cmp(&b)
            }
        }
    }

    /// Generates the id for a child of `parent` (or for a first revision
    /// when `parent` is `None`): the next generation plus a fresh opaque
    /// token.
    ///
    /// The token is random rather than a content digest; only the
    /// generation/suffix ordering of ids is significant to the store.
    #[must_use]
    pub fn child_of(parent: Option<&RevId>) -> Self {
        let generation = parent.map(|p| p.generation()).unwrap_or(0) + 1;
        let token = Uuid::new_v4().simple().to_string();
        Self(format!("{generation}-{token}"))
    }

    /// Builds a local-document revision id for the given generation.
    #[must_use]
    pub fn local(generation: u64) -> Self {
        Self(format!("{generation}-{LOCAL_SUFFIX}"))
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RevId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
