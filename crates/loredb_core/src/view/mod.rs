//! Map/reduce secondary indexes.
//!
//! A view owns a map function, an optional reduce function, a collation
//! mode, and its persisted index rows. Indexing is incremental: the view
//! remembers the store sequence it last indexed and re-maps only documents
//! that changed past it. Changing the view's version tag invalidates the
//! whole index and forces a rebuild from sequence zero.

mod engine;
mod query;

pub use query::{
    AllDocsMode, IndexUpdateMode, QueryOptions, QueryResult, QueryRow,
};

use crate::registry::{MapFunction, ReduceFunction};
use crate::store::RevisionStore;
use crate::types::SequenceNumber;
use loredb_codec::{Collation, Value};
use parking_lot::Mutex;
use std::sync::Arc;

/// Lifecycle of a view's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewLifecycle {
    /// Never indexed (or invalidated by a version change).
    Unbuilt,
    /// Indexed and current with the store.
    Indexed,
    /// Indexed, but the store has advanced past `last_indexed_sequence`.
    Stale,
    /// Removed; the view can no longer be indexed or queried.
    Deleted,
}

/// One persisted index row.
#[derive(Debug, Clone)]
pub(crate) struct ViewRow {
    pub(crate) doc_id: String,
    pub(crate) sequence: SequenceNumber,
    pub(crate) key: Value,
    /// Canonical serialization of `key`; the stored, comparable form.
    pub(crate) canonical_key: String,
    pub(crate) value: Value,
}

pub(crate) struct ViewState {
    pub(crate) map: Option<MapFunction>,
    pub(crate) reduce: Option<ReduceFunction>,
    pub(crate) version: String,
    pub(crate) collation: Collation,
    pub(crate) last_indexed: SequenceNumber,
    pub(crate) ever_indexed: bool,
    pub(crate) rows: Vec<ViewRow>,
    pub(crate) deleted: bool,
}

/// A named map/reduce view over the revision store.
pub struct View {
    name: String,
    store: Arc<RevisionStore>,
    pub(crate) state: Mutex<ViewState>,
}

impl View {
    pub(crate) fn new(name: impl Into<String>, store: Arc<RevisionStore>) -> Self {
        Self {
            name: name.into(),
            store,
            state: Mutex::new(ViewState {
                map: None,
                reduce: None,
                version: String::new(),
                collation: Collation::Unicode,
                last_indexed: SequenceNumber::new(0),
                ever_indexed: false,
                rows: Vec::new(),
                deleted: false,
            }),
        }
    }

    /// The view's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn store(&self) -> &Arc<RevisionStore> {
        &self.store
    }

    /// Registers the map (and optional reduce) function under a version
    /// tag.
    ///
    /// Changing the version tag drops every indexed row and resets the
    /// index to unbuilt — this is how "I changed my map function" is
    /// signalled. Returns true when the version changed.
    pub fn set_map(
        &self,
        map: MapFunction,
        reduce: Option<ReduceFunction>,
        version: impl Into<String>,
    ) -> bool {
        let version = version.into();
        let mut state = self.state.lock();
        let changed = state.version != version;
        state.map = Some(map);
        state.reduce = reduce;
        if changed {
            state.version = version;
            state.rows.clear();
            state.last_indexed = SequenceNumber::new(0);
            state.ever_indexed = false;
        }
        changed
    }

    /// The current version tag.
    #[must_use]
    pub fn version(&self) -> String {
        self.state.lock().version.clone()
    }

    /// Sets the key collation mode. Takes effect on the next index build;
    /// changing it on a built view re-sorts existing rows.
    pub fn set_collation(&self, collation: Collation) {
        let mut state = self.state.lock();
        if state.collation != collation {
            state.collation = collation;
            Self::sort_rows(&mut state);
        }
    }

    /// The key collation mode.
    #[must_use]
    pub fn collation(&self) -> Collation {
        self.state.lock().collation
    }

    /// The store sequence this view has indexed up to.
    #[must_use]
    pub fn last_indexed_sequence(&self) -> SequenceNumber {
        self.state.lock().last_indexed
    }

    /// Number of indexed rows.
    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// True when the store has advanced past the last indexed sequence.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        let state = self.state.lock();
        !state.deleted && state.last_indexed < self.store.last_sequence()
    }

    /// Where this view is in its lifecycle.
    #[must_use]
    pub fn lifecycle(&self) -> ViewLifecycle {
        let state = self.state.lock();
        if state.deleted {
            ViewLifecycle::Deleted
        } else if !state.ever_indexed {
            ViewLifecycle::Unbuilt
        } else if state.last_indexed < self.store.last_sequence() {
            ViewLifecycle::Stale
        } else {
            ViewLifecycle::Indexed
        }
    }

    /// Marks the view deleted, dropping its rows.
    pub(crate) fn mark_deleted(&self) {
        let mut state = self.state.lock();
        state.deleted = true;
        state.rows.clear();
        state.map = None;
        state.reduce = None;
    }

    pub(crate) fn sort_rows(state: &mut ViewState) {
        let collation = state.collation;
        state.rows.sort_by(|a, b| {
            collation
                .cmp_values(&a.key, &b.key)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle())
            .field("total_rows", &self.total_rows())
            .finish_non_exhaustive()
    }
}
