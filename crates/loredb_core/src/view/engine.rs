//! Incremental index maintenance.

use super::{View, ViewRow};
use crate::error::{CoreError, CoreResult};
use crate::registry::Emitter;
use crate::store::ChangesOptions;
use crate::types::SequenceNumber;
use loredb_codec::canonical_json;
use tracing::debug;

impl View {
    /// Brings the index up to date with the revision store.
    ///
    /// One pass in ascending sequence order over every document whose
    /// current winning revision is newer than the last indexed sequence:
    /// the document's old rows are deleted, then — unless the document is
    /// deleted — the map function runs once over the winning revision's
    /// body (with `_id`/`_rev` and attachment stubs synthesized) and each
    /// emitted pair becomes one row keyed by the canonical form of its key.
    pub fn update_index(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(CoreError::not_found(format!(
                "view {} has been deleted",
                self.name()
            )));
        }
        let map = state.map.clone().ok_or_else(|| {
            CoreError::bad_request(format!(
                "view {} has no map function registered",
                self.name()
            ))
        })?;

        let store_sequence = self.store().last_sequence();
        let since = state.last_indexed;
        if since >= store_sequence {
            state.ever_indexed = true;
            return Ok(());
        }

        // Winners of every document that changed past our index point,
        // ascending by sequence.
        let changed = self.store().changes_since(
            since,
            &ChangesOptions {
                sort_by_sequence: true,
                ..ChangesOptions::default()
            },
            None,
        )?;

        let mut emitted = 0usize;
        let mut removed = 0usize;
        for winner in changed {
            let doc_id = winner.doc_id().to_string();
            let before = state.rows.len();
            state.rows.retain(|row| row.doc_id != doc_id);
            removed += before - state.rows.len();

            if winner.is_deleted() || !winner.body_available() {
                continue;
            }
            let Some(props) = self.store().revision_properties(&winner) else {
                continue;
            };

            let mut emitter = Emitter::new();
            map(&props, &mut emitter);
            for (key, value) in emitter.into_rows() {
                state.rows.push(ViewRow {
                    doc_id: doc_id.clone(),
                    sequence: winner.sequence(),
                    canonical_key: canonical_json(&key),
                    key,
                    value,
                });
                emitted += 1;
            }
        }

        Self::sort_rows(&mut state);
        state.last_indexed = store_sequence;
        state.ever_indexed = true;
        debug!(
            view = self.name(),
            emitted,
            removed,
            last_indexed = state.last_indexed.as_u64(),
            "updated view index"
        );
        Ok(())
    }

    /// Forgets indexed state back to a given sequence, for tests and
    /// diagnostics. Rows are not touched; the next update re-maps anything
    /// newer.
    pub fn rewind_index(&self, to: SequenceNumber) {
        let mut state = self.state.lock();
        if to < state.last_indexed {
            state.last_indexed = to;
        }
    }
}
