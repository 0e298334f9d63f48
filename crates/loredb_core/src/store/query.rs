//! Read paths: document lookup, revision history, changes feed.

use super::RevisionStore;
use crate::error::{CoreError, CoreResult};
use crate::registry::ChangesFilter;
use crate::revid::RevId;
use crate::revision::Revision;
use crate::types::SequenceNumber;

/// Options for [`RevisionStore::changes_since`].
#[derive(Debug, Clone)]
pub struct ChangesOptions {
    /// Maximum number of revisions to return.
    pub limit: Option<usize>,
    /// Return every current revision of a conflicted document instead of
    /// just the winner.
    pub include_conflicts: bool,
    /// Order results by sequence number instead of document id.
    pub sort_by_sequence: bool,
    /// With `sort_by_sequence`, descending instead of ascending.
    pub descending: bool,
}

impl Default for ChangesOptions {
    fn default() -> Self {
        Self {
            limit: None,
            include_conflicts: false,
            sort_by_sequence: false,
            descending: false,
        }
    }
}

impl RevisionStore {
    /// Fetches a revision of a document.
    ///
    /// With `rev_id = None` the winning revision is returned (which may be
    /// a tombstone; callers decide how to surface deletion).
    pub fn get_document(
        &self,
        doc_id: &str,
        rev_id: Option<&RevId>,
    ) -> CoreResult<Revision> {
        let inner = self.inner.lock();
        let doc = inner
            .tables
            .doc_key(doc_id)
            .ok_or_else(|| CoreError::not_found(format!("no document {doc_id}")))?;

        let sequence = match rev_id {
            Some(rev_id) => inner.tables.sequence_of(doc, rev_id).ok_or_else(|| {
                CoreError::not_found(format!("no revision {rev_id} of {doc_id}"))
            })?,
            None => {
                inner
                    .tables
                    .winner_scan(doc)
                    .ok_or_else(|| {
                        CoreError::not_found(format!("document {doc_id} has no revisions"))
                    })?
                    .sequence
            }
        };
        Ok(inner.tables.make_revision(sequence))
    }

    /// The winning revision id of a document, if the document exists.
    #[must_use]
    pub fn winning_rev_id(&self, doc_id: &str) -> Option<RevId> {
        let inner = self.inner.lock();
        let doc = inner.tables.doc_key(doc_id)?;
        inner.tables.winner_scan(doc).map(|w| w.rev_id)
    }

    /// Ids of the current non-winning revisions of a document.
    ///
    /// Empty unless the document is in conflict (or its only leaves are
    /// tombstones beside the winner).
    #[must_use]
    pub fn conflicting_rev_ids(&self, doc_id: &str) -> Vec<RevId> {
        let inner = self.inner.lock();
        let Some(doc) = inner.tables.doc_key(doc_id) else {
            return Vec::new();
        };
        let Some(winner) = inner.tables.winner_scan(doc) else {
            return Vec::new();
        };
        let mut ids: Vec<RevId> = inner
            .tables
            .current_sequences(doc)
            .into_iter()
            .filter(|seq| *seq != winner.sequence)
            .filter(|seq| !inner.tables.revs[seq].deleted)
            .map(|seq| inner.tables.revs[&seq].rev_id.clone())
            .collect();
        ids.sort_by(|a, b| b.collate(a));
        ids
    }

    /// Every revision of a document, newest sequence first.
    ///
    /// Includes non-current revisions and phantoms.
    pub fn all_document_revisions(&self, doc_id: &str) -> CoreResult<Vec<Revision>> {
        let inner = self.inner.lock();
        let doc = inner
            .tables
            .doc_key(doc_id)
            .ok_or_else(|| CoreError::not_found(format!("no document {doc_id}")))?;
        Ok(inner
            .tables
            .doc_sequences(doc)
            .iter()
            .rev()
            .map(|seq| inner.tables.make_revision(*seq))
            .collect())
    }

    /// The ancestry of a revision, from the revision itself back to the
    /// root.
    ///
    /// Phantom and compacted ancestors still appear, with the correct id
    /// and deletion flag but an unavailable body.
    pub fn revision_history(&self, revision: &Revision) -> CoreResult<Vec<Revision>> {
        let inner = self.inner.lock();
        let mut history = Vec::new();
        let mut cursor = Some(revision.sequence());
        while let Some(seq) = cursor {
            // A pruned ancestor ends the walk: the chain simply stops at
            // the oldest revision still stored.
            let Some(row) = inner.tables.revs.get(&seq) else {
                break;
            };
            history.push(inner.tables.make_revision(seq));
            cursor = row.parent;
        }
        if history.is_empty() {
            return Err(CoreError::not_found(format!(
                "revision {} of {} is not stored",
                revision.rev_id(),
                revision.doc_id()
            )));
        }
        Ok(history)
    }

    /// Like [`RevisionStore::revision_history`], truncated at the first id
    /// found in `ancestors` (that ancestor is included).
    pub fn revision_history_from_ancestors(
        &self,
        revision: &Revision,
        ancestors: &[RevId],
    ) -> CoreResult<Vec<Revision>> {
        let full = self.revision_history(revision)?;
        if ancestors.is_empty() {
            return Ok(full);
        }
        let mut truncated = Vec::new();
        for rev in full {
            let stop = ancestors.contains(rev.rev_id());
            truncated.push(rev);
            if stop {
                break;
            }
        }
        Ok(truncated)
    }

    /// Revisions changed since a sequence number.
    ///
    /// Returns, for every document whose latest current revision has a
    /// sequence greater than `since`, its winning revision — or all of its
    /// current revisions with `include_conflicts`. A filter predicate can
    /// drop individual revisions. Default order is by document id; with
    /// `sort_by_sequence` results order by sequence (descending when
    /// requested) before the limit applies.
    pub fn changes_since(
        &self,
        since: SequenceNumber,
        options: &ChangesOptions,
        filter: Option<&ChangesFilter>,
    ) -> CoreResult<Vec<Revision>> {
        let inner = self.inner.lock();
        let mut changes: Vec<Revision> = Vec::new();

        for doc_id in inner.tables.all_doc_ids() {
            let Some(doc) = inner.tables.doc_key(&doc_id) else {
                continue;
            };
            let current = inner.tables.current_sequences(doc);
            let latest = current.iter().copied().max();
            if latest.is_none_or(|seq| seq <= since) {
                continue;
            }

            let picked: Vec<SequenceNumber> = if options.include_conflicts {
                let mut all = current;
                all.sort();
                all
            } else {
                match inner.tables.winner_scan(doc) {
                    Some(winner) => vec![winner.sequence],
                    None => continue,
                }
            };

            for seq in picked {
                let revision = inner.tables.make_revision(seq);
                if filter.is_none_or(|f| f(&revision)) {
                    changes.push(revision);
                }
            }
        }

        if options.sort_by_sequence {
            changes.sort_by_key(Revision::sequence);
            if options.descending {
                changes.reverse();
            }
        }
        if let Some(limit) = options.limit {
            changes.truncate(limit);
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::test_store;
    use super::super::NewRevision;
    use super::*;
    use crate::revision::Body;
    use std::sync::Arc;

    fn seed_chain(store: &super::super::RevisionStore, doc: &str, n: usize) -> Vec<Revision> {
        let mut revs = Vec::new();
        let mut prev: Option<RevId> = None;
        for _ in 0..n {
            let (rev, _) = store
                .put_revision(Some(doc), prev.as_ref(), Some(Body::new()), false, false)
                .unwrap();
            prev = Some(rev.rev_id().clone());
            revs.push(rev);
        }
        revs
    }

    #[test]
    fn get_document_by_rev_and_winner() {
        let (store, _dir) = test_store();
        let revs = seed_chain(&store, "doc1", 3);

        let winner = store.get_document("doc1", None).unwrap();
        assert_eq!(winner.rev_id(), revs[2].rev_id());

        let old = store.get_document("doc1", Some(revs[0].rev_id())).unwrap();
        assert_eq!(old.rev_id(), revs[0].rev_id());

        assert!(store.get_document("missing", None).is_err());
        assert!(store
            .get_document("doc1", Some(&RevId::new("9-none")))
            .is_err());
    }

    #[test]
    fn history_walks_to_the_root() {
        let (store, _dir) = test_store();
        let revs = seed_chain(&store, "doc1", 4);

        let history = store.revision_history(&revs[3]).unwrap();
        assert_eq!(history.len(), 4);
        // Newest first, generations descending to 1.
        let gens: Vec<u64> = history.iter().map(|r| r.rev_id().generation()).collect();
        assert_eq!(gens, vec![4, 3, 2, 1]);
        assert!(history.last().unwrap().parent_sequence().is_none());
    }

    #[test]
    fn history_includes_phantoms_with_unavailable_bodies() {
        let (store, _dir) = test_store();
        let history_ids: Vec<RevId> = ["3-c", "2-b", "1-a"]
            .iter()
            .map(|s| RevId::new(*s))
            .collect();
        let (leaf, _) = store
            .force_insert(
                NewRevision {
                    doc_id: "doc1".to_string(),
                    rev_id: RevId::new("3-c"),
                    deleted: false,
                    properties: None,
                },
                &history_ids,
                None,
            )
            .unwrap();

        let history = store.revision_history(&leaf).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].body_available());
        assert!(!history[1].body_available());
        assert!(!history[2].body_available());
        assert_eq!(history[1].rev_id().as_str(), "2-b");
    }

    #[test]
    fn history_truncates_at_known_ancestor() {
        let (store, _dir) = test_store();
        let revs = seed_chain(&store, "doc1", 4);

        let truncated = store
            .revision_history_from_ancestors(&revs[3], &[revs[1].rev_id().clone()])
            .unwrap();
        assert_eq!(truncated.len(), 3);
        assert_eq!(truncated.last().unwrap().rev_id(), revs[1].rev_id());
    }

    #[test]
    fn changes_since_reports_winners_after_sequence() {
        let (store, _dir) = test_store();
        seed_chain(&store, "alpha", 2); // sequences 1, 2
        seed_chain(&store, "beta", 1); // sequence 3

        let all = store
            .changes_since(SequenceNumber::new(0), &ChangesOptions::default(), None)
            .unwrap();
        assert_eq!(all.len(), 2);

        // Nothing for beta before sequence 3.
        let after = store
            .changes_since(SequenceNumber::new(2), &ChangesOptions::default(), None)
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].doc_id(), "beta");

        let none = store
            .changes_since(SequenceNumber::new(3), &ChangesOptions::default(), None)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn changes_since_with_conflicts_lists_all_leaves() {
        let (store, _dir) = test_store();
        let revs = seed_chain(&store, "doc1", 1);
        // Create a conflicting branch.
        store
            .put_revision(
                Some("doc1"),
                Some(revs[0].rev_id()),
                Some(Body::new()),
                false,
                false,
            )
            .unwrap();
        store
            .put_revision(
                Some("doc1"),
                Some(revs[0].rev_id()),
                Some(Body::new()),
                false,
                true,
            )
            .unwrap();

        let winner_only = store
            .changes_since(SequenceNumber::new(0), &ChangesOptions::default(), None)
            .unwrap();
        assert_eq!(winner_only.len(), 1);

        let with_conflicts = store
            .changes_since(
                SequenceNumber::new(0),
                &ChangesOptions {
                    include_conflicts: true,
                    ..ChangesOptions::default()
                },
                None,
            )
            .unwrap();
        assert_eq!(with_conflicts.len(), 2);
    }

    #[test]
    fn changes_since_filter_and_limit() {
        let (store, _dir) = test_store();
        seed_chain(&store, "keep1", 1);
        seed_chain(&store, "skip", 1);
        seed_chain(&store, "keep2", 1);

        let filter: ChangesFilter =
            Arc::new(|rev: &Revision| !rev.doc_id().starts_with("skip"));
        let changes = store
            .changes_since(SequenceNumber::new(0), &ChangesOptions::default(), Some(&filter))
            .unwrap();
        assert_eq!(changes.len(), 2);

        let limited = store
            .changes_since(
                SequenceNumber::new(0),
                &ChangesOptions {
                    limit: Some(1),
                    sort_by_sequence: true,
                    ..ChangesOptions::default()
                },
                None,
            )
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].doc_id(), "keep1");
    }

    #[test]
    fn changes_since_sort_descending() {
        let (store, _dir) = test_store();
        seed_chain(&store, "a", 1);
        seed_chain(&store, "b", 1);

        let desc = store
            .changes_since(
                SequenceNumber::new(0),
                &ChangesOptions {
                    sort_by_sequence: true,
                    descending: true,
                    ..ChangesOptions::default()
                },
                None,
            )
            .unwrap();
        let seqs: Vec<u64> = desc.iter().map(|r| r.sequence().as_u64()).collect();
        assert_eq!(seqs, vec![2, 1]);
    }

    #[test]
    fn conflicting_rev_ids_lists_losers() {
        let (store, _dir) = test_store();
        let revs = seed_chain(&store, "doc1", 1);
        let (a, _) = store
            .put_revision(
                Some("doc1"),
                Some(revs[0].rev_id()),
                Some(Body::new()),
                false,
                false,
            )
            .unwrap();
        let (b, _) = store
            .put_revision(
                Some("doc1"),
                Some(revs[0].rev_id()),
                Some(Body::new()),
                false,
                true,
            )
            .unwrap();

        let winner = store.winning_rev_id("doc1").unwrap();
        let losers = store.conflicting_rev_ids("doc1");
        assert_eq!(losers.len(), 1);
        let expected_loser = if winner == *a.rev_id() {
            b.rev_id().clone()
        } else {
            a.rev_id().clone()
        };
        assert_eq!(losers[0], expected_loser);
    }
}
