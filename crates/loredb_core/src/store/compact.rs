//! Compaction, pruning, attachment garbage collection, and purge.

use super::{RevisionStore, Tables};
use crate::error::CoreResult;
use crate::revision::BodyState;
use crate::types::SequenceNumber;
use loredb_blob::BlobKey;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Map of document id to the revision ids actually purged.
pub type PurgeResult = HashMap<String, Vec<String>>;

impl RevisionStore {
    /// Compacts the store.
    ///
    /// No revision row that is still reachable is deleted outright; instead:
    /// 1. bodies of non-current revisions are cleared (their linkage stays,
    ///    so history queries keep working, but the body is permanently
    ///    unavailable),
    /// 2. revisions older than the retained tree depth are pruned, and
    /// 3. attachment blobs no longer referenced by any remaining row are
    ///    garbage-collected from the blob store.
    ///
    /// Pruning is decided per document from the minimum and maximum
    /// generation over all of its branches, not per branch: a short
    /// conflicting branch next to a long one can lose everything but its
    /// leaf. That is long-standing documented behavior, kept as is.
    pub fn compact(&self) -> CoreResult<()> {
        let pruned = self.run_in_transaction(|| {
            let mut inner = self.inner.lock();
            let tables = &mut inner.tables;

            // Clear bodies (and attachment references) of replaced revisions.
            let to_strip: Vec<SequenceNumber> = tables
                .revs
                .iter()
                .filter(|(_, row)| !row.current && matches!(row.body, BodyState::Present(_)))
                .map(|(seq, _)| *seq)
                .collect();
            for seq in &to_strip {
                if let Some(row) = tables.revs.get_mut(seq) {
                    row.body = BodyState::Compacted;
                }
                tables.remove_attachment_rows(*seq);
            }
            debug!(stripped = to_strip.len(), "cleared bodies of old revisions");

            Ok(Self::prune_to_depth(tables, self.max_rev_tree_depth()))
        })?;

        // Blob GC runs after the transaction: file deletion cannot be
        // rolled back, so it must only see committed state.
        let reachable: HashSet<BlobKey> = {
            let inner = self.inner.lock();
            inner
                .tables
                .attachments
                .values()
                .map(|row| row.key)
                .collect()
        };
        let deleted = self.blob_store().delete_all_except(&reachable)?;
        info!(pruned, blobs_deleted = deleted, "compaction finished");
        Ok(())
    }

    /// Drops non-current revisions whose generation falls below the
    /// per-document retention window. Returns the number of rows removed.
    fn prune_to_depth(tables: &mut Tables, depth: u64) -> usize {
        // Decide per document from the global generation span.
        let mut min_keep: HashMap<super::DocKey, u64> = HashMap::new();
        for row in tables.revs.values() {
            let generation = row.rev_id.generation();
            let entry = min_keep.entry(row.doc).or_insert(0);
            *entry = (*entry).max(generation.saturating_sub(depth - 1));
        }

        let doomed: Vec<SequenceNumber> = tables
            .revs
            .iter()
            .filter(|(_, row)| {
                !row.current
                    && min_keep
                        .get(&row.doc)
                        .is_some_and(|keep| row.rev_id.generation() < *keep)
            })
            .map(|(seq, _)| *seq)
            .collect();

        for seq in &doomed {
            tables.remove_row(*seq);
        }
        doomed.len()
    }

    /// Physically deletes the named revisions — no tombstones — along with
    /// any ancestor that becomes unreachable as a result.
    ///
    /// `"*"` as a revision id wipes the whole document. Leaves that were
    /// not named (and their ancestries) survive. Returns, per document, the
    /// ids actually removed.
    pub fn purge(&self, docs_to_revs: &HashMap<String, Vec<String>>) -> CoreResult<PurgeResult> {
        self.run_in_transaction(|| {
            let mut result = PurgeResult::new();
            let mut inner = self.inner.lock();
            let tables = &mut inner.tables;

            for (doc_id, rev_ids) in docs_to_revs {
                let Some(doc) = tables.doc_key(doc_id) else {
                    // No such document: report nothing purged.
                    result.insert(doc_id.clone(), Vec::new());
                    continue;
                };

                if rev_ids.is_empty() {
                    result.insert(doc_id.clone(), Vec::new());
                    continue;
                }

                if rev_ids.iter().any(|r| r == "*") {
                    let all: Vec<SequenceNumber> = tables.doc_sequences(doc).to_vec();
                    for seq in all {
                        tables.remove_row(seq);
                    }
                    debug!(doc = %doc_id, "purged entire document");
                    result.insert(doc_id.clone(), vec!["*".to_string()]);
                    continue;
                }

                // Walk newest to oldest, keeping non-targeted leaves and
                // everything they can reach.
                let mut seqs_to_purge: HashSet<SequenceNumber> = HashSet::new();
                let mut seqs_to_keep: HashSet<SequenceNumber> = HashSet::new();
                let mut revs_purged: HashSet<String> = HashSet::new();

                let sequences: Vec<SequenceNumber> =
                    tables.doc_sequences(doc).iter().rev().copied().collect();
                for seq in sequences {
                    let row = &tables.revs[&seq];
                    let rev_str = row.rev_id.as_str().to_string();
                    let targeted = rev_ids.iter().any(|r| *r == rev_str);

                    if seqs_to_purge.contains(&seq)
                        || (targeted && !seqs_to_keep.contains(&seq))
                    {
                        seqs_to_purge.insert(seq);
                        revs_purged.insert(rev_str);
                        if let Some(parent) = row.parent {
                            seqs_to_purge.insert(parent);
                        }
                    } else {
                        seqs_to_purge.remove(&seq);
                        revs_purged.remove(&rev_str);
                        if let Some(parent) = row.parent {
                            seqs_to_keep.insert(parent);
                        }
                    }
                }

                for seq in seqs_to_purge.difference(&seqs_to_keep).copied().collect::<Vec<_>>() {
                    tables.remove_row(seq);
                }

                let mut purged: Vec<String> = rev_ids
                    .iter()
                    .filter(|r| revs_purged.contains(*r))
                    .cloned()
                    .collect();
                purged.sort();
                debug!(doc = %doc_id, purged = purged.len(), "purged revisions");
                result.insert(doc_id.clone(), purged);
            }

            Ok(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::test_store;
    use super::*;
    use crate::revid::RevId;
    use crate::revision::Body;
    use crate::store::NewRevision;
    use serde_json::json;

    fn put_chain(store: &RevisionStore, doc: &str, n: usize) -> Vec<crate::revision::Revision> {
        let mut revs = Vec::new();
        let mut prev: Option<RevId> = None;
        for i in 0..n {
            let mut body = Body::new();
            body.insert("i".to_string(), json!(i));
            let (rev, _) = store
                .put_revision(Some(doc), prev.as_ref(), Some(body), false, false)
                .unwrap();
            prev = Some(rev.rev_id().clone());
            revs.push(rev);
        }
        revs
    }

    #[test]
    fn compact_strips_old_bodies_keeps_current() {
        let (store, _dir) = test_store();
        let revs = put_chain(&store, "doc1", 3);

        store.compact().unwrap();

        let current = store.get_document("doc1", None).unwrap();
        assert!(current.body_available());
        assert_eq!(current.rev_id(), revs[2].rev_id());

        let old = store
            .get_document("doc1", Some(revs[1].rev_id()))
            .unwrap();
        assert!(!old.body_available());
        assert_eq!(*old.body(), BodyState::Compacted);

        // History still walks the full chain.
        let history = store.revision_history(&current).unwrap();
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn compact_garbage_collects_unreferenced_blobs() {
        let (store, _dir) = test_store();

        // Rev 1 carries an attachment, rev 2 replaces it with new content.
        let mut props = Body::new();
        props.insert(
            "_attachments".to_string(),
            json!({"file.bin": crate::store::attachments::inline_attachment(
                "application/octet-stream",
                b"old content",
            )}),
        );
        let (rev1, _) = store
            .put_revision(Some("doc1"), None, Some(props), false, false)
            .unwrap();

        let mut props2 = Body::new();
        props2.insert(
            "_attachments".to_string(),
            json!({"file.bin": crate::store::attachments::inline_attachment(
                "application/octet-stream",
                b"new content",
            )}),
        );
        let (rev2, _) = store
            .put_revision(Some("doc1"), Some(rev1.rev_id()), Some(props2), false, false)
            .unwrap();

        assert_eq!(store.blob_store().count().unwrap(), 2);
        store.compact().unwrap();

        // The blob referenced only by the stripped body is gone; the
        // surviving attachment's blob remains readable.
        assert_eq!(store.blob_store().count().unwrap(), 1);
        let (_, bytes) = store.get_attachment(&rev2, "file.bin").unwrap();
        assert_eq!(bytes, b"new content");
    }

    #[test]
    fn compact_prunes_beyond_tree_depth() {
        let (store, _dir) = test_store();
        store.set_max_rev_tree_depth(5);
        put_chain(&store, "doc1", 12);

        store.compact().unwrap();

        // Generations 8..=12 survive (depth 5 from the max); the leaf is
        // untouched.
        assert_eq!(store.revision_count(), 5);
        let current = store.get_document("doc1", None).unwrap();
        assert_eq!(current.rev_id().generation(), 12);
        let history = store.revision_history(&current).unwrap();
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn prune_uses_global_generation_window() {
        // Documented characteristic: the pruning window is computed from
        // the document's overall min/max generation, not per branch, so a
        // short conflicting branch is pruned down to just its leaf.
        let (store, _dir) = test_store();
        store.set_max_rev_tree_depth(4);

        // Long branch: generations 1..=10.
        let revs = put_chain(&store, "doc1", 10);
        // Short conflicting branch off generation 1: leaf at generation 2.
        let (short_leaf, _) = store
            .put_revision(
                Some("doc1"),
                Some(revs[0].rev_id()),
                Some(Body::new()),
                false,
                true,
            )
            .unwrap();

        store.compact().unwrap();

        // The short branch kept only its (current) leaf even though its own
        // branch depth was 2.
        let leaf = store
            .get_document("doc1", Some(short_leaf.rev_id()))
            .unwrap();
        let history = store.revision_history(&leaf).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn purge_named_leaf_and_ancestors() {
        let (store, _dir) = test_store();
        let revs = put_chain(&store, "doc1", 3);

        let mut request = HashMap::new();
        request.insert(
            "doc1".to_string(),
            vec![revs[2].rev_id().as_str().to_string()],
        );
        let result = store.purge(&request).unwrap();

        // The whole chain became unreachable and went with the leaf.
        assert_eq!(result["doc1"].len(), 1);
        assert_eq!(store.revision_count(), 0);
        assert!(store.get_document("doc1", None).is_err());
    }

    #[test]
    fn purge_keeps_untargeted_branch() {
        let (store, _dir) = test_store();
        let revs = put_chain(&store, "doc1", 2);
        let (branch, _) = store
            .put_revision(
                Some("doc1"),
                Some(revs[0].rev_id()),
                Some(Body::new()),
                false,
                true,
            )
            .unwrap();

        let mut request = HashMap::new();
        request.insert(
            "doc1".to_string(),
            vec![branch.rev_id().as_str().to_string()],
        );
        let result = store.purge(&request).unwrap();

        assert_eq!(result["doc1"], vec![branch.rev_id().as_str().to_string()]);
        // The main chain (2 revisions) survives: its leaf was not named and
        // the shared root is still reachable from it.
        assert_eq!(store.revision_count(), 2);
        let current = store.get_document("doc1", None).unwrap();
        assert_eq!(current.rev_id(), revs[1].rev_id());
    }

    #[test]
    fn purge_star_wipes_document() {
        let (store, _dir) = test_store();
        put_chain(&store, "doc1", 3);
        put_chain(&store, "doc2", 1);

        let mut request = HashMap::new();
        request.insert("doc1".to_string(), vec!["*".to_string()]);
        let result = store.purge(&request).unwrap();

        assert_eq!(result["doc1"], vec!["*".to_string()]);
        assert!(store.get_document("doc1", None).is_err());
        assert!(store.get_document("doc2", None).is_ok());
        assert_eq!(store.revision_count(), 1);
    }

    #[test]
    fn purge_unknown_document_reports_empty() {
        let (store, _dir) = test_store();
        let mut request = HashMap::new();
        request.insert("ghost".to_string(), vec!["1-a".to_string()]);
        let result = store.purge(&request).unwrap();
        assert!(result["ghost"].is_empty());
    }

    #[test]
    fn compacted_phantoms_stay_phantoms() {
        let (store, _dir) = test_store();
        let history: Vec<RevId> = ["3-c", "2-b", "1-a"]
            .iter()
            .map(|s| RevId::new(*s))
            .collect();
        store
            .force_insert(
                NewRevision {
                    doc_id: "doc1".to_string(),
                    rev_id: RevId::new("3-c"),
                    deleted: false,
                    properties: None,
                },
                &history,
                None,
            )
            .unwrap();

        store.compact().unwrap();

        let leaf = store.get_document("doc1", None).unwrap();
        let chain = store.revision_history(&leaf).unwrap();
        assert_eq!(*chain[1].body(), BodyState::Missing);
    }
}
