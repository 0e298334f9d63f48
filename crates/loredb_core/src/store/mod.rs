//! The revision store.
//!
//! A [`RevisionStore`] owns every relation of the persisted logical schema:
//! documents (numeric key ↔ external id), revisions (sequence-keyed rows
//! with parent back-references), attachments, local documents, and the info
//! row holding the instance UUIDs. All mutation goes through its method API
//! inside a reentrant transaction; change notifications queue up and are
//! delivered only when the outermost transaction commits.

mod attachments;
mod compact;
mod insert;
mod local;
mod query;

pub use attachments::{inline_attachment, Attachment};
pub use compact::PurgeResult;
pub use insert::NewRevision;
pub use local::LocalDocument;
pub use query::ChangesOptions;

use crate::changes::{ChangeFeed, DocumentChange, Notifier};
use crate::error::{CoreError, CoreResult};
use crate::registry::FunctionRegistry;
use crate::revid::RevId;
use crate::revision::{BodyState, Revision};
use crate::types::{DocKey, SequenceNumber};
use loredb_blob::{BlobKey, BlobStore};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use uuid::Uuid;

/// Default number of generations retained by compaction pruning.
const DEFAULT_MAX_REV_TREE_DEPTH: u64 = 20;

/// One row of the revisions relation.
#[derive(Debug, Clone)]
pub(crate) struct RevRow {
    pub(crate) doc: DocKey,
    pub(crate) rev_id: RevId,
    pub(crate) parent: Option<SequenceNumber>,
    pub(crate) current: bool,
    pub(crate) deleted: bool,
    pub(crate) body: BodyState,
}

/// One row of the attachments relation, keyed by (sequence, name).
#[derive(Debug, Clone)]
pub(crate) struct AttachmentRow {
    pub(crate) content_type: String,
    pub(crate) length: u64,
    pub(crate) revpos: u64,
    pub(crate) key: BlobKey,
}

/// One row of the local-documents relation.
#[derive(Debug, Clone)]
pub(crate) struct LocalRow {
    pub(crate) rev_id: RevId,
    pub(crate) body: crate::revision::Body,
}

/// The in-memory realization of the persisted logical schema.
#[derive(Clone)]
pub(crate) struct Tables {
    doc_keys: HashMap<String, DocKey>,
    doc_ids: HashMap<DocKey, String>,
    next_doc_key: u32,
    pub(crate) revs: BTreeMap<SequenceNumber, RevRow>,
    doc_revs: HashMap<DocKey, Vec<SequenceNumber>>,
    pub(crate) attachments: BTreeMap<(SequenceNumber, String), AttachmentRow>,
    pub(crate) local_docs: HashMap<String, LocalRow>,
    last_sequence: u64,
    public_uuid: String,
    private_uuid: String,
}

impl Tables {
    fn new() -> Self {
        Self {
            doc_keys: HashMap::new(),
            doc_ids: HashMap::new(),
            next_doc_key: 1,
            revs: BTreeMap::new(),
            doc_revs: HashMap::new(),
            attachments: BTreeMap::new(),
            local_docs: HashMap::new(),
            last_sequence: 0,
            public_uuid: Uuid::new_v4().simple().to_string(),
            private_uuid: Uuid::new_v4().simple().to_string(),
        }
    }

    pub(crate) fn doc_key(&self, doc_id: &str) -> Option<DocKey> {
        self.doc_keys.get(doc_id).copied()
    }

    pub(crate) fn doc_id(&self, key: DocKey) -> &str {
        self.doc_ids
            .get(&key)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub(crate) fn get_or_create_doc(&mut self, doc_id: &str) -> DocKey {
        if let Some(key) = self.doc_keys.get(doc_id) {
            return *key;
        }
        let key = DocKey::new(self.next_doc_key);
        self.next_doc_key += 1;
        self.doc_keys.insert(doc_id.to_string(), key);
        self.doc_ids.insert(key, doc_id.to_string());
        key
    }

    /// All document ids known to the store, sorted.
    pub(crate) fn all_doc_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.doc_keys.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn allocate_sequence(&mut self) -> SequenceNumber {
        self.last_sequence += 1;
        SequenceNumber::new(self.last_sequence)
    }

    pub(crate) fn insert_row(&mut self, sequence: SequenceNumber, row: RevRow) {
        self.doc_revs.entry(row.doc).or_default().push(sequence);
        self.revs.insert(sequence, row);
    }

    /// Removes a revision row along with its attachment rows.
    pub(crate) fn remove_row(&mut self, sequence: SequenceNumber) {
        if let Some(row) = self.revs.remove(&sequence) {
            if let Some(seqs) = self.doc_revs.get_mut(&row.doc) {
                seqs.retain(|s| *s != sequence);
                if seqs.is_empty() {
                    self.doc_revs.remove(&row.doc);
                    if let Some(id) = self.doc_ids.remove(&row.doc) {
                        self.doc_keys.remove(&id);
                    }
                }
            }
        }
        self.remove_attachment_rows(sequence);
    }

    pub(crate) fn remove_attachment_rows(&mut self, sequence: SequenceNumber) {
        let names: Vec<String> = self
            .attachments
            .range((sequence, String::new())..(sequence.next(), String::new()))
            .map(|((_, name), _)| name.clone())
            .collect();
        for name in names {
            self.attachments.remove(&(sequence, name));
        }
    }

    /// Sequences of all revisions of a document, ascending.
    pub(crate) fn doc_sequences(&self, doc: DocKey) -> &[SequenceNumber] {
        self.doc_revs
            .get(&doc)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Finds a revision of `doc` by id.
    pub(crate) fn sequence_of(&self, doc: DocKey, rev_id: &RevId) -> Option<SequenceNumber> {
        self.doc_sequences(doc)
            .iter()
            .copied()
            .find(|seq| self.revs[seq].rev_id == *rev_id)
    }

    /// Sequences of the current (leaf) revisions of a document.
    pub(crate) fn current_sequences(&self, doc: DocKey) -> Vec<SequenceNumber> {
        self.doc_sequences(doc)
            .iter()
            .copied()
            .filter(|seq| self.revs[seq].current)
            .collect()
    }

    /// Re-scans the document's current revisions for its winner.
    ///
    /// Candidates order non-deleted first, then by descending revision id;
    /// the document is in conflict when two or more non-deleted leaves
    /// remain.
    pub(crate) fn winner_scan(&self, doc: DocKey) -> Option<WinnerInfo> {
        let mut current = self.current_sequences(doc);
        if current.is_empty() {
            return None;
        }
        current.sort_by(|a, b| {
            let ra = &self.revs[a];
            let rb = &self.revs[b];
            ra.deleted
                .cmp(&rb.deleted)
                .then_with(|| rb.rev_id.collate(&ra.rev_id))
        });
        let live_leaves = current
            .iter()
            .filter(|seq| !self.revs[*seq].deleted)
            .count();
        let winner = &self.revs[&current[0]];
        Some(WinnerInfo {
            sequence: current[0],
            rev_id: winner.rev_id.clone(),
            deleted: winner.deleted,
            conflict: live_leaves >= 2,
        })
    }

    /// Incremental winner update after inserting one revision.
    ///
    /// Returns the new winning revision id when it changed, `None` when the
    /// previous winner stands. Mirrors the store's documented algorithm:
    /// a live revision wins over a deleted or lesser winner; a deletion may
    /// beat a prior deletion by id, or force a full re-scan because the
    /// replaced leaf may have exposed another branch.
    pub(crate) fn pick_winner(
        &self,
        doc: DocKey,
        old_winner: Option<(&RevId, bool)>,
        new_rev_id: &RevId,
        new_deleted: bool,
    ) -> Option<RevId> {
        let Some((old_rev_id, old_deleted)) = old_winner else {
            return Some(new_rev_id.clone());
        };

        if !new_deleted {
            if old_deleted
                || new_rev_id.collate(old_rev_id) == std::cmp::Ordering::Greater
            {
                return Some(new_rev_id.clone());
            }
        } else if old_deleted {
            if new_rev_id.collate(old_rev_id) == std::cmp::Ordering::Greater {
                return Some(new_rev_id.clone());
            }
        } else {
            // The doc was alive and we tombstoned a leaf; another branch
            // may now be the winner.
            let rescanned = self.winner_scan(doc);
            if let Some(info) = rescanned {
                if info.rev_id != *old_rev_id {
                    return Some(info.rev_id);
                }
            }
        }

        None
    }

    /// Assembles the public view of a stored revision.
    pub(crate) fn make_revision(&self, sequence: SequenceNumber) -> Revision {
        let row = &self.revs[&sequence];
        Revision::new(
            self.doc_id(row.doc),
            row.rev_id.clone(),
            row.deleted,
            sequence,
            row.parent,
            row.body.clone(),
        )
    }
}

/// Result of a winner re-scan.
#[derive(Debug, Clone)]
pub(crate) struct WinnerInfo {
    pub(crate) sequence: SequenceNumber,
    pub(crate) rev_id: RevId,
    pub(crate) deleted: bool,
    pub(crate) conflict: bool,
}

struct TxnState {
    depth: u32,
    failed: bool,
    snapshot: Option<Tables>,
}

pub(crate) struct StoreInner {
    pub(crate) tables: Tables,
    txn: TxnState,
}

/// The document/revision storage engine.
///
/// A single logical writer: every mutating operation runs under the store
/// lock inside a (possibly nested) transaction. On rollback the relations
/// revert to their pre-transaction state; sequence numbers consumed by the
/// failed attempt are skipped, never reused.
pub struct RevisionStore {
    blobs: Arc<BlobStore>,
    registry: Arc<FunctionRegistry>,
    pub(crate) inner: Mutex<StoreInner>,
    notifier: Notifier,
    max_rev_tree_depth: AtomicU64,
}

impl RevisionStore {
    /// Creates a store over the given blob store and function registry.
    pub fn new(blobs: Arc<BlobStore>, registry: Arc<FunctionRegistry>) -> Self {
        Self {
            blobs,
            registry,
            inner: Mutex::new(StoreInner {
                tables: Tables::new(),
                txn: TxnState {
                    depth: 0,
                    failed: false,
                    snapshot: None,
                },
            }),
            notifier: Notifier::new(),
            max_rev_tree_depth: AtomicU64::new(DEFAULT_MAX_REV_TREE_DEPTH),
        }
    }

    /// The attachment blob store.
    #[must_use]
    pub fn blob_store(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    pub(crate) fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// The highest sequence number allocated so far.
    #[must_use]
    pub fn last_sequence(&self) -> SequenceNumber {
        SequenceNumber::new(self.inner.lock().tables.last_sequence)
    }

    /// Number of documents whose winning revision is not a tombstone.
    #[must_use]
    pub fn document_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .tables
            .doc_keys
            .values()
            .filter(|doc| {
                inner
                    .tables
                    .winner_scan(**doc)
                    .is_some_and(|w| !w.deleted)
            })
            .count()
    }

    /// Total number of stored revision rows (phantoms included).
    #[must_use]
    pub fn revision_count(&self) -> usize {
        self.inner.lock().tables.revs.len()
    }

    /// Number of generations compaction retains per document.
    #[must_use]
    pub fn max_rev_tree_depth(&self) -> u64 {
        self.max_rev_tree_depth.load(AtomicOrdering::Relaxed)
    }

    /// Configures the pruning depth used by [`RevisionStore::compact`].
    pub fn set_max_rev_tree_depth(&self, depth: u64) {
        self.max_rev_tree_depth
            .store(depth.max(1), AtomicOrdering::Relaxed);
    }

    /// The stable public instance UUID.
    #[must_use]
    pub fn public_uuid(&self) -> String {
        self.inner.lock().tables.public_uuid.clone()
    }

    /// The stable private instance UUID.
    #[must_use]
    pub fn private_uuid(&self) -> String {
        self.inner.lock().tables.private_uuid.clone()
    }

    /// Regenerates both instance UUIDs.
    pub fn replace_uuids(&self) {
        let mut inner = self.inner.lock();
        inner.tables.public_uuid = Uuid::new_v4().simple().to_string();
        inner.tables.private_uuid = Uuid::new_v4().simple().to_string();
    }

    /// The change feed for subscriptions and observers.
    #[must_use]
    pub fn changes(&self) -> &ChangeFeed {
        self.notifier.feed()
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Opens a (possibly nested) transaction.
    ///
    /// Change notifications are queued until the matching outermost
    /// [`RevisionStore::end_transaction`] commits.
    pub fn begin_transaction(&self) {
        let mut inner = self.inner.lock();
        if inner.txn.depth == 0 {
            inner.txn.snapshot = Some(inner.tables.clone());
            inner.txn.failed = false;
        }
        inner.txn.depth += 1;
    }

    /// Closes the innermost transaction.
    ///
    /// A non-commit at any nesting level fails the whole transaction: when
    /// the outermost level closes, the relations roll back and queued
    /// notifications are discarded. On a committed outermost close the
    /// queued notifications are flushed to listeners.
    pub fn end_transaction(&self, commit: bool) {
        let flush = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.txn.depth > 0, "end_transaction without begin");
            inner.txn.depth = inner.txn.depth.saturating_sub(1);
            if !commit {
                inner.txn.failed = true;
            }
            if inner.txn.depth > 0 {
                false
            } else if inner.txn.failed {
                if let Some(mut snapshot) = inner.txn.snapshot.take() {
                    // Sequence numbers consumed by the failed attempt stay
                    // consumed; they are skipped, never reused.
                    snapshot.last_sequence = inner.tables.last_sequence;
                    inner.tables = snapshot;
                }
                self.notifier.discard();
                false
            } else {
                inner.txn.snapshot = None;
                true
            }
        };
        if flush {
            // Outside the store lock: observers may call back in.
            self.notifier.flush();
        }
    }

    /// Runs `f` inside a transaction, committing on `Ok` and rolling back
    /// on `Err`.
    pub fn run_in_transaction<T>(
        &self,
        f: impl FnOnce() -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.begin_transaction();
        let result = f();
        self.end_transaction(result.is_ok());
        result
    }

    pub(crate) fn enqueue_change(&self, change: DocumentChange) {
        self.notifier.enqueue(change);
    }

    // ------------------------------------------------------------------
    // Shared lookups
    // ------------------------------------------------------------------

    /// Returns true if the document has any current revision.
    #[must_use]
    pub fn document_exists(&self, doc_id: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .tables
            .doc_key(doc_id)
            .is_some_and(|doc| !inner.tables.current_sequences(doc).is_empty())
    }

    /// Validates an external document id.
    pub(crate) fn check_doc_id(doc_id: &str) -> CoreResult<()> {
        if doc_id.is_empty() {
            return Err(CoreError::bad_request("empty document id"));
        }
        if doc_id.starts_with('_') {
            return Err(CoreError::bad_request(format!(
                "document id may not start with '_': {doc_id}"
            )));
        }
        Ok(())
    }

    /// Generates a fresh document id.
    pub(crate) fn generate_doc_id() -> String {
        Uuid::new_v4().simple().to_string()
    }
}

impl std::fmt::Debug for RevisionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionStore")
            .field("last_sequence", &self.last_sequence())
            .field("revision_count", &self.revision_count())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::test_store;
    use super::*;

    #[test]
    fn fresh_store_is_empty() {
        let (store, _dir) = test_store();
        assert_eq!(store.last_sequence().as_u64(), 0);
        assert_eq!(store.document_count(), 0);
        assert_eq!(store.revision_count(), 0);
    }

    #[test]
    fn uuids_are_stable_until_replaced() {
        let (store, _dir) = test_store();
        let public = store.public_uuid();
        let private = store.private_uuid();
        assert_ne!(public, private);
        assert_eq!(store.public_uuid(), public);

        store.replace_uuids();
        assert_ne!(store.public_uuid(), public);
        assert_ne!(store.private_uuid(), private);
    }

    #[test]
    fn doc_id_validation() {
        assert!(RevisionStore::check_doc_id("doc1").is_ok());
        assert!(RevisionStore::check_doc_id("").is_err());
        assert!(RevisionStore::check_doc_id("_design/x").is_err());
    }

    #[test]
    fn nested_transaction_rolls_back_as_a_whole() {
        let (store, _dir) = test_store();

        store.begin_transaction();
        {
            let mut inner = store.inner.lock();
            let doc = inner.tables.get_or_create_doc("doc1");
            let seq = inner.tables.allocate_sequence();
            inner.tables.insert_row(
                seq,
                RevRow {
                    doc,
                    rev_id: RevId::new("1-a"),
                    parent: None,
                    current: true,
                    deleted: false,
                    body: BodyState::Present(crate::revision::Body::new()),
                },
            );
        }
        store.begin_transaction();
        store.end_transaction(false); // inner failure poisons the outer txn
        store.end_transaction(true);

        assert_eq!(store.revision_count(), 0);
        // The consumed sequence number stays consumed after rollback.
        store.begin_transaction();
        let seq = store.inner.lock().tables.allocate_sequence();
        store.end_transaction(true);
        assert_eq!(seq.as_u64(), 2);
    }

    #[test]
    fn winner_scan_prefers_live_then_highest_revid() {
        let (store, _dir) = test_store();
        let mut inner = store.inner.lock();
        let doc = inner.tables.get_or_create_doc("doc1");

        for (rev_id, deleted) in [("3-zzz", true), ("2-aaa", false), ("2-bbb", false)] {
            let seq = inner.tables.allocate_sequence();
            inner.tables.insert_row(
                seq,
                RevRow {
                    doc,
                    rev_id: RevId::new(rev_id),
                    parent: None,
                    current: true,
                    deleted,
                    body: BodyState::Present(crate::revision::Body::new()),
                },
            );
        }

        let winner = inner.tables.winner_scan(doc).unwrap();
        assert_eq!(winner.rev_id.as_str(), "2-bbb");
        assert!(!winner.deleted);
        assert!(winner.conflict);
    }

    #[test]
    fn incremental_winner_matches_rescan() {
        let (store, _dir) = test_store();
        let mut inner = store.inner.lock();
        let doc = inner.tables.get_or_create_doc("doc1");

        let seq = inner.tables.allocate_sequence();
        inner.tables.insert_row(
            seq,
            RevRow {
                doc,
                rev_id: RevId::new("1-a"),
                parent: None,
                current: true,
                deleted: false,
                body: BodyState::Present(crate::revision::Body::new()),
            },
        );

        // No previous winner: the new revision wins.
        let picked = inner.tables.pick_winner(doc, None, &RevId::new("1-a"), false);
        assert_eq!(picked.unwrap().as_str(), "1-a");

        // A live higher revision beats the old winner.
        let picked = inner.tables.pick_winner(
            doc,
            Some((&RevId::new("1-a"), false)),
            &RevId::new("2-b"),
            false,
        );
        assert_eq!(picked.unwrap().as_str(), "2-b");

        // A lower live revision does not.
        let picked = inner.tables.pick_winner(
            doc,
            Some((&RevId::new("2-b"), false)),
            &RevId::new("2-a"),
            false,
        );
        assert!(picked.is_none());
    }
}
