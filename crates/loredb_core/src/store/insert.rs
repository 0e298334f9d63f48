//! Revision insertion: local writes and forced history merges.

use super::attachments::attachments_from_properties;
use super::{RevRow, RevisionStore};
use crate::changes::DocumentChange;
use crate::error::{CoreError, CoreResult, Status};
use crate::revid::RevId;
use crate::revision::{strip_reserved_keys, Body, BodyState, Revision};
use crate::types::SequenceNumber;
use tracing::debug;

/// An externally produced revision handed to
/// [`RevisionStore::force_insert`].
#[derive(Debug, Clone)]
pub struct NewRevision {
    /// Target document id.
    pub doc_id: String,
    /// The revision's own id (must equal the head of the supplied history).
    pub rev_id: RevId,
    /// Whether this revision is a tombstone.
    pub deleted: bool,
    /// The revision body; reserved keys are stripped, `_attachments` is
    /// processed. `None` stores an empty body.
    pub properties: Option<Body>,
}

impl RevisionStore {
    /// Creates or updates a document.
    ///
    /// `prev_rev_id` names the revision being replaced; `None` creates the
    /// document (or resurrects a deleted one). With `doc_id = None` a fresh
    /// id is generated. `allow_conflict` permits appending to a non-leaf
    /// revision, creating a conflicting branch.
    ///
    /// Returns the stored revision and `Created` (or `Ok` for deletions).
    /// Fails with `NotFound`/`Conflict` per optimistic concurrency,
    /// `Forbidden` when a validation function rejects, `BadRequest` on
    /// malformed input.
    pub fn put_revision(
        &self,
        doc_id: Option<&str>,
        prev_rev_id: Option<&RevId>,
        properties: Option<Body>,
        deleting: bool,
        allow_conflict: bool,
    ) -> CoreResult<(Revision, Status)> {
        self.run_in_transaction(|| {
            self.put_revision_in_txn(doc_id, prev_rev_id, properties, deleting, allow_conflict)
        })
    }

    fn put_revision_in_txn(
        &self,
        doc_id: Option<&str>,
        prev_rev_id: Option<&RevId>,
        properties: Option<Body>,
        deleting: bool,
        allow_conflict: bool,
    ) -> CoreResult<(Revision, Status)> {
        let doc_id = match doc_id {
            Some(id) => {
                Self::check_doc_id(id)?;
                id.to_string()
            }
            None => {
                if deleting {
                    return Err(CoreError::not_found("no document id to delete"));
                }
                Self::generate_doc_id()
            }
        };

        let body = match &properties {
            Some(props) => Some(strip_reserved_keys(props)?),
            None => None,
        };
        let attachments = match &properties {
            Some(props) => attachments_from_properties(props)?,
            None => None,
        };

        let mut inner = self.inner.lock();
        let tables = &mut inner.tables;

        let doc = tables.get_or_create_doc(&doc_id);
        let old_winner = tables.winner_scan(doc);

        // Resolve the parent revision per the optimistic-concurrency rules.
        let mut prev: Option<RevId> = prev_rev_id.cloned();
        let mut parent_sequence: Option<SequenceNumber> = None;

        if let Some(p) = &prev {
            match tables.sequence_of(doc, p) {
                Some(seq) => {
                    if !allow_conflict && !tables.revs[&seq].current {
                        return Err(CoreError::conflict(format!(
                            "revision {p} of {doc_id} has been superseded"
                        )));
                    }
                    parent_sequence = Some(seq);
                }
                None => {
                    // Unknown parent: a conflict if the document exists and
                    // conflicts are disallowed, otherwise plain not-found.
                    if !allow_conflict && old_winner.is_some() {
                        return Err(CoreError::conflict(format!(
                            "revision {p} is not the current revision of {doc_id}"
                        )));
                    }
                    return Err(CoreError::not_found(format!(
                        "no revision {p} of document {doc_id}"
                    )));
                }
            }
        } else if deleting {
            return Err(if old_winner.is_some() {
                CoreError::conflict(format!(
                    "deleting {doc_id} requires the current revision id"
                ))
            } else {
                CoreError::not_found(format!("no document {doc_id} to delete"))
            });
        } else if let Some(winner) = &old_winner {
            if winner.deleted {
                // Recreating a deleted document: parent the tombstone.
                prev = Some(winner.rev_id.clone());
                parent_sequence = Some(winner.sequence);
            } else {
                return Err(CoreError::conflict(format!(
                    "document {doc_id} already exists"
                )));
            }
        }

        if let Some(p) = &prev {
            if !p.is_valid() {
                return Err(CoreError::bad_request(format!(
                    "malformed previous revision id {p}"
                )));
            }
        }

        // A conflict exists afterwards if one existed before, or a live
        // revision was attached somewhere other than the winning leaf.
        let old_winner_rev = old_winner.as_ref().map(|w| w.rev_id.clone());
        let in_conflict = old_winner.as_ref().is_some_and(|w| w.conflict)
            || (!deleting && prev != old_winner_rev);

        let new_rev_id = RevId::child_of(prev.as_ref());
        let generation = new_rev_id.generation();

        // Validate before anything is inserted.
        let candidate = Revision::new(
            doc_id.clone(),
            new_rev_id.clone(),
            deleting,
            SequenceNumber::new(0),
            parent_sequence,
            BodyState::Present(body.clone().unwrap_or_default()),
        );
        let prev_revision = parent_sequence.map(|seq| tables.make_revision(seq));
        self.registry()
            .validate(&candidate, prev_revision.as_ref())
            .map_err(CoreError::forbidden)?;

        // Insert the row and its attachments.
        let sequence = tables.allocate_sequence();
        tables.insert_row(
            sequence,
            RevRow {
                doc,
                rev_id: new_rev_id.clone(),
                parent: parent_sequence,
                current: true,
                deleted: deleting,
                body: BodyState::Present(body.unwrap_or_default()),
            },
        );

        if let Some(atts) = &attachments {
            // Deletions carry no attachments.
            if !deleting {
                self.process_attachments(tables, atts, sequence, generation, parent_sequence)?;
            }
        }

        // The replaced revision is no longer a leaf.
        if let Some(parent) = parent_sequence {
            if let Some(row) = tables.revs.get_mut(&parent) {
                row.current = false;
            }
        }

        let winning_rev_id = tables
            .pick_winner(
                doc,
                old_winner.as_ref().map(|w| (&w.rev_id, w.deleted)),
                &new_rev_id,
                deleting,
            )
            .or(old_winner_rev);

        let revision = tables.make_revision(sequence);
        debug!(doc = %doc_id, rev = %new_rev_id, %sequence, deleting, "put revision");

        self.enqueue_change(DocumentChange {
            doc_id,
            rev_id: new_rev_id,
            winning_rev_id,
            in_conflict,
            source: None,
        });

        let status = if deleting { Status::Ok } else { Status::Created };
        Ok((revision, status))
    }

    /// Inserts a revision whose ancestry is already known, e.g. one pulled
    /// from a remote peer.
    ///
    /// `history` lists revision ids newest→oldest, starting with the
    /// revision itself. Ancestors not present locally are inserted as
    /// bodyless phantom revisions carrying linkage only; the leaf gets the
    /// real body and attachments. The change notification carries `source`
    /// so listeners can tell external edits from local ones.
    pub fn force_insert(
        &self,
        rev: NewRevision,
        history: &[RevId],
        source: Option<&str>,
    ) -> CoreResult<(Revision, Status)> {
        Self::check_doc_id(&rev.doc_id)?;
        if history.first() != Some(&rev.rev_id) {
            return Err(CoreError::bad_request(
                "revision id does not match the head of its history",
            ));
        }

        self.run_in_transaction(|| self.force_insert_in_txn(rev, history, source))
    }

    fn force_insert_in_txn(
        &self,
        rev: NewRevision,
        history: &[RevId],
        source: Option<&str>,
    ) -> CoreResult<(Revision, Status)> {
        let body = match &rev.properties {
            Some(props) => strip_reserved_keys(props)?,
            None => Body::new(),
        };
        let attachments = match &rev.properties {
            Some(props) => attachments_from_properties(props)?,
            None => None,
        };

        let mut inner = self.inner.lock();
        let tables = &mut inner.tables;

        let doc = tables.get_or_create_doc(&rev.doc_id);
        let old_winner = tables.winner_scan(doc);

        // Validate against the nearest locally known ancestor.
        let prev_revision = history[1..]
            .iter()
            .find_map(|id| tables.sequence_of(doc, id))
            .map(|seq| tables.make_revision(seq));
        let candidate = Revision::new(
            rev.doc_id.clone(),
            rev.rev_id.clone(),
            rev.deleted,
            SequenceNumber::new(0),
            None,
            BodyState::Present(body.clone()),
        );
        self.registry()
            .validate(&candidate, prev_revision.as_ref())
            .map_err(CoreError::forbidden)?;

        // Walk the history oldest→newest, filling gaps with phantoms.
        let mut sequence: Option<SequenceNumber> = None;
        let mut local_parent: Option<SequenceNumber> = None;
        for (i, rev_id) in history.iter().enumerate().rev() {
            if let Some(known) = tables.sequence_of(doc, rev_id) {
                sequence = Some(known);
                local_parent = Some(known);
                continue;
            }

            let parent = sequence;
            let seq = tables.allocate_sequence();
            if i == 0 {
                tables.insert_row(
                    seq,
                    RevRow {
                        doc,
                        rev_id: rev_id.clone(),
                        parent,
                        current: true,
                        deleted: rev.deleted,
                        body: BodyState::Present(body.clone()),
                    },
                );
                if let Some(atts) = &attachments {
                    if !rev.deleted {
                        self.process_attachments(
                            tables,
                            atts,
                            seq,
                            rev_id.generation(),
                            parent,
                        )?;
                    }
                }
            } else {
                tables.insert_row(
                    seq,
                    RevRow {
                        doc,
                        rev_id: rev_id.clone(),
                        parent,
                        current: false,
                        deleted: false,
                        body: BodyState::Missing,
                    },
                );
            }
            sequence = Some(seq);
        }

        let leaf_sequence = sequence.ok_or_else(|| {
            CoreError::bad_request("empty revision history")
        })?;

        if local_parent == Some(leaf_sequence) {
            // Everything was already known; nothing inserted.
            return Ok((tables.make_revision(leaf_sequence), Status::Ok));
        }

        // Retire the deepest known ancestor as a leaf. If it already had
        // other children, this insert created a branch.
        let mut in_conflict = old_winner.as_ref().is_some_and(|w| w.conflict);
        if let Some(parent_seq) = local_parent {
            if let Some(row) = tables.revs.get_mut(&parent_seq) {
                if row.current {
                    row.current = false;
                } else {
                    in_conflict = true;
                }
            }
        }

        let old_winner_rev = old_winner.as_ref().map(|w| w.rev_id.clone());
        let winning_rev_id = tables
            .pick_winner(
                doc,
                old_winner.as_ref().map(|w| (&w.rev_id, w.deleted)),
                &rev.rev_id,
                rev.deleted,
            )
            .or(old_winner_rev);

        let revision = tables.make_revision(leaf_sequence);
        debug!(
            doc = %rev.doc_id,
            rev = %rev.rev_id,
            history_len = history.len(),
            source,
            "force-inserted revision"
        );

        self.enqueue_change(DocumentChange {
            doc_id: rev.doc_id,
            rev_id: rev.rev_id,
            winning_rev_id,
            in_conflict,
            source: source.map(str::to_string),
        });

        Ok((revision, Status::Created))
    }
}
