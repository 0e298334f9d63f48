//! Local (non-replicated) documents.
//!
//! Local documents live outside the revision trees: no branching, no
//! conflicts, no indexing, no replication visibility, and no change
//! notifications. Concurrency control is purely optimistic — the caller
//! must present the current `"<n>-local"` revision id to update or delete.

use super::{LocalRow, RevisionStore};
use crate::error::{CoreError, CoreResult};
use crate::revid::RevId;
use crate::revision::{strip_reserved_keys, Body};

/// A stored local document.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDocument {
    /// The document id.
    pub doc_id: String,
    /// The current `"<n>-local"` revision id.
    pub rev_id: RevId,
    /// The document body.
    pub body: Body,
}

impl RevisionStore {
    /// Reads a local document.
    pub fn get_local(&self, doc_id: &str) -> CoreResult<LocalDocument> {
        let inner = self.inner.lock();
        inner
            .tables
            .local_docs
            .get(doc_id)
            .map(|row| LocalDocument {
                doc_id: doc_id.to_string(),
                rev_id: row.rev_id.clone(),
                body: row.body.clone(),
            })
            .ok_or_else(|| CoreError::not_found(format!("no local document {doc_id}")))
    }

    /// Creates or updates a local document.
    ///
    /// `prev_rev_id` must name the stored revision (or be `None` for a
    /// fresh document); any mismatch is a conflict.
    pub fn put_local(
        &self,
        doc_id: &str,
        properties: &Body,
        prev_rev_id: Option<&RevId>,
    ) -> CoreResult<LocalDocument> {
        Self::check_doc_id(doc_id)?;
        let body = strip_reserved_keys(properties)?;

        let mut inner = self.inner.lock();
        let existing = inner.tables.local_docs.get(doc_id);

        let generation = match (existing, prev_rev_id) {
            (None, None) => 0,
            (None, Some(prev)) => {
                return Err(CoreError::conflict(format!(
                    "local document {doc_id} does not exist (given {prev})"
                )));
            }
            (Some(_), None) => {
                return Err(CoreError::conflict(format!(
                    "local document {doc_id} already exists"
                )));
            }
            (Some(row), Some(prev)) => {
                if row.rev_id != *prev {
                    return Err(CoreError::conflict(format!(
                        "local document {doc_id} is at {}, not {prev}",
                        row.rev_id
                    )));
                }
                row.rev_id.generation()
            }
        };

        let rev_id = RevId::local(generation + 1);
        inner.tables.local_docs.insert(
            doc_id.to_string(),
            LocalRow {
                rev_id: rev_id.clone(),
                body: body.clone(),
            },
        );

        Ok(LocalDocument {
            doc_id: doc_id.to_string(),
            rev_id,
            body,
        })
    }

    /// Deletes a local document.
    ///
    /// Requires the current revision id; a missing or wrong id is a
    /// conflict (not-found when the document does not exist at all).
    pub fn delete_local(&self, doc_id: &str, prev_rev_id: Option<&RevId>) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        let Some(row) = inner.tables.local_docs.get(doc_id) else {
            return Err(CoreError::not_found(format!("no local document {doc_id}")));
        };

        match prev_rev_id {
            Some(prev) if row.rev_id == *prev => {
                inner.tables.local_docs.remove(doc_id);
                Ok(())
            }
            _ => Err(CoreError::conflict(format!(
                "deleting local document {doc_id} requires its current revision id"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::test_store;
    use super::*;
    use crate::error::Status;
    use serde_json::json;

    fn body(n: i64) -> Body {
        let mut b = Body::new();
        b.insert("n".to_string(), json!(n));
        b
    }

    #[test]
    fn local_crud_round_trip() {
        let (store, _dir) = test_store();

        assert!(store.put_local("_bad/id", &body(1), None).is_err());

        let doc = store.put_local("checkpoint", &body(1), None).unwrap();
        assert_eq!(doc.rev_id.as_str(), "1-local");

        let fetched = store.get_local("checkpoint").unwrap();
        assert_eq!(fetched.body["n"], json!(1));

        let updated = store
            .put_local("checkpoint", &body(2), Some(&doc.rev_id))
            .unwrap();
        assert_eq!(updated.rev_id.as_str(), "2-local");

        store
            .delete_local("checkpoint", Some(&updated.rev_id))
            .unwrap();
        assert!(store.get_local("checkpoint").is_err());
    }

    #[test]
    fn stale_update_is_a_conflict() {
        let (store, _dir) = test_store();
        let doc = store.put_local("cp", &body(1), None).unwrap();
        store.put_local("cp", &body(2), Some(&doc.rev_id)).unwrap();

        let err = store
            .put_local("cp", &body(3), Some(&doc.rev_id))
            .unwrap_err();
        assert_eq!(err.status(), Status::Conflict);
    }

    #[test]
    fn create_over_existing_is_a_conflict() {
        let (store, _dir) = test_store();
        store.put_local("cp", &body(1), None).unwrap();
        let err = store.put_local("cp", &body(2), None).unwrap_err();
        assert_eq!(err.status(), Status::Conflict);
    }

    #[test]
    fn update_of_missing_document_is_a_conflict() {
        let (store, _dir) = test_store();
        let err = store
            .put_local("cp", &body(1), Some(&RevId::local(1)))
            .unwrap_err();
        assert_eq!(err.status(), Status::Conflict);
    }

    #[test]
    fn delete_requires_correct_revision() {
        let (store, _dir) = test_store();

        // Missing entirely: not found.
        let err = store.delete_local("cp", Some(&RevId::local(1))).unwrap_err();
        assert_eq!(err.status(), Status::NotFound);

        let doc = store.put_local("cp", &body(1), None).unwrap();

        // Wrong or absent revision id: conflict.
        let err = store.delete_local("cp", Some(&RevId::local(9))).unwrap_err();
        assert_eq!(err.status(), Status::Conflict);
        let err = store.delete_local("cp", None).unwrap_err();
        assert_eq!(err.status(), Status::Conflict);

        store.delete_local("cp", Some(&doc.rev_id)).unwrap();
    }

    #[test]
    fn local_documents_do_not_touch_revision_tables() {
        let (store, _dir) = test_store();
        let rx = store.changes().subscribe();

        store.put_local("cp", &body(1), None).unwrap();
        assert_eq!(store.revision_count(), 0);
        assert_eq!(store.last_sequence().as_u64(), 0);
        assert!(rx.try_recv().is_err());
    }
}
