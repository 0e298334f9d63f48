//! Database facade.

use crate::cache::LruCache;
use crate::changes::{ChangeFeed, DocumentChange};
use crate::error::{CoreError, CoreResult, Status};
use crate::executor::{TaskExecutor, TaskHandle};
use crate::live_query::LiveQuery;
use crate::registry::FunctionRegistry;
use crate::revid::RevId;
use crate::revision::{Body, Revision};
use crate::store::{ChangesOptions, NewRevision, PurgeResult, RevisionStore};
use crate::types::SequenceNumber;
use crate::view::{
    AllDocsMode, IndexUpdateMode, QueryOptions, QueryResult, QueryRow, View,
};
use loredb_blob::BlobStore;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Capacity of the document-handle cache.
const DOC_CACHE_CAPACITY: usize = 100;

/// A cached handle onto a document: its id plus the current winning
/// revision at the time it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// The document id.
    pub id: String,
    /// The winning revision when the handle was created.
    pub current_revision: Revision,
    /// Whether the document was in conflict at that time.
    pub in_conflict: bool,
}

/// An embedded multi-version document database.
///
/// Owns the revision store, the attachment blob store, the named views,
/// the function registry, a bounded document-handle cache, and one
/// background worker for asynchronous tasks.
pub struct Database {
    name: String,
    dir: Option<PathBuf>,
    /// Set when the database owns a scratch directory to delete on close.
    scratch_dir: Option<PathBuf>,
    store: Arc<RevisionStore>,
    registry: Arc<FunctionRegistry>,
    views: RwLock<HashMap<String, Arc<View>>>,
    doc_cache: Arc<LruCache<String, Document>>,
    executor: Mutex<TaskExecutor>,
    is_open: RwLock<bool>,
}

impl Database {
    /// Opens (creating if necessary) a database rooted at `path`.
    ///
    /// Attachment blobs live under `<path>/attachments/`.
    pub fn open(path: &Path) -> CoreResult<Self> {
        std::fs::create_dir_all(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("db")
            .to_string();
        let blobs = Arc::new(BlobStore::open(&path.join("attachments"))?);
        Ok(Self::with_parts(name, Some(path.to_path_buf()), None, blobs))
    }

    /// Opens an ephemeral database for testing.
    ///
    /// The revision relations are in memory; attachment blobs use a scratch
    /// directory that is deleted on close.
    pub fn open_ephemeral() -> CoreResult<Self> {
        let scratch = std::env::temp_dir().join(format!(
            "loredb-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let blobs = Arc::new(BlobStore::open(&scratch)?);
        Ok(Self::with_parts(
            "ephemeral".to_string(),
            None,
            Some(scratch),
            blobs,
        ))
    }

    fn with_parts(
        name: String,
        dir: Option<PathBuf>,
        scratch_dir: Option<PathBuf>,
        blobs: Arc<BlobStore>,
    ) -> Self {
        let registry = Arc::new(FunctionRegistry::new());
        let store = Arc::new(RevisionStore::new(blobs, Arc::clone(&registry)));
        let doc_cache = Arc::new(LruCache::new(DOC_CACHE_CAPACITY));

        // Every committed change drops the affected handle so cached reads
        // never go stale through the public API.
        let cache_for_observer = Arc::clone(&doc_cache);
        store.changes().observe(Arc::new(move |change: &DocumentChange| {
            cache_for_observer.remove(&change.doc_id);
        }));

        let executor = Mutex::new(TaskExecutor::new(&name));
        info!(db = %name, "opened database");
        Self {
            name,
            dir,
            scratch_dir,
            store,
            registry,
            views: RwLock::new(HashMap::new()),
            doc_cache,
            executor,
            is_open: RwLock::new(true),
        }
    }

    /// The database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The database directory, if persistent.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// The underlying revision store.
    #[must_use]
    pub fn store(&self) -> &Arc<RevisionStore> {
        &self.store
    }

    /// The function registry (validations, filters, named reduces).
    #[must_use]
    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// The change feed.
    #[must_use]
    pub fn changes(&self) -> &ChangeFeed {
        self.store.changes()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::bad_request(format!(
                "database {} is closed",
                self.name
            )))
        }
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Fetches a document handle (winning revision), using the LRU cache.
    ///
    /// A document whose winner is a tombstone reports not-found.
    pub fn get_document(&self, doc_id: &str) -> CoreResult<Document> {
        self.ensure_open()?;
        if let Some(doc) = self.doc_cache.get(&doc_id.to_string()) {
            return Ok(doc);
        }

        let revision = self.store.get_document(doc_id, None)?;
        if revision.is_deleted() {
            return Err(CoreError::not_found(format!(
                "document {doc_id} is deleted"
            )));
        }
        let doc = Document {
            id: doc_id.to_string(),
            in_conflict: !self.store.conflicting_rev_ids(doc_id).is_empty(),
            current_revision: revision,
        };
        self.doc_cache.insert(doc_id.to_string(), doc.clone());
        Ok(doc)
    }

    /// Creates a document with a generated id.
    pub fn create_document(&self, properties: Body) -> CoreResult<Revision> {
        self.ensure_open()?;
        let (rev, _) = self
            .store
            .put_revision(None, None, Some(properties), false, false)?;
        Ok(rev)
    }

    /// Creates or updates a document.
    ///
    /// A `"_deleted": true` property makes this a deletion. `prev_rev_id`
    /// follows the optimistic-concurrency rules of the revision store.
    pub fn put_document(
        &self,
        doc_id: &str,
        properties: Body,
        prev_rev_id: Option<&RevId>,
    ) -> CoreResult<(Revision, Status)> {
        self.ensure_open()?;
        let deleting = properties
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.store
            .put_revision(Some(doc_id), prev_rev_id, Some(properties), deleting, false)
    }

    /// Deletes a document by tombstoning its current revision.
    pub fn delete_document(&self, doc_id: &str, prev_rev_id: &RevId) -> CoreResult<Revision> {
        self.ensure_open()?;
        let (rev, _) = self
            .store
            .put_revision(Some(doc_id), Some(prev_rev_id), None, true, false)?;
        Ok(rev)
    }

    /// Merges an externally produced revision with known ancestry.
    pub fn force_insert(
        &self,
        rev: NewRevision,
        history: &[RevId],
        source: Option<&str>,
    ) -> CoreResult<(Revision, Status)> {
        self.ensure_open()?;
        self.store.force_insert(rev, history, source)
    }

    /// Revisions changed since a sequence number.
    pub fn changes_since(
        &self,
        since: SequenceNumber,
        options: &ChangesOptions,
        filter_name: Option<&str>,
    ) -> CoreResult<Vec<Revision>> {
        self.ensure_open()?;
        let filter = match filter_name {
            Some(name) => Some(self.registry.filter(name).ok_or_else(|| {
                CoreError::not_found(format!("no changes filter named {name}"))
            })?),
            None => None,
        };
        self.store.changes_since(since, options, filter.as_ref())
    }

    /// Physically removes revisions; see `RevisionStore::purge`.
    pub fn purge(
        &self,
        docs_to_revs: &HashMap<String, Vec<String>>,
    ) -> CoreResult<PurgeResult> {
        self.ensure_open()?;
        let result = self.store.purge(docs_to_revs)?;
        for doc_id in result.keys() {
            self.doc_cache.remove(doc_id);
        }
        Ok(result)
    }

    /// Compacts the store and evicts every cached document handle.
    pub fn compact(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.store.compact()?;
        self.doc_cache.clear();
        Ok(())
    }

    /// Evicts one cached document handle.
    pub fn evict_document(&self, doc_id: &str) {
        self.doc_cache.remove(&doc_id.to_string());
    }

    /// Evicts every cached document handle.
    pub fn evict_all_documents(&self) {
        self.doc_cache.clear();
    }

    // ------------------------------------------------------------------
    // Local documents
    // ------------------------------------------------------------------

    /// Reads a local (non-replicated) document.
    pub fn get_local(&self, doc_id: &str) -> CoreResult<crate::store::LocalDocument> {
        self.ensure_open()?;
        self.store.get_local(doc_id)
    }

    /// Creates or updates a local document.
    pub fn put_local(
        &self,
        doc_id: &str,
        properties: &Body,
        prev_rev_id: Option<&RevId>,
    ) -> CoreResult<crate::store::LocalDocument> {
        self.ensure_open()?;
        self.store.put_local(doc_id, properties, prev_rev_id)
    }

    /// Deletes a local document.
    pub fn delete_local(&self, doc_id: &str, prev_rev_id: Option<&RevId>) -> CoreResult<()> {
        self.ensure_open()?;
        self.store.delete_local(doc_id, prev_rev_id)
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Gets or creates a named view.
    pub fn view(&self, name: &str) -> Arc<View> {
        if let Some(view) = self.views.read().get(name) {
            return Arc::clone(view);
        }
        let mut views = self.views.write();
        Arc::clone(
            views
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(View::new(name, Arc::clone(&self.store)))),
        )
    }

    /// Looks up an existing view.
    #[must_use]
    pub fn get_view(&self, name: &str) -> Option<Arc<View>> {
        self.views.read().get(name).map(Arc::clone)
    }

    /// Names of all registered views.
    #[must_use]
    pub fn view_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.views.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Deletes a view and its index.
    pub fn delete_view(&self, name: &str) -> bool {
        match self.views.write().remove(name) {
            Some(view) => {
                view.mark_deleted();
                true
            }
            None => false,
        }
    }

    /// Queries a named view, honoring the staleness policy.
    ///
    /// `Before` updates synchronously (inside `View::query`); `After`
    /// returns current rows and schedules a background reindex; `Never`
    /// leaves the index alone.
    pub fn query_view(&self, name: &str, options: &QueryOptions) -> CoreResult<QueryResult> {
        self.ensure_open()?;
        let view = self
            .get_view(name)
            .ok_or_else(|| CoreError::not_found(format!("no view named {name}")))?;
        let result = view.query(options)?;

        if options.index_update_mode == IndexUpdateMode::After {
            let view_for_update = Arc::clone(&view);
            let _ = self.executor.lock().submit(move || {
                let _ = view_for_update.update_index();
            });
        }
        Ok(result)
    }

    /// Starts a live query over a named view.
    pub fn live_query(&self, name: &str, options: QueryOptions) -> CoreResult<LiveQuery> {
        self.ensure_open()?;
        let view = self
            .get_view(name)
            .ok_or_else(|| CoreError::not_found(format!("no view named {name}")))?;
        Ok(LiveQuery::start(view, options))
    }

    /// Submits work to the database's background worker.
    pub fn run_async<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.executor.lock().submit(f)
    }

    // ------------------------------------------------------------------
    // All-documents query
    // ------------------------------------------------------------------

    /// The degenerate built-in view over every document id.
    ///
    /// Keys are document ids; values carry the winning revision id, a
    /// `deleted` marker for tombstones (`IncludeDeleted` mode), and the
    /// conflict list in `ShowConflicts`/`OnlyConflicts` modes.
    pub fn all_docs(&self, options: &QueryOptions) -> CoreResult<QueryResult> {
        self.ensure_open()?;
        let mode = options.all_docs_mode;
        let include_deleted = mode == AllDocsMode::IncludeDeleted;

        let mut doc_ids: Vec<String> = {
            let inner = self.store.inner.lock();
            inner.tables.all_doc_ids()
        };

        if let Some(keys) = &options.keys {
            let wanted: Vec<&str> = keys.iter().filter_map(Value::as_str).collect();
            doc_ids.retain(|id| wanted.contains(&id.as_str()));
        } else {
            let (min, max, inclusive_min, inclusive_max) = if options.descending {
                (
                    options.end_key.as_ref(),
                    options.start_key.as_ref(),
                    options.inclusive_end,
                    options.inclusive_start,
                )
            } else {
                (
                    options.start_key.as_ref(),
                    options.end_key.as_ref(),
                    options.inclusive_start,
                    options.inclusive_end,
                )
            };
            let min = min.and_then(Value::as_str);
            let max = max.and_then(Value::as_str);
            doc_ids.retain(|id| {
                if let Some(min) = min {
                    if id.as_str() < min || (!inclusive_min && id.as_str() == min) {
                        return false;
                    }
                }
                if let Some(max) = max {
                    if id.as_str() > max || (!inclusive_max && id.as_str() == max) {
                        return false;
                    }
                }
                true
            });
        }
        if options.descending {
            doc_ids.reverse();
        }

        let mut rows = Vec::new();
        for doc_id in doc_ids {
            let Ok(winner) = self.store.get_document(&doc_id, None) else {
                continue;
            };
            if winner.is_deleted() && !include_deleted {
                continue;
            }

            let conflicts: Vec<String> = self
                .store
                .conflicting_rev_ids(&doc_id)
                .into_iter()
                .map(|r| r.as_str().to_string())
                .collect();
            if mode == AllDocsMode::OnlyConflicts && conflicts.is_empty() {
                continue;
            }

            let mut value = Map::new();
            value.insert(
                "rev".to_string(),
                Value::String(winner.rev_id().as_str().to_string()),
            );
            if winner.is_deleted() {
                value.insert("deleted".to_string(), Value::Bool(true));
            }
            if mode == AllDocsMode::ShowConflicts && !conflicts.is_empty() {
                value.insert(
                    "_conflicts".to_string(),
                    Value::Array(
                        conflicts.iter().cloned().map(Value::String).collect(),
                    ),
                );
            }

            let doc = if options.include_docs {
                self.store.revision_properties(&winner)
            } else {
                None
            };

            rows.push(QueryRow {
                key: Value::String(doc_id.clone()),
                value: Value::Object(value),
                doc_id: Some(doc_id),
                sequence: Some(winner.sequence()),
                doc,
                conflicts: if mode == AllDocsMode::ShowConflicts
                    || mode == AllDocsMode::OnlyConflicts
                {
                    conflicts
                } else {
                    Vec::new()
                },
            });
        }

        if options.skip > 0 {
            rows.drain(..options.skip.min(rows.len()));
        }
        if let Some(limit) = options.limit {
            rows.truncate(limit);
        }

        let update_seq = options.update_seq.then(|| self.store.last_sequence());
        Ok(QueryResult { rows, update_seq })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Closes the database: stops the background worker, drops views and
    /// cached handles, and removes the scratch directory of an ephemeral
    /// database. Idempotent.
    pub fn close(&self) -> CoreResult<()> {
        {
            let mut is_open = self.is_open.write();
            if !*is_open {
                return Ok(());
            }
            *is_open = false;
        }

        self.executor.lock().shutdown();
        self.views.write().clear();
        self.doc_cache.clear();

        if let Some(scratch) = &self.scratch_dir {
            let _ = std::fs::remove_dir_all(scratch);
        }
        info!(db = %self.name, "closed database");
        Ok(())
    }

    /// True until `close()` is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("is_open", &self.is_open())
            .field("last_sequence", &self.store.last_sequence())
            .finish_non_exhaustive()
    }
}
