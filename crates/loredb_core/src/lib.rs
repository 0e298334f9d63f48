//! # LoreDB Core
//!
//! The document/revision storage engine and view index engine of LoreDB,
//! an embedded multi-version document database.
//!
//! This crate provides:
//! - Branching revision history per document with deterministic
//!   conflict-winner selection
//! - Forced history insertion for merging externally replicated edits
//! - Incremental, versioned map/reduce view indexes with collated queries
//! - Content-addressed attachments (via `loredb_blob`) with dedup and
//!   garbage collection
//! - Local (non-replicated) documents, change notifications, live queries,
//!   and a per-database background executor
//!
//! ## Example
//!
//! ```rust,ignore
//! use loredb_core::{Database, Body};
//! use serde_json::json;
//!
//! let db = Database::open(std::path::Path::new("my_db"))?;
//! let mut body = Body::new();
//! body.insert("title".to_string(), json!("groceries"));
//! let (rev, _status) = db.put_document("list1", body, None)?;
//! println!("stored {} at {}", rev.doc_id(), rev.rev_id());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod changes;
mod database;
mod error;
mod executor;
mod live_query;
mod registry;
mod revid;
mod revision;
mod store;
mod types;
mod view;

pub use cache::LruCache;
pub use changes::{ChangeFeed, ChangeObserver, DocumentChange, ObserverToken};
pub use database::{Database, Document};
pub use error::{CoreError, CoreResult, Status};
pub use executor::{TaskExecutor, TaskHandle};
pub use live_query::{LiveQuery, LiveQueryState};
pub use registry::{
    builtin_count, builtin_sum, ChangesFilter, Emitter, FunctionRegistry,
    MapFunction, ReduceFunction, ValidateFunction,
};
pub use revid::RevId;
pub use revision::{strip_reserved_keys, Body, BodyState, Revision};
pub use store::{
    inline_attachment, Attachment, ChangesOptions, LocalDocument, NewRevision,
    PurgeResult, RevisionStore,
};
pub use types::{DocKey, SequenceNumber};
pub use view::{
    AllDocsMode, IndexUpdateMode, QueryOptions, QueryResult, QueryRow, View,
    ViewLifecycle,
};
