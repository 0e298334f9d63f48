//! # LoreDB Blob Store
//!
//! Content-addressed binary storage for document attachments.
//!
//! Blobs are keyed by the SHA-1 digest of their bytes, so identical content
//! stored from any number of documents occupies a single file. Writes are
//! accumulated through [`BlobWriter`], digested, and atomically installed at
//! their content-addressed path; readers never observe partial content.
//!
//! ## Example
//!
//! ```no_run
//! use loredb_blob::BlobStore;
//! use std::path::Path;
//!
//! let store = BlobStore::open(Path::new("attachments")).unwrap();
//! let key = store.store(b"hello world").unwrap();
//! assert_eq!(store.read(&key).unwrap(), b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod key;
mod store;
mod writer;

pub use error::{BlobError, BlobResult};
pub use key::BlobKey;
pub use store::BlobStore;
pub use writer::BlobWriter;
