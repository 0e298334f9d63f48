//! # LoreDB Codec
//!
//! Canonical JSON encoding and key collation for LoreDB.
//!
//! This crate provides the value-level plumbing shared by the revision
//! store and the view index engine:
//! - Canonical JSON serialization (sorted object keys, no whitespace),
//!   used for persisted index keys and document bodies
//! - The collation comparator that defines the total order of view keys
//!   in its three modes (Unicode, ASCII, Raw)
//!
//! Values are plain [`serde_json::Value`]s; this crate does not define its
//! own value tree.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod canonical;
mod collation;
mod error;

pub use canonical::canonical_json;
pub use collation::Collation;
pub use error::{CodecError, CodecResult};

pub use serde_json::{json, Map, Number, Value};
