//! Attachment processing.
//!
//! Attachments arrive inline in a revision's `_attachments` dictionary:
//! either new content (`"data"`: base64) or a stub (`"stub": true`) meaning
//! "same bytes as the parent revision". New content goes to the blob store;
//! stubs copy the parent's attachment row forward without re-storing bytes.

use super::{AttachmentRow, RevisionStore, Tables};
use crate::error::{CoreError, CoreResult};
use crate::revision::{Body, Revision};
use crate::types::SequenceNumber;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use loredb_blob::BlobKey;
use serde_json::{Map, Value};

/// Metadata of one stored attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    /// Attachment name, unique within its revision.
    pub name: String,
    /// MIME content type.
    pub content_type: String,
    /// Content length in bytes.
    pub length: u64,
    /// Generation at which this attachment's content was introduced.
    pub revpos: u64,
    /// `"sha1-<base64>"` content digest.
    pub digest: String,
    pub(crate) key: BlobKey,
}

impl Attachment {
    fn from_row(name: &str, row: &AttachmentRow) -> Self {
        Self {
            name: name.to_string(),
            content_type: row.content_type.clone(),
            length: row.length,
            revpos: row.revpos,
            digest: row.key.digest_string(),
            key: row.key,
        }
    }

    /// The stub dictionary stored under `_attachments` on read.
    #[must_use]
    pub fn as_stub_dict(&self) -> Value {
        let mut dict = Map::new();
        dict.insert("stub".to_string(), Value::Bool(true));
        dict.insert(
            "content_type".to_string(),
            Value::String(self.content_type.clone()),
        );
        dict.insert("length".to_string(), Value::from(self.length));
        dict.insert("revpos".to_string(), Value::from(self.revpos));
        dict.insert("digest".to_string(), Value::String(self.digest.clone()));
        Value::Object(dict)
    }
}

/// Pulls the `_attachments` dictionary out of incoming properties.
pub(crate) fn attachments_from_properties(
    properties: &Body,
) -> CoreResult<Option<Map<String, Value>>> {
    match properties.get("_attachments") {
        None => Ok(None),
        Some(Value::Object(atts)) => Ok(Some(atts.clone())),
        Some(_) => Err(CoreError::bad_attachment(
            "_attachments must be a dictionary",
        )),
    }
}

impl RevisionStore {
    /// Stores the attachments of a freshly inserted revision.
    ///
    /// `generation` is the new revision's generation; `parent_sequence` is
    /// where stubs are copied from. Any failure aborts the enclosing
    /// mutation transactionally.
    pub(crate) fn process_attachments(
        &self,
        tables: &mut Tables,
        attachments: &Map<String, Value>,
        sequence: SequenceNumber,
        generation: u64,
        parent_sequence: Option<SequenceNumber>,
    ) -> CoreResult<()> {
        for (name, info) in attachments {
            let info = info.as_object().ok_or_else(|| {
                CoreError::bad_attachment(format!(
                    "attachment '{name}' metadata is not a dictionary"
                ))
            })?;

            if let Some(encoding) = info.get("encoding") {
                return Err(CoreError::bad_encoding(format!(
                    "unsupported attachment encoding {encoding} on '{name}'"
                )));
            }

            let row = if info.get("stub").and_then(Value::as_bool) == Some(true) {
                self.stub_row_from_parent(tables, name, info, parent_sequence)?
            } else if let Some(data) = info.get("data") {
                self.row_from_inline_data(name, info, data, generation)?
            } else if info.get("follows").and_then(Value::as_bool) == Some(true) {
                // Multipart bodies belong to the replication layer; inline
                // data is the only supported transport here.
                return Err(CoreError::bad_attachment(format!(
                    "attachment '{name}' uses 'follows' without inline data"
                )));
            } else {
                return Err(CoreError::bad_attachment(format!(
                    "attachment '{name}' has neither data nor stub"
                )));
            };

            if row.revpos > generation {
                return Err(CoreError::bad_attachment(format!(
                    "attachment '{name}' has revpos {} but document is at generation {generation}",
                    row.revpos
                )));
            }

            tables.attachments.insert((sequence, name.clone()), row);
        }
        Ok(())
    }

    fn stub_row_from_parent(
        &self,
        tables: &Tables,
        name: &str,
        info: &Map<String, Value>,
        parent_sequence: Option<SequenceNumber>,
    ) -> CoreResult<AttachmentRow> {
        if let Some(parent) = parent_sequence {
            if let Some(row) = tables.attachments.get(&(parent, name.to_string())) {
                return Ok(row.clone());
            }
        }

        // The parent's attachments aren't known locally (e.g. the ancestry
        // arrived as phantoms), but the blob itself may already be stored;
        // a digest is enough to rebuild the reference.
        if let Some(digest) = info.get("digest").and_then(Value::as_str) {
            if let Ok(key) = BlobKey::from_digest_string(digest) {
                if self.blob_store().contains(&key) {
                    return Ok(AttachmentRow {
                        content_type: info
                            .get("content_type")
                            .and_then(Value::as_str)
                            .unwrap_or("application/octet-stream")
                            .to_string(),
                        length: info
                            .get("length")
                            .and_then(Value::as_u64)
                            .or_else(|| self.blob_store().size_of(&key))
                            .unwrap_or(0),
                        revpos: info.get("revpos").and_then(Value::as_u64).unwrap_or(0),
                        key,
                    });
                }
            }
        }

        Err(CoreError::bad_attachment(format!(
            "unable to find stub attachment '{name}' in history"
        )))
    }

    fn row_from_inline_data(
        &self,
        name: &str,
        info: &Map<String, Value>,
        data: &Value,
        generation: u64,
    ) -> CoreResult<AttachmentRow> {
        let encoded = data.as_str().ok_or_else(|| {
            CoreError::bad_attachment(format!(
                "attachment '{name}' data must be a base64 string"
            ))
        })?;
        let bytes = BASE64.decode(encoded).map_err(|e| {
            CoreError::bad_encoding(format!("attachment '{name}': {e}"))
        })?;

        let key = self.blob_store().store(&bytes)?;
        let content_type = info
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_string();
        let revpos = info
            .get("revpos")
            .and_then(Value::as_u64)
            .unwrap_or(generation);

        Ok(AttachmentRow {
            content_type,
            length: bytes.len() as u64,
            revpos,
            key,
        })
    }

    /// Attachment metadata for a stored revision.
    #[must_use]
    pub fn attachments_for_revision(&self, revision: &Revision) -> Vec<Attachment> {
        let inner = self.inner.lock();
        attachments_at(&inner.tables, revision.sequence())
    }

    /// Reads one attachment's metadata and content.
    pub fn get_attachment(
        &self,
        revision: &Revision,
        name: &str,
    ) -> CoreResult<(Attachment, Vec<u8>)> {
        let attachment = {
            let inner = self.inner.lock();
            inner
                .tables
                .attachments
                .get(&(revision.sequence(), name.to_string()))
                .map(|row| Attachment::from_row(name, row))
        }
        .ok_or_else(|| {
            CoreError::not_found(format!(
                "no attachment '{name}' on {}#{}",
                revision.doc_id(),
                revision.rev_id()
            ))
        })?;

        let bytes = self.blob_store().read(&attachment.key)?;
        Ok((attachment, bytes))
    }

    /// A revision's properties with `_attachments` stubs synthesized.
    ///
    /// Returns `None` when the body is unavailable (phantom or compacted).
    #[must_use]
    pub fn revision_properties(&self, revision: &Revision) -> Option<Body> {
        let mut props = revision.properties()?;
        let attachments = self.attachments_for_revision(revision);
        if !attachments.is_empty() {
            let mut dict = Map::new();
            for att in attachments {
                dict.insert(att.name.clone(), att.as_stub_dict());
            }
            props.insert("_attachments".to_string(), Value::Object(dict));
        }
        Some(props)
    }
}

/// All attachment rows of a sequence, in name order.
pub(crate) fn attachments_at(tables: &Tables, sequence: SequenceNumber) -> Vec<Attachment> {
    tables
        .attachments
        .range((sequence, String::new())..(sequence.next(), String::new()))
        .map(|((_, name), row)| Attachment::from_row(name, row))
        .collect()
}

/// Builds the inline `_attachments` value for storing `bytes` under `name`.
///
/// Convenience for callers assembling a revision body by hand.
#[must_use]
pub fn inline_attachment(content_type: &str, bytes: &[u8]) -> Value {
    let mut dict = Map::new();
    dict.insert(
        "content_type".to_string(),
        Value::String(content_type.to_string()),
    );
    dict.insert("data".to_string(), Value::String(BASE64.encode(bytes)));
    Value::Object(dict)
}
