//! Streaming blob writer.

use crate::error::{BlobError, BlobResult};
use crate::key::BlobKey;
use crate::store::BlobStore;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::Md5;
use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

/// An in-progress blob write.
///
/// The writer accumulates chunks into a staging file while digesting them
/// incrementally. `finish()` seals the content and computes both digests;
/// `install()` atomically renames the staging file to its content-addressed
/// location. Until install, the blob is invisible to readers, but its key is
/// registered as pending so garbage collection will not delete a concurrent
/// install of the same content.
///
/// Dropping an uninstalled writer removes the staging file.
pub struct BlobWriter<'a> {
    store: &'a BlobStore,
    tmp_path: PathBuf,
    file: Option<File>,
    sha1: Sha1,
    md5: Md5,
    length: u64,
    key: Option<BlobKey>,
    md5_digest: Option<[u8; 16]>,
    installed: bool,
}

impl<'a> BlobWriter<'a> {
    pub(crate) fn new(store: &'a BlobStore) -> BlobResult<Self> {
        let tmp_path = Self::unique_tmp_path(store)?;
        let file = File::create(&tmp_path)?;
        Ok(Self {
            store,
            tmp_path,
            file: Some(file),
            sha1: Sha1::new(),
            md5: Md5::new(),
            length: 0,
            key: None,
            md5_digest: None,
            installed: false,
        })
    }

    fn unique_tmp_path(store: &BlobStore) -> BlobResult<PathBuf> {
        let dir = store.tmp_dir();
        for n in 0u32.. {
            let candidate = dir.join(format!("tmp{:08x}.blobtmp", n));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        unreachable!("tmp namespace exhausted")
    }

    /// Appends a chunk of content.
    pub fn append(&mut self, data: &[u8]) -> BlobResult<()> {
        if self.key.is_some() {
            return Err(BlobError::writer_state("append after finish"));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| BlobError::writer_state("writer already closed"))?;
        file.write_all(data)?;
        self.sha1.update(data);
        self.md5.update(data);
        self.length += data.len() as u64;
        Ok(())
    }

    /// Seals the content: flushes the staging file and computes both
    /// digests. Returns the blob's key.
    ///
    /// The key is registered as pending in the store until the writer is
    /// installed, cancelled, or dropped.
    pub fn finish(&mut self) -> BlobResult<BlobKey> {
        if let Some(key) = self.key {
            return Ok(key);
        }
        let mut file = self
            .file
            .take()
            .ok_or_else(|| BlobError::writer_state("writer already closed"))?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        let key = BlobKey::from_bytes(self.sha1.clone().finalize().into());
        self.md5_digest = Some(self.md5.clone().finalize().into());
        self.key = Some(key);
        self.store.mark_pending(key);
        Ok(key)
    }

    /// Installs the finished blob at its content-addressed location.
    ///
    /// The rename is atomic: no reader can observe a truncated blob. If an
    /// identical blob is already installed the staging file is discarded.
    pub fn install(mut self) -> BlobResult<BlobKey> {
        let key = self
            .key
            .ok_or_else(|| BlobError::writer_state("install before finish"))?;

        let dest = self.store.path_for_key(&key);
        if dest.is_file() {
            // Dedup hit: same digest, same content.
            fs::remove_file(&self.tmp_path)?;
        } else {
            fs::rename(&self.tmp_path, &dest)?;
        }
        self.installed = true;
        self.store.clear_pending(&key);
        Ok(key)
    }

    /// Abandons the write, removing the staging file.
    pub fn cancel(mut self) -> BlobResult<()> {
        self.cleanup();
        self.installed = true; // suppress Drop cleanup
        Ok(())
    }

    /// Returns the number of bytes appended so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Returns true if no bytes have been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the blob key, available after `finish()`.
    #[must_use]
    pub fn blob_key(&self) -> Option<BlobKey> {
        self.key
    }

    /// Returns the `"sha1-<base64>"` digest string, available after
    /// `finish()`.
    #[must_use]
    pub fn sha1_digest_string(&self) -> Option<String> {
        self.key.map(|k| k.digest_string())
    }

    /// Returns the `"md5-<base64>"` digest string, available after
    /// `finish()`.
    #[must_use]
    pub fn md5_digest_string(&self) -> Option<String> {
        self.md5_digest
            .map(|d| format!("md5-{}", BASE64.encode(d)))
    }

    fn cleanup(&mut self) {
        if self.tmp_path.exists() {
            let _ = fs::remove_file(&self.tmp_path);
        }
        if let Some(key) = self.key {
            self.store.clear_pending(&key);
        }
    }
}

impl Drop for BlobWriter<'_> {
    fn drop(&mut self) {
        if !self.installed {
            self.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chunked_write_matches_one_shot() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let mut writer = store.writer().unwrap();
        writer.append(b"hello ").unwrap();
        writer.append(b"streaming ").unwrap();
        writer.append(b"world").unwrap();
        assert_eq!(writer.len(), 21);
        writer.finish().unwrap();
        let key = writer.install().unwrap();

        assert_eq!(key, BlobKey::for_content(b"hello streaming world"));
        assert_eq!(store.read(&key).unwrap(), b"hello streaming world");
    }

    #[test]
    fn digest_strings_exposed_after_finish() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let mut writer = store.writer().unwrap();
        writer.append(b"digest me").unwrap();
        assert!(writer.sha1_digest_string().is_none());
        assert!(writer.md5_digest_string().is_none());

        let key = writer.finish().unwrap();
        assert_eq!(
            writer.sha1_digest_string().unwrap(),
            key.digest_string()
        );
        assert!(writer.md5_digest_string().unwrap().starts_with("md5-"));
        writer.install().unwrap();
    }

    #[test]
    fn append_after_finish_rejected() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let mut writer = store.writer().unwrap();
        writer.append(b"data").unwrap();
        writer.finish().unwrap();
        assert!(matches!(
            writer.append(b"more"),
            Err(BlobError::WriterState { .. })
        ));
        writer.install().unwrap();
    }

    #[test]
    fn install_before_finish_rejected() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let writer = store.writer().unwrap();
        assert!(matches!(
            writer.install(),
            Err(BlobError::WriterState { .. })
        ));
    }

    #[test]
    fn cancel_removes_staging_file() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let mut writer = store.writer().unwrap();
        writer.append(b"abandoned").unwrap();
        writer.finish().unwrap();
        writer.cancel().unwrap();

        let key = BlobKey::for_content(b"abandoned");
        assert!(!store.contains(&key));
        // Pending registration is released, so GC sees nothing to spare.
        store
            .delete_all_except(&std::collections::HashSet::new())
            .unwrap();
    }

    #[test]
    fn dropped_writer_cleans_up() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        {
            let mut writer = store.writer().unwrap();
            writer.append(b"dropped").unwrap();
            writer.finish().unwrap();
        }

        let tmp_entries: Vec<_> = std::fs::read_dir(store.tmp_dir())
            .unwrap()
            .collect();
        assert!(tmp_entries.is_empty());
        assert!(!store.contains(&BlobKey::for_content(b"dropped")));
    }

    #[test]
    fn install_dedups_against_existing_blob() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let existing = store.store(b"duplicate").unwrap();

        let mut writer = store.writer().unwrap();
        writer.append(b"duplicate").unwrap();
        writer.finish().unwrap();
        let key = writer.install().unwrap();

        assert_eq!(key, existing);
        assert_eq!(store.count().unwrap(), 1);
    }
}
