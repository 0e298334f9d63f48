//! The content-addressed blob store.

use crate::error::{BlobError, BlobResult};
use crate::key::BlobKey;
use crate::writer::BlobWriter;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// File extension for installed blobs.
const BLOB_EXTENSION: &str = "blob";
/// Subdirectory for in-progress writer files.
const TMP_DIR: &str = "tmp";

/// A directory of content-addressed blobs.
///
/// Each blob lives at `<dir>/<HEX-SHA1>.blob`. Storing the same content
/// twice is a no-op for the second write. Writers stage their bytes in a
/// `tmp/` subdirectory and install with an atomic rename, so a reader can
/// never observe a partially written blob: a key either resolves to a
/// complete file or does not resolve at all.
///
/// The store additionally tracks keys of finished-but-not-yet-installed
/// writers so that garbage collection cannot race a write in flight.
pub struct BlobStore {
    dir: PathBuf,
    /// Keys finished by a writer but not yet installed (or abandoned).
    pending: Mutex<HashSet<BlobKey>>,
}

impl BlobStore {
    /// Opens (creating if necessary) a blob store rooted at `dir`.
    pub fn open(dir: &Path) -> BlobResult<Self> {
        fs::create_dir_all(dir)?;
        fs::create_dir_all(dir.join(TMP_DIR))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            pending: Mutex::new(HashSet::new()),
        })
    }

    /// Returns the store's root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stores a complete blob, returning its key.
    ///
    /// Idempotent: content that is already present is not rewritten.
    pub fn store(&self, data: &[u8]) -> BlobResult<BlobKey> {
        let mut writer = self.writer()?;
        writer.append(data)?;
        writer.finish()?;
        writer.install()
    }

    /// Begins a streaming write.
    pub fn writer(&self) -> BlobResult<BlobWriter<'_>> {
        BlobWriter::new(self)
    }

    /// Reads a blob, or `None` if no such key is installed.
    pub fn get(&self, key: &BlobKey) -> BlobResult<Option<Vec<u8>>> {
        match fs::read(self.path_for_key(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads a blob, erroring if it is absent.
    pub fn read(&self, key: &BlobKey) -> BlobResult<Vec<u8>> {
        self.get(key)?.ok_or_else(|| BlobError::not_found(*key))
    }

    /// Returns true if a blob is installed for `key`.
    #[must_use]
    pub fn contains(&self, key: &BlobKey) -> bool {
        self.path_for_key(key).is_file()
    }

    /// Returns the byte length of an installed blob.
    #[must_use]
    pub fn size_of(&self, key: &BlobKey) -> Option<u64> {
        fs::metadata(self.path_for_key(key)).ok().map(|m| m.len())
    }

    /// Lists the keys of all installed blobs.
    ///
    /// Files that do not look like blob files are ignored.
    pub fn all_keys(&self) -> BlobResult<Vec<BlobKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(key) = Self::key_for_file(&entry.path()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Returns the number of installed blobs.
    pub fn count(&self) -> BlobResult<usize> {
        Ok(self.all_keys()?.len())
    }

    /// Returns the total size in bytes of all installed blobs.
    pub fn total_size(&self) -> BlobResult<u64> {
        let mut total = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if Self::key_for_file(&entry.path()).is_some() {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }

    /// Deletes every blob whose key is in neither `keep` nor the pending
    /// set, returning the number of files removed.
    ///
    /// This is the garbage-collection primitive: the caller passes the set
    /// of keys still referenced by the database. A writer that has finished
    /// but not yet installed keeps its key alive even though no reference
    /// exists yet.
    pub fn delete_all_except(&self, keep: &HashSet<BlobKey>) -> BlobResult<usize> {
        let pending = self.pending.lock().clone();
        let mut deleted = 0;
        for key in self.all_keys()? {
            if keep.contains(&key) || pending.contains(&key) {
                continue;
            }
            fs::remove_file(self.path_for_key(&key))?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Absolute path of the installed file for `key`.
    pub(crate) fn path_for_key(&self, key: &BlobKey) -> PathBuf {
        self.dir.join(format!("{key}.{BLOB_EXTENSION}"))
    }

    /// Directory for writer staging files.
    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.dir.join(TMP_DIR)
    }

    pub(crate) fn mark_pending(&self, key: BlobKey) {
        self.pending.lock().insert(key);
    }

    pub(crate) fn clear_pending(&self, key: &BlobKey) {
        self.pending.lock().remove(key);
    }

    fn key_for_file(path: &Path) -> Option<BlobKey> {
        if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
            return None;
        }
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse().ok())
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}
