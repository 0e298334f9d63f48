//! Bounded LRU cache for document handles.

use parking_lot::Mutex;

/// A fixed-capacity least-recently-used cache.
///
/// Entries are kept most-recently-used first; inserting past capacity
/// evicts from the tail. The cache is explicitly invalidatable (one key or
/// everything) so callers can force re-reads after out-of-band writes such
/// as compaction.
pub struct LruCache<K, V> {
    capacity: usize,
    entries: Mutex<Vec<(K, V)>>,
}

impl<K: Eq + Clone, V: Clone> LruCache<K, V> {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Looks up a key, marking it most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|(k, _)| k == key)?;
        let entry = entries.remove(pos);
        let value = entry.1.clone();
        entries.insert(0, entry);
        Some(value)
    }

    /// Inserts or replaces a value, evicting the least recently used entry
    /// when full.
    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|(k, _)| *k == key) {
            entries.remove(pos);
        }
        entries.insert(0, (key, value));
        while entries.len() > self.capacity {
            entries.pop();
        }
    }

    /// Removes one entry.
    pub fn remove(&self, key: &K) {
        self.entries.lock().retain(|(k, _)| k != key);
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
