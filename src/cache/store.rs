//! Persistent tier interface and in-process implementations.
//!
//! The source tier and the artifact tier are both a [`PersistentStore`]; they
//! are distinguished only by the [`PersistentKey`] variant they are asked for.
//! Stores never see the structured keys directly, only the hex names handed
//! out by a shared [`SafeKeyGenerator`].

use std::collections::HashMap;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use lru::LruCache;
use tracing::warn;

use super::artifact::Model;
use super::keys::{DigestKey, PersistentKey};
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::store";

// ============================================================================
// Store interface
// ============================================================================

/// A cached entry as handed back by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedFile {
    /// A file on disk owned by the store.
    Path(PathBuf),
    /// Entry contents held in memory.
    Memory(Bytes),
}

impl CachedFile {
    /// Model under which the entry is fed back to source resolvers.
    pub fn to_model(&self) -> Model {
        match self {
            CachedFile::Path(path) => Model::Path(path.clone()),
            CachedFile::Memory(bytes) => Model::Bytes(bytes.clone()),
        }
    }
}

/// Callback that streams an entry's contents into the store.
pub type EntryWriter<'a> = &'a mut dyn FnMut(&mut dyn Write) -> io::Result<()>;

/// Key/value store backing a persistent tier.
pub trait PersistentStore: Send + Sync {
    fn get(&self, key: &PersistentKey) -> Option<CachedFile>;

    /// Store the bytes produced by `writer` under `key`. Returns `false` when
    /// the writer or the store failed; nothing partial is ever visible.
    fn put(&self, key: &PersistentKey, writer: EntryWriter<'_>) -> bool;

    fn delete(&self, key: &PersistentKey);

    /// Drop every entry.
    fn clear(&self);
}

// ============================================================================
// Key encoding
// ============================================================================

/// Bounded cache of persistent key digests.
///
/// Digesting a key is cheap but not free, and the same keys are looked up on
/// every load. The cache holds at most `capacity` names and evicts the least
/// recently used one when full.
pub struct SafeKeyGenerator {
    names: Mutex<LruCache<PersistentKey, String>>,
}

impl SafeKeyGenerator {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            names: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Hex digest of `key`, suitable as a file name.
    pub fn safe_key(&self, key: &PersistentKey) -> String {
        if let Some(name) = mutex_lock(&self.names, SOURCE, "safe_key.get").get(key) {
            return name.clone();
        }

        let name = key.digest_hex();
        mutex_lock(&self.names, SOURCE, "safe_key.put").put(key.clone(), name.clone());
        name
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.names, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        mutex_lock(&self.names, SOURCE, "capacity").cap().get()
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local persistent store. Used for tests and ephemeral engines.
pub struct MemoryStore {
    names: Arc<SafeKeyGenerator>,
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new(names: Arc<SafeKeyGenerator>) -> Self {
        Self {
            names,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "memory.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &PersistentKey) -> Option<CachedFile> {
        let name = self.names.safe_key(key);
        rw_read(&self.entries, SOURCE, "memory.get")
            .get(&name)
            .cloned()
            .map(CachedFile::Memory)
    }

    fn put(&self, key: &PersistentKey, writer: EntryWriter<'_>) -> bool {
        let mut buffer = Vec::new();
        if let Err(err) = writer(&mut buffer) {
            warn!(
                target_module = SOURCE,
                error = %err,
                "Failed to write memory store entry"
            );
            return false;
        }

        let name = self.names.safe_key(key);
        rw_write(&self.entries, SOURCE, "memory.put").insert(name, Bytes::from(buffer));
        true
    }

    fn delete(&self, key: &PersistentKey) {
        let name = self.names.safe_key(key);
        rw_write(&self.entries, SOURCE, "memory.delete").remove(&name);
    }

    fn clear(&self) {
        rw_write(&self.entries, SOURCE, "memory.clear").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::{CacheKey, SourceCacheKey};

    fn source_key(name: &str) -> PersistentKey {
        SourceCacheKey::new(CacheKey::Object(name.to_string()), CacheKey::Empty).into()
    }

    fn generator(capacity: usize) -> Arc<SafeKeyGenerator> {
        Arc::new(SafeKeyGenerator::new(
            NonZeroUsize::new(capacity).expect("non-zero capacity"),
        ))
    }

    #[test]
    fn safe_keys_are_stable_and_bounded() {
        let names = generator(2);
        let first = names.safe_key(&source_key("a"));
        assert_eq!(first, names.safe_key(&source_key("a")));
        assert_eq!(first.len(), 64);

        names.safe_key(&source_key("b"));
        names.safe_key(&source_key("c"));
        assert_eq!(names.len(), 2);
        assert_eq!(names.capacity(), 2);

        // Evicted names are recomputed identically.
        assert_eq!(first, names.safe_key(&source_key("a")));
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new(generator(8));
        let key = source_key("a");
        assert!(store.get(&key).is_none());

        assert!(store.put(&key, &mut |out: &mut dyn Write| out.write_all(b"data")));
        assert_eq!(
            store.get(&key),
            Some(CachedFile::Memory(Bytes::from_static(b"data")))
        );

        store.delete(&key);
        assert!(store.is_empty());
    }

    #[test]
    fn failed_writer_leaves_no_entry() {
        let store = MemoryStore::new(generator(8));
        let key = source_key("a");
        let stored = store.put(&key, &mut |out: &mut dyn Write| -> io::Result<()> {
            out.write_all(b"partial")?;
            Err(io::Error::other("encoder failed"))
        });
        assert!(!stored);
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn cached_file_maps_to_model() {
        let file = CachedFile::Path(PathBuf::from("/tmp/x"));
        assert_eq!(file.to_model(), Model::Path(PathBuf::from("/tmp/x")));
    }
}
