//! Filesystem-backed persistent tier.
//!
//! Entries are files named by the hex digest of their key, directly under the
//! store root. Writes go to a hidden temp file in the same directory and are
//! renamed into place, so a reader never sees a partial entry. The index of
//! entry sizes is an LRU rebuilt from the directory on open, oldest
//! modification first.
//!
//! File system work happens outside the index lock, so lookups never wait on
//! disk I/O. An entry whose file has vanished is dropped from the index on its
//! next lookup.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use lru::LruCache;
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::cache::{
    CachedFile, EntryWriter, PersistentKey, PersistentStore, SafeKeyGenerator, mutex_lock,
};

use super::error::InfraError;

const SOURCE: &str = "infra::disk_store";
const TEMP_PREFIX: &str = ".tmp-";

struct DiskIndex {
    entries: LruCache<String, u64>,
    used_bytes: u64,
}

/// Directory of digest-named files under a total byte budget.
pub struct DiskStore {
    root: PathBuf,
    names: Arc<SafeKeyGenerator>,
    max_bytes: u64,
    index: Mutex<DiskIndex>,
    /// Serializes renames and removals so an eviction never deletes a file a
    /// concurrent put has just moved into place. Lookups never take it.
    writes: Mutex<()>,
}

impl DiskStore {
    /// Open (or create) a store rooted at `root`, indexing the entries already there.
    pub fn open(
        root: impl Into<PathBuf>,
        names: Arc<SafeKeyGenerator>,
        max_bytes: u64,
    ) -> Result<Self, InfraError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| {
            InfraError::store(&root, format!("failed to create directory: {err}"))
        })?;

        let mut found = scan(&root)?;
        found.sort_by_key(|entry| entry.modified);

        let mut index = DiskIndex {
            entries: LruCache::unbounded(),
            used_bytes: 0,
        };
        for entry in found {
            index.used_bytes += entry.len;
            index.entries.put(entry.name, entry.len);
        }

        let store = Self {
            root,
            names,
            max_bytes,
            index: Mutex::new(index),
            writes: Mutex::new(()),
        };

        let evicted = {
            let mut index = store.lock_index("open");
            let evicted = store.evict_over_budget(&mut index);
            info!(
                target_module = SOURCE,
                root = %store.root.display(),
                entries = index.entries.len(),
                used_bytes = index.used_bytes,
                max_bytes = store.max_bytes,
                "Disk store opened"
            );
            evicted
        };
        remove_entries(&evicted);

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock_index("used_bytes").used_bytes
    }

    pub fn len(&self) -> usize {
        self.lock_index("len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_index(&self, op: &'static str) -> MutexGuard<'_, DiskIndex> {
        mutex_lock(&self.index, SOURCE, op)
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Drop least-recently-used entries from the index until it fits the
    /// budget. The caller removes the returned files once the lock is released.
    fn evict_over_budget(&self, index: &mut DiskIndex) -> Vec<PathBuf> {
        let mut evicted = Vec::new();
        while index.used_bytes > self.max_bytes {
            let Some((name, len)) = index.entries.pop_lru() else {
                break;
            };
            index.used_bytes -= len;
            evicted.push(self.entry_path(&name));
        }
        if !evicted.is_empty() {
            counter!("stratacache_disk_evict_total").increment(evicted.len() as u64);
            debug!(
                target_module = SOURCE,
                evicted = evicted.len(),
                used_bytes = index.used_bytes,
                "Evicted disk entries over budget"
            );
        }
        gauge!("stratacache_disk_bytes").set(index.used_bytes as f64);
        evicted
    }

    fn write_temp(&self, writer: EntryWriter<'_>) -> io::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.root)?;
        writer(&mut file)?;
        file.flush()?;
        file.as_file().sync_all()?;
        Ok(file)
    }
}

impl PersistentStore for DiskStore {
    fn get(&self, key: &PersistentKey) -> Option<CachedFile> {
        let name = self.names.safe_key(key);
        self.lock_index("get").entries.get(&name)?;

        let path = self.entry_path(&name);
        if path.is_file() {
            return Some(CachedFile::Path(path));
        }

        // Evicted meanwhile, or removed behind our back. With writes held the
        // file cannot reappear while its entry is dropped.
        let _writes = mutex_lock(&self.writes, SOURCE, "get");
        if path.is_file() {
            return Some(CachedFile::Path(path));
        }
        let mut index = self.lock_index("get");
        if let Some(len) = index.entries.pop(&name) {
            index.used_bytes -= len;
        }
        None
    }

    fn put(&self, key: &PersistentKey, writer: EntryWriter<'_>) -> bool {
        let name = self.names.safe_key(key);
        let file = match self.write_temp(writer) {
            Ok(file) => file,
            Err(err) => {
                warn!(
                    target_module = SOURCE,
                    error = %err,
                    "Failed to write disk store entry"
                );
                return false;
            }
        };

        let len = match file.as_file().metadata() {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                warn!(target_module = SOURCE, error = %err, "Failed to stat disk store entry");
                return false;
            }
        };
        if len > self.max_bytes {
            debug!(
                target_module = SOURCE,
                len,
                max_bytes = self.max_bytes,
                "Entry larger than the disk budget was not stored"
            );
            return false;
        }

        let _writes = mutex_lock(&self.writes, SOURCE, "put");
        if let Err(err) = file.persist(self.entry_path(&name)) {
            warn!(
                target_module = SOURCE,
                error = %err.error,
                "Failed to move disk store entry into place"
            );
            return false;
        }

        let evicted = {
            let mut index = self.lock_index("put");
            if let Some(previous) = index.entries.put(name, len) {
                index.used_bytes -= previous;
            }
            index.used_bytes += len;
            self.evict_over_budget(&mut index)
        };
        remove_entries(&evicted);
        true
    }

    fn delete(&self, key: &PersistentKey) {
        let name = self.names.safe_key(key);
        let _writes = mutex_lock(&self.writes, SOURCE, "delete");
        {
            let mut index = self.lock_index("delete");
            if let Some(len) = index.entries.pop(&name) {
                index.used_bytes -= len;
            }
            gauge!("stratacache_disk_bytes").set(index.used_bytes as f64);
        }
        remove_entry(&self.entry_path(&name));
    }

    fn clear(&self) {
        let _writes = mutex_lock(&self.writes, SOURCE, "clear");
        let removed: Vec<PathBuf> = {
            let mut index = self.lock_index("clear");
            let mut removed = Vec::with_capacity(index.entries.len());
            while let Some((name, _)) = index.entries.pop_lru() {
                removed.push(self.entry_path(&name));
            }
            index.used_bytes = 0;
            gauge!("stratacache_disk_bytes").set(0.0);
            removed
        };
        remove_entries(&removed);
    }
}

struct FoundEntry {
    name: String,
    len: u64,
    modified: SystemTime,
}

fn scan(root: &Path) -> Result<Vec<FoundEntry>, InfraError> {
    let read_dir = fs::read_dir(root)
        .map_err(|err| InfraError::store(root, format!("failed to list directory: {err}")))?;

    let mut found = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }

        if name.starts_with(TEMP_PREFIX) {
            // Left behind by an interrupted write.
            remove_entry(&entry.path());
            continue;
        }
        if !is_entry_name(&name) {
            continue;
        }

        found.push(FoundEntry {
            name,
            len: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    Ok(found)
}

fn is_entry_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|byte| byte.is_ascii_hexdigit())
}

fn remove_entries(paths: &[PathBuf]) {
    for path in paths {
        remove_entry(path);
    }
}

fn remove_entry(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            target_module = SOURCE,
            path = %path.display(),
            error = %err,
            "Failed to remove disk store entry"
        ),
    }
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("root", &self.root)
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}
