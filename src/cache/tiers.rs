//! In-process tiers.
//!
//! Live: artifacts some caller currently holds, tracked weakly.
//! Memory: released artifacts kept around under a byte budget.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use lru::LruCache;
use metrics::counter;
use tracing::debug;

use super::error::LifetimeError;
use super::keys::RequestKey;
use super::lock::{mutex_lock, rw_read, rw_write};
use super::refcount::{ArtifactHandle, RefCountedArtifact};
use super::strategy::Provenance;

const SOURCE: &str = "cache::tiers";

// ============================================================================
// Live tier
// ============================================================================

/// Artifacts with at least one outstanding [`ArtifactHandle`].
///
/// Acquiring through the tier and retiring an idle entry share one lock, so an
/// entry is never handed out after it was moved to the memory tier.
#[derive(Default)]
pub struct LiveResources {
    entries: RwLock<HashMap<RequestKey, Weak<RefCountedArtifact>>>,
}

impl LiveResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the live artifact for `key`, pruning the entry if it is gone.
    pub fn acquire(&self, key: &RequestKey) -> Option<ArtifactHandle> {
        let mut entries = rw_write(&self.entries, SOURCE, "live.acquire");
        let artifact = match entries.get(key).map(Weak::upgrade) {
            Some(Some(artifact)) => artifact,
            Some(None) => {
                entries.remove(key);
                return None;
            }
            None => return None,
        };

        match ArtifactHandle::acquire(artifact, Provenance::MemoryCache) {
            Ok(handle) => {
                counter!("stratacache_live_hit_total").increment(1);
                Some(handle)
            }
            Err(err) => {
                debug!(
                    target_module = SOURCE,
                    error = %err,
                    "Dropping unusable live entry"
                );
                entries.remove(key);
                None
            }
        }
    }

    pub fn insert(&self, key: RequestKey, artifact: &Arc<RefCountedArtifact>) {
        rw_write(&self.entries, SOURCE, "live.insert").insert(key, Arc::downgrade(artifact));
    }

    /// Retire a released artifact. Returns `false` when it was acquired
    /// again in the meantime; otherwise drops its live entry, if it still is
    /// the current one for `key`.
    pub fn retire(&self, key: &RequestKey, artifact: &Arc<RefCountedArtifact>) -> bool {
        let mut entries = rw_write(&self.entries, SOURCE, "live.retire");
        if artifact.acquired() > 0 {
            return false;
        }
        let current = entries
            .get(key)
            .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), Arc::as_ptr(artifact)));
        if current {
            entries.remove(key);
        }
        true
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "live.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for LiveResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveResources")
            .field("entries", &self.len())
            .finish()
    }
}

// ============================================================================
// Memory tier
// ============================================================================

struct MemoryState {
    entries: LruCache<RequestKey, Arc<RefCountedArtifact>>,
    used_bytes: usize,
}

/// Cost-bounded LRU of released artifacts.
///
/// Eviction never recycles inline: evicted artifacts are returned to the
/// caller, which hands them to the recycle scheduler outside the lock.
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    max_bytes: usize,
}

impl MemoryCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: LruCache::unbounded(),
                used_bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Insert a released artifact. Returns everything that no longer fits,
    /// possibly including `artifact` itself.
    pub fn put(
        &self,
        key: RequestKey,
        artifact: Arc<RefCountedArtifact>,
    ) -> Vec<Arc<RefCountedArtifact>> {
        let cost = artifact.artifact().cost();
        if cost > self.max_bytes {
            counter!("stratacache_memory_evict_total").increment(1);
            return vec![artifact];
        }

        let mut evicted = Vec::new();
        let mut state = mutex_lock(&self.state, SOURCE, "memory.put");
        if let Some(previous) = state.entries.put(key, artifact) {
            state.used_bytes -= previous.artifact().cost();
            evicted.push(previous);
        }
        state.used_bytes += cost;

        while state.used_bytes > self.max_bytes {
            let Some((_, oldest)) = state.entries.pop_lru() else {
                break;
            };
            state.used_bytes -= oldest.artifact().cost();
            evicted.push(oldest);
        }
        drop(state);

        if !evicted.is_empty() {
            counter!("stratacache_memory_evict_total").increment(evicted.len() as u64);
        }
        evicted
    }

    /// Remove and return the entry for `key`.
    pub fn take(&self, key: &RequestKey) -> Option<Arc<RefCountedArtifact>> {
        let mut state = mutex_lock(&self.state, SOURCE, "memory.take");
        let taken = state.entries.pop(key);
        if let Some(artifact) = &taken {
            state.used_bytes -= artifact.artifact().cost();
        }
        drop(state);

        if taken.is_some() {
            counter!("stratacache_memory_hit_total").increment(1);
        } else {
            counter!("stratacache_memory_miss_total").increment(1);
        }
        taken
    }

    /// Take a hit out of the tier and acquire it for a caller.
    pub fn acquire(&self, key: &RequestKey) -> Result<Option<ArtifactHandle>, LifetimeError> {
        self.take(key)
            .map(|artifact| ArtifactHandle::acquire(artifact, Provenance::MemoryCache))
            .transpose()
    }

    /// Empty the tier, returning every entry for recycling.
    pub fn clear(&self) -> Vec<Arc<RefCountedArtifact>> {
        let mut state = mutex_lock(&self.state, SOURCE, "memory.clear");
        state.used_bytes = 0;
        let mut drained = Vec::with_capacity(state.entries.len());
        while let Some((_, artifact)) = state.entries.pop_lru() {
            drained.push(artifact);
        }
        drained
    }

    pub fn used_bytes(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "memory.used_bytes").used_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "memory.len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.len())
            .field("used_bytes", &self.used_bytes())
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}
