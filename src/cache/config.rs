//! Engine configuration.
//!
//! Sizes the memory and disk tiers, the key-encoding cache and the deferred
//! recycle pool. Loaded from the `[cache]` section of `stratacache.toml`.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use serde::Deserialize;

use super::strategy::PersistenceStrategy;

const DEFAULT_MEMORY_CACHE_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_DISK_CACHE_BYTES: u64 = 250 * 1024 * 1024;
const DEFAULT_KEY_ENCODING_CAPACITY: usize = 1000;
const DEFAULT_DEFERRED_POOL_CAPACITY: usize = 20;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep released artifacts in memory.
    pub enable_memory_cache: bool,
    /// Byte budget of the memory tier.
    pub memory_cache_bytes: usize,
    /// Byte budget of the on-disk persistent tiers.
    pub disk_cache_bytes: u64,
    /// Directory of the on-disk tiers. `None` keeps persistent entries in memory.
    pub disk_cache_dir: Option<PathBuf>,
    /// Maximum persistent key names kept encoded.
    pub key_encoding_capacity: usize,
    /// Idle shells kept by the deferred recycle pool.
    pub deferred_pool_capacity: usize,
    /// Strategy for requests that do not choose one.
    pub default_strategy: PersistenceStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_memory_cache: true,
            memory_cache_bytes: DEFAULT_MEMORY_CACHE_BYTES,
            disk_cache_bytes: DEFAULT_DISK_CACHE_BYTES,
            disk_cache_dir: None,
            key_encoding_capacity: DEFAULT_KEY_ENCODING_CAPACITY,
            deferred_pool_capacity: DEFAULT_DEFERRED_POOL_CAPACITY,
            default_strategy: PersistenceStrategy::default(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enable_memory_cache: settings.enable_memory_cache,
            memory_cache_bytes: settings.memory_cache_bytes,
            disk_cache_bytes: settings.disk_cache_bytes,
            disk_cache_dir: settings.disk_cache_dir.clone(),
            key_encoding_capacity: settings.key_encoding_capacity,
            deferred_pool_capacity: settings.deferred_pool_capacity,
            default_strategy: settings.default_strategy,
        }
    }
}

impl CacheConfig {
    /// Returns the key-encoding capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn key_encoding_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.key_encoding_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the memory budget as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_cache_bytes_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_cache_bytes).unwrap_or(NonZeroUsize::MIN)
    }
}
