//! Bounded in-memory result cache.

use crate::pipeline::ResultCache;
use crate::processing::ImageContainer;
use crate::request::ResultKey;
use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default capacity of [`MemoryResultCache`]: 256 MiB of decoded pixels.
pub const DEFAULT_MEMORY_CACHE_BYTES: u64 = 256 * 1024 * 1024;

/// Hit and miss counters for the memory cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

impl MemoryCacheStats {
    /// Returns the hit ratio (0.0 to 1.0).
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Memory cache for decoded and processed images.
///
/// Entries are weighted by their pixel buffer size and evicted once the
/// configured byte budget is exceeded.
pub struct MemoryResultCache {
    cache: Cache<ResultKey, ImageContainer>,
    max_size_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryResultCache {
    /// Creates a cache holding at most `max_size_bytes` of pixel data.
    pub fn new(max_size_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_size_bytes)
            .weigher(|_key: &ResultKey, image: &ImageContainer| -> u32 {
                u32::try_from(image.byte_size()).unwrap_or(u32::MAX)
            })
            .build();

        Self {
            cache,
            max_size_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns true if the key is cached, without touching statistics.
    pub fn contains(&self, key: &ResultKey) -> bool {
        self.cache.contains_key(key)
    }

    /// Number of cached entries after pending maintenance has run.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn stats(&self) -> MemoryCacheStats {
        MemoryCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entry_count(),
        }
    }
}

impl Default for MemoryResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CACHE_BYTES)
    }
}

impl ResultCache for MemoryResultCache {
    fn get(&self, key: &ResultKey) -> Option<ImageContainer> {
        let found = self.cache.get(key);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn insert(&self, key: ResultKey, image: ImageContainer) {
        self.cache.insert(key, image);
    }

    fn remove(&self, key: &ResultKey) {
        self.cache.invalidate(key);
    }

    fn clear(&self) {
        self.cache.invalidate_all();
    }
}
