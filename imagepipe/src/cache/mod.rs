//! Reference result-cache implementations.
//!
//! The pipeline talks to caches only through the
//! [`ResultCache`](crate::pipeline::ResultCache) and
//! [`DiskCache`](crate::pipeline::DiskCache) traits. These implementations
//! cover the common cases: a bounded memory cache, a directory-backed disk
//! cache, and no-op variants for disabling either tier.

mod disk;
mod memory;
mod noop;

pub use disk::DirectoryDiskCache;
pub use memory::{MemoryCacheStats, MemoryResultCache, DEFAULT_MEMORY_CACHE_BYTES};
pub use noop::{NoOpDiskCache, NoOpResultCache};

use thiserror::Error;

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
