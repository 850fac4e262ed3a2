//! Pipeline configuration.
//!
//! This module contains the [`PipelineConfig`] struct and related constants
//! for configuring coalescing, stage concurrency and cache lookups.

// =============================================================================
// Configuration Constants
// =============================================================================

/// Default maximum concurrent fetches.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 6;

/// Fallback for CPU-bound stage limits when parallelism cannot be queried.
pub const FALLBACK_CPU_CONCURRENCY: usize = 4;

/// Default concurrency for CPU-bound stages (decode, process).
pub fn default_cpu_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_CPU_CONCURRENCY)
}

// =============================================================================
// Cache Lookup Policy
// =============================================================================

/// Which cache lookups the pipeline performs before doing work.
///
/// The memory cache may be probed for any processing prefix; the disk cache
/// is only ever consulted for a request's full key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheLookupPolicy {
    /// Probe the memory cache for intermediate prefixes
    pub memory_prefixes: bool,

    /// Probe the disk cache for full keys
    pub disk_full_keys: bool,
}

impl Default for CacheLookupPolicy {
    fn default() -> Self {
        Self {
            memory_prefixes: true,
            disk_full_keys: true,
        }
    }
}

// =============================================================================
// Pipeline Configuration
// =============================================================================

/// Configuration for the image pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Share in-flight work between requests with equal keys.
    ///
    /// When disabled every request gets its own units at every stage.
    pub coalescing_enabled: bool,

    /// Maximum fetches running at once.
    pub max_concurrent_fetches: usize,

    /// Maximum decodes running at once.
    pub max_concurrent_decodes: usize,

    /// Maximum processing steps running at once.
    pub max_concurrent_processing: usize,

    /// Cache lookups performed before doing work.
    pub cache_lookup: CacheLookupPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            coalescing_enabled: true,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            max_concurrent_decodes: default_cpu_concurrency(),
            max_concurrent_processing: default_cpu_concurrency(),
            cache_lookup: CacheLookupPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_coalescing(mut self, enabled: bool) -> Self {
        self.coalescing_enabled = enabled;
        self
    }

    pub fn with_max_concurrent_fetches(mut self, limit: usize) -> Self {
        self.max_concurrent_fetches = limit;
        self
    }

    pub fn with_max_concurrent_decodes(mut self, limit: usize) -> Self {
        self.max_concurrent_decodes = limit;
        self
    }

    pub fn with_max_concurrent_processing(mut self, limit: usize) -> Self {
        self.max_concurrent_processing = limit;
        self
    }

    pub fn with_cache_lookup(mut self, cache_lookup: CacheLookupPolicy) -> Self {
        self.cache_lookup = cache_lookup;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert!(config.coalescing_enabled);
        assert_eq!(config.max_concurrent_fetches, DEFAULT_MAX_CONCURRENT_FETCHES);
        assert!(config.max_concurrent_decodes >= 1);
        assert!(config.max_concurrent_processing >= 1);
        assert_eq!(config.cache_lookup, CacheLookupPolicy::default());
    }

    #[test]
    fn test_pipeline_config_builders() {
        let config = PipelineConfig::default()
            .with_coalescing(false)
            .with_max_concurrent_fetches(1)
            .with_max_concurrent_decodes(2)
            .with_max_concurrent_processing(3)
            .with_cache_lookup(CacheLookupPolicy {
                memory_prefixes: false,
                disk_full_keys: true,
            });

        assert!(!config.coalescing_enabled);
        assert_eq!(config.max_concurrent_fetches, 1);
        assert_eq!(config.max_concurrent_decodes, 2);
        assert_eq!(config.max_concurrent_processing, 3);
        assert!(!config.cache_lookup.memory_prefixes);
    }
}
