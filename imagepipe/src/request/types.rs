//! Request value types.

use crate::processing::{ImageProcessor, ProcessorId};
use std::fmt;
use std::sync::Arc;

/// Scheduling priority of a request or a shared work unit.
///
/// A shared unit always runs at the maximum priority among its attached
/// subscribers, falling back to [`Priority::VeryLow`] when it has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Floor priority, also used by units without subscribers
    VeryLow,
    /// Background prefetching
    Low,
    /// Standard requests
    #[default]
    Normal,
    /// Visible content
    High,
    /// Content the user is waiting on right now
    VeryHigh,
}

impl Priority {
    /// Priority of a work unit that has no subscribers.
    pub const FLOOR: Priority = Priority::VeryLow;

    /// Returns the priority name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VeryLow => "very_low",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::VeryHigh => "very_high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the source bytes of an image live.
///
/// The pipeline treats the locator as an opaque string; interpreting it is
/// the data loader's job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locator(String);

impl Locator {
    /// Creates a locator from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the locator as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Locator {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Locator {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Cache-control flags for a single request.
///
/// Only `reload_ignoring_cached_data` changes what gets fetched and is part
/// of the data key. The skip flags decide whether this request reads or
/// writes the result caches and do not affect coalescing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CachePolicy {
    /// Fetch fresh data and ignore every cache read
    pub reload_ignoring_cached_data: bool,
    /// Do not look up results in the memory cache
    pub skip_memory_read: bool,
    /// Do not store results in the memory cache
    pub skip_memory_write: bool,
    /// Do not look up results in the disk cache
    pub skip_disk_read: bool,
    /// Do not store results in the disk cache
    pub skip_disk_write: bool,
}

impl CachePolicy {
    /// Policy that neither reads nor writes any cache.
    pub fn disabled() -> Self {
        Self {
            reload_ignoring_cached_data: false,
            skip_memory_read: true,
            skip_memory_write: true,
            skip_disk_read: true,
            skip_disk_write: true,
        }
    }

    /// Returns true if the memory cache may be read.
    #[inline]
    pub fn reads_memory(&self) -> bool {
        !self.skip_memory_read && !self.reload_ignoring_cached_data
    }

    /// Returns true if the disk cache may be read.
    #[inline]
    pub fn reads_disk(&self) -> bool {
        !self.skip_disk_read && !self.reload_ignoring_cached_data
    }

    /// Returns true if results may be stored in the memory cache.
    #[inline]
    pub fn writes_memory(&self) -> bool {
        !self.skip_memory_write
    }

    /// Returns true if results may be stored in the disk cache.
    #[inline]
    pub fn writes_disk(&self) -> bool {
        !self.skip_disk_write
    }
}

/// Thumbnail generation hint for the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThumbnailOptions {
    /// Longest side of the decoded image, in pixels
    pub max_pixel_size: u32,
}

/// Hints forwarded to the decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DecodingHints {
    /// Decode straight to a thumbnail instead of the full image
    pub thumbnail: Option<ThumbnailOptions>,
}

impl DecodingHints {
    /// Hints for decoding a thumbnail no larger than `max_pixel_size`.
    pub fn thumbnail(max_pixel_size: u32) -> Self {
        Self {
            thumbnail: Some(ThumbnailOptions { max_pixel_size }),
        }
    }
}

/// Request-scoped options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RequestOptions {
    /// Cache-control flags
    pub cache_policy: CachePolicy,
    /// Decoder hints
    pub decoding: DecodingHints,
}

/// A request for an image: where to get it and what to do with it.
///
/// # Example
///
/// ```ignore
/// use imagepipe::processing::{Grayscale, Resize};
/// use imagepipe::request::{ImageRequest, Priority};
///
/// let request = ImageRequest::new("https://example.com/a.png")
///     .with_processor(Resize::new(64, 64))
///     .with_processor(Grayscale)
///     .with_priority(Priority::High);
/// ```
#[derive(Clone)]
pub struct ImageRequest {
    locator: Locator,
    processors: Vec<Arc<dyn ImageProcessor>>,
    options: RequestOptions,
    priority: Priority,
}

impl ImageRequest {
    /// Creates a request without processors and with default options.
    pub fn new(locator: impl Into<Locator>) -> Self {
        Self {
            locator: locator.into(),
            processors: Vec::new(),
            options: RequestOptions::default(),
            priority: Priority::default(),
        }
    }

    /// Appends a processing step.
    pub fn with_processor(mut self, processor: impl ImageProcessor) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    /// Replaces the processing chain.
    pub fn with_processors(mut self, processors: Vec<Arc<dyn ImageProcessor>>) -> Self {
        self.processors = processors;
        self
    }

    /// Sets the initial priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the cache policy.
    pub fn with_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.options.cache_policy = cache_policy;
        self
    }

    /// Sets the decoding hints.
    pub fn with_decoding(mut self, decoding: DecodingHints) -> Self {
        self.options.decoding = decoding;
        self
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn processors(&self) -> &[Arc<dyn ImageProcessor>] {
        &self.processors
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.options.cache_policy
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns the identifiers of the processing chain, in order.
    pub fn processor_ids(&self) -> Vec<ProcessorId> {
        self.processors.iter().map(|p| p.identifier()).collect()
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("locator", &self.locator)
            .field("processors", &self.processor_ids())
            .field("options", &self.options)
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{Grayscale, Resize};

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::VeryLow < Priority::Low);
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::VeryHigh);
        assert_eq!(Priority::FLOOR, Priority::VeryLow);
    }

    #[test]
    fn test_priority_default() {
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_reload_disables_cache_reads_only() {
        let policy = CachePolicy {
            reload_ignoring_cached_data: true,
            ..Default::default()
        };
        assert!(!policy.reads_memory());
        assert!(!policy.reads_disk());
        assert!(policy.writes_memory());
        assert!(policy.writes_disk());
    }

    #[test]
    fn test_disabled_policy() {
        let policy = CachePolicy::disabled();
        assert!(!policy.reads_memory());
        assert!(!policy.writes_memory());
        assert!(!policy.reads_disk());
        assert!(!policy.writes_disk());
    }

    #[test]
    fn test_request_builder_keeps_processor_order() {
        let request = ImageRequest::new("mem://a")
            .with_processor(Resize::new(10, 20))
            .with_processor(Grayscale)
            .with_priority(Priority::High);

        let ids = request.processor_ids();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].name(), "resize");
        assert_eq!(ids[1].name(), "grayscale");
        assert_eq!(request.priority(), Priority::High);
        assert_eq!(request.locator().as_str(), "mem://a");
    }
}
