//! Collaborator contracts and the shared pipeline context.
//!
//! The pipeline never fetches, decodes, encodes or stores anything itself.
//! It drives the collaborators below, which are injected through
//! [`PipelineContext`] so tests can substitute counting or gated fakes.
//!
//! ```text
//! DataLoader    Locator  → byte stream      (fetch stage)
//! ImageDecoding bytes    → ImageContainer   (decode stage)
//! ImageEncoding image    → bytes            (disk cache writes)
//! ResultCache   ResultKey ↔ ImageContainer  (any prefix)
//! DiskCache     ResultKey ↔ bytes           (full keys only)
//! ```

use crate::cache::{CacheError, MemoryResultCache, NoOpDiskCache};
use crate::pipeline::adapters::{ImageCrateDecoder, PngEncoder};
use crate::processing::ImageContainer;
use crate::request::{DecodingHints, Locator, ResultKey};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use thiserror::Error;

/// Error reported by a data loader.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FetchError {
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error reported by a decoder.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DecodeError {
    pub message: String,
}

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error reported by an encoder.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EncodeError {
    pub message: String,
}

impl EncodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Options forwarded to the data loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Bypass any caching layer inside the loader
    pub reload_ignoring_cached_data: bool,
}

/// A streaming response from the data loader.
pub struct DataResponse {
    /// Total size if known up front, used for progress reporting
    pub expected_len: Option<u64>,
    /// Body chunks, in order
    pub body: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl DataResponse {
    /// Response with a single, already available body.
    pub fn from_bytes(data: Bytes) -> Self {
        let len = data.len() as u64;
        Self {
            expected_len: Some(len),
            body: stream::once(async move { Ok(data) }).boxed(),
        }
    }

    /// Response delivered as a sequence of chunks.
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        let len = chunks.iter().map(|c| c.len() as u64).sum();
        Self {
            expected_len: Some(len),
            body: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        }
    }
}

impl std::fmt::Debug for DataResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataResponse")
            .field("expected_len", &self.expected_len)
            .field("body", &"<stream>")
            .finish()
    }
}

/// Fetches raw bytes for a locator.
///
/// Dropping the returned future or the body stream cancels the fetch.
pub trait DataLoader: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        locator: &'a Locator,
        options: FetchOptions,
    ) -> BoxFuture<'a, Result<DataResponse, FetchError>>;
}

/// Decodes bytes into an image. Runs on the blocking thread pool.
pub trait ImageDecoding: Send + Sync + 'static {
    fn decode(&self, data: &[u8], hints: &DecodingHints) -> Result<ImageContainer, DecodeError>;
}

/// Encodes an image for the disk cache. Runs on the blocking thread pool.
pub trait ImageEncoding: Send + Sync + 'static {
    fn encode(&self, image: &ImageContainer) -> Result<Bytes, EncodeError>;
}

/// In-memory result cache.
///
/// Lookups use arbitrary prefix keys, not only full keys. Operations are
/// synchronous since memory access is fast.
pub trait ResultCache: Send + Sync + 'static {
    fn get(&self, key: &ResultKey) -> Option<ImageContainer>;

    fn insert(&self, key: ResultKey, image: ImageContainer);

    fn remove(&self, key: &ResultKey);

    fn clear(&self);
}

/// Persistent result cache, consulted and written at full-key granularity.
pub trait DiskCache: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a ResultKey) -> BoxFuture<'a, Option<Bytes>>;

    fn put<'a>(&'a self, key: &'a ResultKey, data: Bytes) -> BoxFuture<'a, Result<(), CacheError>>;
}

/// Shared collaborators for all pipeline stages.
///
/// Cheaply cloneable; every field is an `Arc`.
#[derive(Clone)]
pub struct PipelineContext {
    pub loader: Arc<dyn DataLoader>,
    pub decoder: Arc<dyn ImageDecoding>,
    pub encoder: Arc<dyn ImageEncoding>,
    pub memory_cache: Arc<dyn ResultCache>,
    pub disk_cache: Arc<dyn DiskCache>,
}

impl PipelineContext {
    /// Creates a context around a data loader.
    ///
    /// Uses the `image` crate decoder, PNG encoding, a default-sized memory
    /// cache and no disk cache.
    pub fn new(loader: Arc<dyn DataLoader>) -> Self {
        Self {
            loader,
            decoder: Arc::new(ImageCrateDecoder),
            encoder: Arc::new(PngEncoder),
            memory_cache: Arc::new(MemoryResultCache::default()),
            disk_cache: Arc::new(NoOpDiskCache),
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn ImageDecoding>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn ImageEncoding>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_memory_cache(mut self, memory_cache: Arc<dyn ResultCache>) -> Self {
        self.memory_cache = memory_cache;
        self
    }

    pub fn with_disk_cache(mut self, disk_cache: Arc<dyn DiskCache>) -> Self {
        self.disk_cache = disk_cache;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_data_response_from_chunks() {
        let response = DataResponse::from_chunks(vec![
            Bytes::from_static(b"ab"),
            Bytes::from_static(b"cde"),
        ]);
        assert_eq!(response.expected_len, Some(5));

        let chunks: Vec<Bytes> = response.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"abcde".to_vec());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(FetchError::new("404").to_string(), "404");
        assert_eq!(DecodeError::new("bad header").to_string(), "bad header");
        assert_eq!(EncodeError::new("oom").to_string(), "oom");
    }
}
