//! Cache stage - reads and commits results to the result caches.
//!
//! Memory entries are written for every prefix a terminal unit produces;
//! disk entries only ever for full keys, so the disk holds final results
//! alone.

use crate::pipeline::context::{
    DiskCache, ImageDecoding, ImageEncoding, PipelineContext, ResultCache,
};
use crate::pipeline::stages::decode_stage;
use crate::pipeline::work_unit::CommitPolicy;
use crate::processing::ImageContainer;
use crate::request::{DecodingHints, ResultKey};
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

/// Commits stage results to the memory and disk caches.
#[derive(Clone)]
pub struct ResultCacheWriter {
    memory: Arc<dyn ResultCache>,
    disk: Arc<dyn DiskCache>,
    decoder: Arc<dyn ImageDecoding>,
    encoder: Arc<dyn ImageEncoding>,
}

impl ResultCacheWriter {
    pub fn new(context: &PipelineContext) -> Self {
        Self {
            memory: Arc::clone(&context.memory_cache),
            disk: Arc::clone(&context.disk_cache),
            decoder: Arc::clone(&context.decoder),
            encoder: Arc::clone(&context.encoder),
        }
    }

    /// Looks up a full key on disk and decodes the entry.
    ///
    /// Entries that fail to decode are treated as misses.
    pub async fn read_disk(&self, key: &ResultKey, hints: DecodingHints) -> Option<ImageContainer> {
        let data = self.disk.get(key).await?;
        match decode_stage(Arc::clone(&self.decoder), data, hints).await {
            Ok(image) => {
                debug!(key = %key, "Disk cache hit");
                Some(image)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring undecodable disk cache entry");
                None
            }
        }
    }

    /// Writes `image` under `key` to whichever caches `policy` allows.
    ///
    /// `encoded` is stored on disk as-is when given; otherwise the image is
    /// encoded first. Failures are logged and never fail the request.
    pub async fn commit(
        &self,
        key: &ResultKey,
        image: &ImageContainer,
        encoded: Option<Bytes>,
        policy: CommitPolicy,
    ) {
        if policy.memory {
            self.memory.insert(key.clone(), image.clone());
        }
        if !policy.disk {
            return;
        }

        let data = match encoded {
            Some(data) => data,
            None => {
                let encoder = Arc::clone(&self.encoder);
                let image = image.clone();
                match spawn_blocking(move || encoder.encode(&image)).await {
                    Ok(Ok(data)) => data,
                    Ok(Err(e)) => {
                        warn!(key = %key, error = %e, "Failed to encode result for disk cache");
                        return;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Encode task panicked");
                        return;
                    }
                }
            }
        };

        let size_bytes = data.len();
        match self.disk.put(key, data).await {
            Ok(()) => debug!(key = %key, size_bytes, "Committed result to disk cache"),
            Err(e) => warn!(key = %key, error = %e, "Failed to write disk cache entry"),
        }
    }
}

impl std::fmt::Debug for ResultCacheWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCacheWriter").finish_non_exhaustive()
    }
}
