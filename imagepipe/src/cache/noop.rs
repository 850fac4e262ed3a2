//! Caches that never store anything.

use crate::cache::CacheError;
use crate::pipeline::{DiskCache, ResultCache};
use crate::processing::ImageContainer;
use crate::request::ResultKey;
use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};

/// Memory cache that always misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpResultCache;

impl ResultCache for NoOpResultCache {
    fn get(&self, _key: &ResultKey) -> Option<ImageContainer> {
        None
    }

    fn insert(&self, _key: ResultKey, _image: ImageContainer) {}

    fn remove(&self, _key: &ResultKey) {}

    fn clear(&self) {}
}

/// Disk cache that always misses and accepts writes without storing them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpDiskCache;

impl DiskCache for NoOpDiskCache {
    fn get<'a>(&'a self, _key: &'a ResultKey) -> BoxFuture<'a, Option<Bytes>> {
        future::ready(None).boxed()
    }

    fn put<'a>(
        &'a self,
        _key: &'a ResultKey,
        _data: Bytes,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ImageRequest, RequestKeys};
    use image::{DynamicImage, RgbaImage};

    #[tokio::test]
    async fn test_noop_caches_always_miss() {
        let key = RequestKeys::derive(&ImageRequest::new("mem://a")).full_result_key();

        let memory = NoOpResultCache;
        memory.insert(
            key.clone(),
            ImageContainer::new(DynamicImage::ImageRgba8(RgbaImage::new(1, 1))),
        );
        assert!(memory.get(&key).is_none());

        let disk = NoOpDiskCache;
        assert!(disk.put(&key, Bytes::from_static(b"x")).await.is_ok());
        assert!(disk.get(&key).await.is_none());
    }

    #[test]
    fn test_noop_caches_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoOpResultCache>();
        assert_send_sync::<NoOpDiskCache>();
    }
}
