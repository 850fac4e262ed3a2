//! Directory-backed persistent cache.
//!
//! One file per key. File names are the SHA-256 of the key's stable string,
//! so the layout is independent of locator syntax. Eviction is left to the
//! operator.

use crate::cache::CacheError;
use crate::pipeline::DiskCache;
use crate::request::ResultKey;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Disk cache storing one file per full key under a root directory.
#[derive(Debug)]
pub struct DirectoryDiskCache {
    root: PathBuf,
    write_sequence: AtomicU64,
}

impl DirectoryDiskCache {
    /// Opens (and creates if needed) a cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_sequence: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `key`.
    pub fn path_for(&self, key: &ResultKey) -> PathBuf {
        let digest = Sha256::digest(key.stable_string().as_bytes());
        self.root.join(format!("{:x}", digest))
    }

    async fn read(&self, key: &ResultKey) -> Option<Bytes> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "Disk cache read failed");
                }
                None
            }
        }
    }

    async fn write(&self, key: &ResultKey, data: Bytes) -> Result<(), CacheError> {
        let path = self.path_for(key);
        // Readers only ever see complete files
        let sequence = self.write_sequence.fetch_add(1, Ordering::Relaxed);
        let temp = path.with_extension(format!("tmp{}", sequence));
        tokio::fs::write(&temp, &data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        debug!(key = %key, bytes = data.len(), "Disk cache write");
        Ok(())
    }
}

impl DiskCache for DirectoryDiskCache {
    fn get<'a>(&'a self, key: &'a ResultKey) -> BoxFuture<'a, Option<Bytes>> {
        self.read(key).boxed()
    }

    fn put<'a>(&'a self, key: &'a ResultKey, data: Bytes) -> BoxFuture<'a, Result<(), CacheError>> {
        self.write(key, data).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::Grayscale;
    use crate::request::{ImageRequest, RequestKeys};
    use tempfile::TempDir;

    fn key(request: &ImageRequest) -> ResultKey {
        RequestKeys::derive(request).full_result_key()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = TempDir::new().unwrap();
        let cache = DirectoryDiskCache::new(dir.path()).unwrap();
        let key = key(&ImageRequest::new("mem://a"));

        assert!(cache.get(&key).await.is_none());
        cache.put(&key, Bytes::from_static(b"png")).await.unwrap();
        assert_eq!(cache.get(&key).await, Some(Bytes::from_static(b"png")));
    }

    #[tokio::test]
    async fn test_keys_map_to_distinct_files() {
        let dir = TempDir::new().unwrap();
        let cache = DirectoryDiskCache::new(dir.path()).unwrap();
        let plain = key(&ImageRequest::new("mem://a"));
        let gray = key(&ImageRequest::new("mem://a").with_processor(Grayscale));

        assert_ne!(cache.path_for(&plain), cache.path_for(&gray));
        assert!(cache.path_for(&plain).starts_with(dir.path()));

        cache.put(&plain, Bytes::from_static(b"1")).await.unwrap();
        cache.put(&gray, Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(cache.get(&plain).await, Some(Bytes::from_static(b"1")));
        assert_eq!(cache.get(&gray).await, Some(Bytes::from_static(b"2")));
    }

    #[tokio::test]
    async fn test_lookalike_keys_do_not_share_a_file() {
        let dir = TempDir::new().unwrap();
        let cache = DirectoryDiskCache::new(dir.path()).unwrap();
        let literal = key(&ImageRequest::new("mem://x|grayscale"));
        let processed = key(&ImageRequest::new("mem://x").with_processor(Grayscale));

        assert_ne!(cache.path_for(&literal), cache.path_for(&processed));

        cache.put(&processed, Bytes::from_static(b"gray")).await.unwrap();
        assert!(cache.get(&literal).await.is_none());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let cache = DirectoryDiskCache::new(dir.path().join("nested")).unwrap();
        let key = key(&ImageRequest::new("mem://a"));

        cache.put(&key, Bytes::from_static(b"old")).await.unwrap();
        cache.put(&key, Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(cache.get(&key).await, Some(Bytes::from_static(b"new")));
    }
}
