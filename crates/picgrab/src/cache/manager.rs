//! # Image Cache
//!
//! Coordinates the memory and disk tiers. The memory tier always answers
//! first; disk hits are returned undecoded so the caller can decode them off
//! the lookup path and promote the result with [`ImageCache::store_memory`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::cache::disk::DiskCache;
use crate::cache::key::CacheKey;
use crate::cache::memory::MemoryCache;
use crate::cache::types::{CacheEntry, CacheSize, CleanupReport, SidecarMetadata, Validators};
use crate::config::CacheConfig;
use crate::decoder::DecodedImage;
use crate::error::Result;
use crate::options::CacheType;

/// Two-tier image cache
pub struct ImageCache {
    memory: MemoryCache,
    disk: DiskCache,
    config: CacheConfig,
}

impl ImageCache {
    /// Create a new cache with the specified configuration
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let memory = MemoryCache::new(config.max_memory_cost, config.max_memory_count);
        let disk = DiskCache::new(&config)?;
        Ok(Self {
            memory,
            disk,
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    /// Synchronous memory lookup.
    pub fn query_memory(&self, key: &CacheKey) -> Option<CacheEntry> {
        if !self.config.cache_in_memory {
            return None;
        }
        self.memory.get(key)
    }

    /// Raw bytes from the disk tier or a search path.
    pub async fn query_disk(&self, key: &CacheKey) -> Option<Bytes> {
        self.disk.get(key).await
    }

    /// Look up `key` in memory, then on disk unless `memory_only`.
    /// Disk hits carry no decoded image.
    pub async fn query(
        &self,
        key: &CacheKey,
        memory_only: bool,
    ) -> Option<(CacheEntry, CacheType)> {
        if let Some(entry) = self.query_memory(key) {
            return Some((entry, CacheType::Memory));
        }
        if memory_only {
            return None;
        }
        let bytes = self.query_disk(key).await?;
        Some((CacheEntry::new(key.clone(), bytes, None), CacheType::Disk))
    }

    /// Put an entry into the memory tier, if enabled.
    pub fn store_memory(&self, entry: CacheEntry) {
        if self.config.cache_in_memory {
            self.memory.set(entry);
        }
    }

    /// Store into memory and, when `to_disk`, onto disk. A disk failure is
    /// returned after the memory tier was already updated.
    pub async fn store(
        &self,
        key: &CacheKey,
        bytes: Bytes,
        image: Option<DecodedImage>,
        to_disk: bool,
        metadata: Option<&SidecarMetadata>,
    ) -> Result<()> {
        if to_disk {
            self.store_memory(CacheEntry::new(key.clone(), bytes.clone(), image));
            self.disk.store(key, &bytes, metadata).await
        } else {
            self.store_memory(CacheEntry::new(key.clone(), bytes, image));
            Ok(())
        }
    }

    /// Remove `key` from memory and, when `from_disk`, from disk.
    pub async fn remove(&self, key: &CacheKey, from_disk: bool) -> Result<()> {
        self.memory.remove(key);
        if from_disk {
            self.disk.remove(key).await?;
        }
        Ok(())
    }

    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    pub async fn clear_disk(&self) -> Result<()> {
        self.disk.clear().await
    }

    /// Run the disk cleanup policy.
    pub async fn clean_disk(&self) -> Result<CleanupReport> {
        self.disk.cleanup().await
    }

    pub async fn calculate_size(&self) -> CacheSize {
        self.disk.calculate_size().await
    }

    pub async fn disk_image_exists(&self, key: &CacheKey) -> bool {
        self.disk.contains(key).await
    }

    /// Revalidation data recorded for `key`, if any.
    pub async fn validators(&self, key: &CacheKey) -> Option<Validators> {
        self.disk
            .read_metadata(key)
            .await
            .map(|metadata| metadata.validators)
            .filter(|validators| !validators.is_empty())
    }

    pub fn add_search_path(&self, path: impl Into<PathBuf>) {
        self.disk.add_search_path(path);
    }

    pub fn remove_search_path(&self, path: &Path) {
        self.disk.remove_search_path(path);
    }

    pub fn clear_search_paths(&self) {
        self.disk.clear_search_paths();
    }

    /// Start a background task that runs [`clean_disk`](Self::clean_disk)
    /// every `interval`.
    pub fn start_maintenance_task(
        self: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                match self.clean_disk().await {
                    Ok(report) => debug!(
                        removed = report.removed_count,
                        freed = report.freed_bytes,
                        "Cache maintenance finished"
                    ),
                    Err(e) => warn!(error = %e, "Cache maintenance error"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(format!("https://x/{name}")).unwrap()
    }

    fn cache(dir: &TempDir, configure: impl FnOnce(&mut CacheConfig)) -> ImageCache {
        let mut config = CacheConfig {
            disk_cache_path: Some(dir.path().to_path_buf()),
            ..CacheConfig::default()
        };
        configure(&mut config);
        ImageCache::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_memory_then_disk_provenance() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, |_| {});
        let k = key("a.png");

        cache
            .store(&k, Bytes::from_static(b"abc"), None, true, None)
            .await
            .unwrap();
        let (_, from) = cache.query(&k, false).await.unwrap();
        assert_eq!(from, CacheType::Memory);

        cache.clear_memory();
        let (entry, from) = cache.query(&k, false).await.unwrap();
        assert_eq!(from, CacheType::Disk);
        assert_eq!(entry.encoded_bytes.as_ref(), b"abc");
        assert!(entry.decoded_image.is_none());

        assert!(cache.query(&k, true).await.is_none());
    }

    #[tokio::test]
    async fn test_memory_only_store_skips_disk() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, |_| {});
        let k = key("m.png");

        cache
            .store(&k, Bytes::from_static(b"abc"), None, false, None)
            .await
            .unwrap();
        assert!(cache.query_memory(&k).is_some());
        assert!(!cache.disk_image_exists(&k).await);
    }

    #[tokio::test]
    async fn test_memory_tier_disabled() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, |c| c.cache_in_memory = false);
        let k = key("d.png");

        cache
            .store(&k, Bytes::from_static(b"abc"), None, true, None)
            .await
            .unwrap();
        assert!(cache.query_memory(&k).is_none());
        assert_eq!(cache.query(&k, false).await.unwrap().1, CacheType::Disk);
    }

    #[tokio::test]
    async fn test_remove_and_size() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, |_| {});
        cache
            .store(&key("a"), Bytes::from_static(b"12345"), None, true, None)
            .await
            .unwrap();
        cache
            .store(&key("b"), Bytes::from_static(b"123"), None, true, None)
            .await
            .unwrap();

        let size = cache.calculate_size().await;
        assert_eq!(size.file_count, 2);
        assert_eq!(size.total_bytes, 8);

        cache.remove(&key("a"), false).await.unwrap();
        assert!(cache.disk_image_exists(&key("a")).await);
        cache.remove(&key("a"), true).await.unwrap();
        assert!(!cache.disk_image_exists(&key("a")).await);
        assert!(cache.query(&key("a"), false).await.is_none());
    }

    #[tokio::test]
    async fn test_validators_from_sidecar() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir, |_| {});
        let k = key("v.png");
        let metadata = SidecarMetadata {
            key: k.to_string(),
            validators: Validators {
                etag: None,
                last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".into()),
            },
            content_type: None,
        };
        cache
            .store(&k, Bytes::from_static(b"v"), None, true, Some(&metadata))
            .await
            .unwrap();

        let validators = cache.validators(&k).await.unwrap();
        assert_eq!(
            validators.last_modified.as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
        assert!(cache.validators(&key("none.png")).await.is_none());
    }

    #[tokio::test]
    async fn test_maintenance_task_cleans_disk() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(cache(&dir, |c| {
            c.max_cache_size = 10;
            c.trim_on_write = false;
        }));
        cache
            .store(&key("a"), Bytes::from(vec![0u8; 8]), None, true, None)
            .await
            .unwrap();
        cache
            .store(&key("b"), Bytes::from(vec![0u8; 8]), None, true, None)
            .await
            .unwrap();
        assert_eq!(cache.calculate_size().await.total_bytes, 16);

        let handle = cache.clone().start_maintenance_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(cache.calculate_size().await.total_bytes <= 10);
    }
}
