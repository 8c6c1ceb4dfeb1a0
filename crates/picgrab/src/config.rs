use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::error::{ImageError, Result};
use crate::options::{ExecutionOrder, LoadOptions};

const DEFAULT_USER_AGENT: &str = concat!("picgrab/", env!("CARGO_PKG_VERSION"));

/// Order of the two passes of a disk cleanup when both limits are exceeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanupOrder {
    /// Remove entries older than `max_cache_age`, then trim to `max_cache_size`.
    #[default]
    AgeFirst,
    /// Trim to `max_cache_size`, then remove entries older than `max_cache_age`.
    SizeFirst,
}

/// Configuration for the memory and disk tiers
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory of the disk cache. If None, `<tmp>/picgrab-cache` is used.
    pub disk_cache_path: Option<PathBuf>,
    /// Entries older than this are removed by a cleanup pass. None means no age limit.
    pub max_cache_age: Option<Duration>,
    /// Maximum total size of the disk cache in bytes. 0 means unlimited.
    pub max_cache_size: u64,
    /// Maximum total cost of the memory cache in bytes. 0 means unlimited.
    pub max_memory_cost: u64,
    /// Maximum number of entries held in memory. 0 means unlimited.
    pub max_memory_count: usize,
    /// Whether decoded images are kept in the memory tier at all.
    pub cache_in_memory: bool,
    pub cleanup_order: CleanupOrder,
    /// Evict oldest-accessed disk entries right after a write that exceeds `max_cache_size`.
    pub trim_on_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disk_cache_path: None,
            max_cache_age: Some(Duration::from_secs(60 * 60 * 24 * 7)), // 1 week
            max_cache_size: 0,
            max_memory_cost: 64 * 1024 * 1024, // 64MB
            max_memory_count: 0,
            cache_in_memory: true,
            cleanup_order: CleanupOrder::AgeFirst,
            trim_on_write: true,
        }
    }
}

impl CacheConfig {
    /// Directory used by the disk tier.
    pub fn resolved_disk_path(&self) -> PathBuf {
        self.disk_cache_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("picgrab-cache"))
    }

    pub fn validate(&self) -> Result<()> {
        if matches!(&self.disk_cache_path, Some(path) if path.as_os_str().is_empty()) {
            return Err(ImageError::Config("disk_cache_path is empty".into()));
        }
        Ok(())
    }
}

/// Configurable options for the downloader
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Size of the worker pool
    pub max_concurrent_downloads: usize,

    /// Dequeue discipline for not-yet-started tasks
    pub execution_order: ExecutionOrder,

    /// Per-request timeout. Zero disables it.
    pub download_timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers sent with every request
    pub headers: HeaderMap,

    /// Basic auth credentials
    pub username: Option<String>,
    pub password: Option<String>,

    /// Byte budget of the transport-level response cache. 0 disables it.
    pub response_cache_capacity: u64,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 6,
            execution_order: ExecutionOrder::Fifo,
            download_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            username: None,
            password: None,
            response_cache_capacity: 16 * 1024 * 1024, // 16MB
            use_system_proxy: true,
        }
    }
}

impl DownloaderConfig {
    pub fn builder() -> crate::builder::DownloaderConfigBuilder {
        crate::builder::DownloaderConfigBuilder::new()
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("image/webp,image/avif,image/*,*/*;q=0.8"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(ImageError::Config(
                "max_concurrent_downloads must be greater than zero".into(),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ImageError::Config(
                "password given without a username".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for batch prefetching
#[derive(Debug, Clone, Copy)]
pub struct PrefetcherConfig {
    /// Number of keys loaded at the same time
    pub max_concurrent_prefetches: usize,
    /// Options applied to every prefetched load
    pub options: LoadOptions,
}

impl Default for PrefetcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_prefetches: 3,
            options: LoadOptions::prefetch(),
        }
    }
}

impl PrefetcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_prefetches == 0 {
            return Err(ImageError::Config(
                "max_concurrent_prefetches must be greater than zero".into(),
            ));
        }
        self.options.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cache = CacheConfig::default();
        assert_eq!(
            cache.max_cache_age,
            Some(Duration::from_secs(7 * 24 * 3600))
        );
        assert_eq!(cache.cleanup_order, CleanupOrder::AgeFirst);
        assert!(cache.validate().is_ok());

        let downloader = DownloaderConfig::default();
        assert_eq!(downloader.max_concurrent_downloads, 6);
        assert_eq!(downloader.download_timeout, Duration::from_secs(15));
        assert!(downloader.headers.contains_key(reqwest::header::ACCEPT));

        let prefetcher = PrefetcherConfig::default();
        assert_eq!(prefetcher.max_concurrent_prefetches, 3);
        assert!(prefetcher.options.low_priority);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = DownloaderConfig {
            max_concurrent_downloads: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ImageError::Config(_))));

        let config = PrefetcherConfig {
            max_concurrent_prefetches: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolved_disk_path_falls_back_to_temp() {
        let config = CacheConfig::default();
        assert!(config.resolved_disk_path().ends_with("picgrab-cache"));
    }
}
