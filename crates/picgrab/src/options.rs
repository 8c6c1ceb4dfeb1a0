//! # Request Options
//!
//! Named per-request flags for loads and downloads. Each flag is documented
//! with its effect; combinations that contradict each other are rejected by
//! `validate()` before any work is scheduled.

use crate::error::{ImageError, Result};

/// Options for a single [`ImageManager::load`](crate::ImageManager::load) call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Skip the disk tier entirely, for both reads and writes.
    pub memory_only: bool,
    /// Enqueue the download behind every normal-priority task.
    pub low_priority: bool,
    /// Enqueue the download ahead of every normal-priority task.
    pub high_priority: bool,
    /// Deliver partial bytes through the progress callback while downloading.
    pub progressive_download: bool,
    /// Revalidate against the origin even when the image was served from cache.
    /// Subscribers are notified a second time only if the resource changed.
    pub refresh_cached: bool,
    /// Retry a key that already failed earlier in this process.
    pub retry_failed: bool,
    /// Let the transport consult its own response cache.
    pub use_transport_cache: bool,
    /// Treat a response served from the transport cache as "not modified".
    /// Requires `use_transport_cache`.
    pub ignore_cached_response: bool,
    /// Only look in the caches; never touch the network.
    pub from_cache_only: bool,
    /// Skip cache lookups and always download. Results are still stored.
    pub from_loader_only: bool,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options used by the prefetcher unless configured otherwise.
    pub fn prefetch() -> Self {
        Self {
            low_priority: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.low_priority && self.high_priority {
            return Err(ImageError::Config(
                "low_priority and high_priority are mutually exclusive".into(),
            ));
        }
        if self.from_cache_only && self.from_loader_only {
            return Err(ImageError::Config(
                "from_cache_only and from_loader_only are mutually exclusive".into(),
            ));
        }
        if self.refresh_cached && self.from_cache_only {
            return Err(ImageError::Config(
                "refresh_cached needs network access but from_cache_only forbids it".into(),
            ));
        }
        if self.ignore_cached_response && !self.use_transport_cache {
            return Err(ImageError::Config(
                "ignore_cached_response requires use_transport_cache".into(),
            ));
        }
        Ok(())
    }

    /// Downloader options implied by these load options.
    pub fn downloader_options(&self) -> DownloaderOptions {
        let priority = if self.high_priority {
            Priority::High
        } else if self.low_priority {
            Priority::Low
        } else {
            Priority::Normal
        };

        DownloaderOptions {
            priority,
            progressive_download: self.progressive_download,
            use_transport_cache: self.use_transport_cache,
            ignore_cached_response: self.ignore_cached_response,
        }
    }
}

/// Scheduling class of a queued download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Options understood by the [`Downloader`](crate::Downloader).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloaderOptions {
    pub priority: Priority,
    pub progressive_download: bool,
    pub use_transport_cache: bool,
    pub ignore_cached_response: bool,
}

/// Dequeue discipline for not-yet-started downloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionOrder {
    /// First in, first out.
    #[default]
    Fifo,
    /// Last in, first out.
    Lifo,
}

/// Provenance of a delivered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheType {
    /// Freshly downloaded.
    None,
    Memory,
    Disk,
}
