//! # Picgrab
//!
//! An engine for loading remote images. Concurrent requests for the same
//! resource share one download, results are kept in a cost-bounded memory
//! cache and an age- and size-bounded disk cache, and batches of URLs can be
//! prefetched with their own concurrency budget.
//!
//! ## Features
//!
//! - Per-key download deduplication with per-caller cancellation
//! - LRU memory tier and hashed-file disk tier with atomic writes
//! - Bounded downloader with FIFO/LIFO order and priorities
//! - Conditional revalidation of cached images
//! - Batch prefetching

pub mod builder;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod downloader;
pub mod error;
pub mod manager;
pub mod options;
pub mod prefetcher;
pub mod token;

pub use builder::DownloaderConfigBuilder;
pub use cache::{CacheEntry, CacheKey, CacheKeyFilter, CacheSize, CleanupReport, ImageCache};
pub use config::{CacheConfig, CleanupOrder, DownloaderConfig, PrefetcherConfig};
pub use decoder::{DecodedImage, ImageDecoder, StandardDecoder};
pub use downloader::{
    DownloadEvent, DownloadHandle, DownloadProgress, DownloadRequest, Downloader, HeadersFilter,
    HttpTransport, ProgressSink, Transport,
};
pub use error::{ErrorKind, ImageError, Result};
pub use manager::{ImageManager, LoadHandle, LoadResult, LoadedImage};
pub use options::{CacheType, DownloaderOptions, ExecutionOrder, LoadOptions, Priority};
pub use prefetcher::{PrefetchHandle, PrefetchProgress, PrefetchReport, Prefetcher};
pub use token::OperationToken;
