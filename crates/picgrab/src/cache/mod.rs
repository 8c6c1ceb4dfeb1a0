//! # Cache System
//!
//! Two cache tiers in front of the downloader: a bounded in-process LRU of
//! decoded images and a persistent store of encoded bytes, coordinated by
//! [`ImageCache`].

pub mod disk;
pub mod key;
mod manager;
pub mod memory;
mod types;

pub use disk::DiskCache;
pub use key::{CacheKey, CacheKeyFilter, derive_key, parse_url};
pub use manager::ImageCache;
pub use memory::MemoryCache;
pub use types::{
    CacheEntry, CacheSize, CleanupReport, DiskIndexEntry, SidecarMetadata, Validators,
};
