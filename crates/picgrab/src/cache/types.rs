//! # Cache Types
//!
//! Common types used across the memory and disk tiers.

use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::key::CacheKey;
use crate::decoder::DecodedImage;

/// One cached resource. Each tier owns its own copy.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub encoded_bytes: Bytes,
    pub decoded_image: Option<DecodedImage>,
    /// Cost of the entry, the length of the encoded bytes.
    pub byte_size: u64,
    pub created_at: SystemTime,
    pub last_accessed_at: SystemTime,
}

impl CacheEntry {
    pub fn new(key: CacheKey, encoded_bytes: Bytes, decoded_image: Option<DecodedImage>) -> Self {
        let now = SystemTime::now();
        Self {
            key,
            byte_size: encoded_bytes.len() as u64,
            encoded_bytes,
            decoded_image,
            created_at: now,
            last_accessed_at: now,
        }
    }
}

/// HTTP validators used to revalidate a cached resource with its origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    /// ETag value if available
    pub etag: Option<String>,
    /// Last-Modified header value if available
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Sidecar metadata written next to each disk cache file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SidecarMetadata {
    /// The unhashed cache key
    pub key: String,
    #[serde(flatten)]
    pub validators: Validators,
    /// Content type of the resource
    pub content_type: Option<String>,
}

/// Index record of one disk cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskIndexEntry {
    pub byte_size: u64,
    pub modified_at: SystemTime,
    pub accessed_at: SystemTime,
}

/// Outcome of a disk cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed_count: usize,
    pub freed_bytes: u64,
}

impl CleanupReport {
    pub(crate) fn record(&mut self, byte_size: u64) {
        self.removed_count += 1;
        self.freed_bytes += byte_size;
    }
}

/// File count and byte total of the disk cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSize {
    pub file_count: usize,
    pub total_bytes: u64,
}
