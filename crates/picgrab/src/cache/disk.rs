//! # Disk Cache
//!
//! Persistent store of raw encoded bytes. Every key maps to one file named by
//! the SHA-256 of the key, with an optional `<hash>.meta` JSON sidecar holding
//! revalidation data. An in-memory index of size and timestamps is built from
//! a directory scan on first use and kept current by every operation.
//!
//! Access to a single file is serialized through a striped lock table, so a
//! cleanup never removes a file mid-read and readers never see a partial write.
//! Unrelated keys proceed concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::fs;
use tokio::io;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::key::CacheKey;
use crate::cache::types::{CacheSize, CleanupReport, DiskIndexEntry, SidecarMetadata};
use crate::config::{CacheConfig, CleanupOrder};
use crate::error::Result;

const LOCK_STRIPES: usize = 64;
const META_EXTENSION: &str = "meta";
const TEMP_EXTENSION: &str = "tmp";

#[derive(Debug, Clone, Copy)]
struct IndexRecord {
    entry: DiskIndexEntry,
    /// Monotonic touch counter, breaks ties between equal access times.
    touch: u64,
}

#[derive(Default)]
struct DiskIndex {
    records: HashMap<String, IndexRecord>,
    next_touch: u64,
}

impl DiskIndex {
    fn touch(&mut self) -> u64 {
        self.next_touch += 1;
        self.next_touch
    }

    fn upsert(&mut self, filename: String, entry: DiskIndexEntry) {
        let touch = self.touch();
        self.records.insert(filename, IndexRecord { entry, touch });
    }

    fn mark_accessed(&mut self, filename: &str) {
        let touch = self.touch();
        if let Some(record) = self.records.get_mut(filename) {
            record.entry.accessed_at = SystemTime::now();
            record.touch = touch;
        }
    }

    fn total_bytes(&self) -> u64 {
        self.records.values().map(|r| r.entry.byte_size).sum()
    }

    /// Filenames ordered oldest-accessed first.
    fn by_access(&self) -> Vec<(String, IndexRecord)> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .map(|(name, record)| (name.clone(), *record))
            .collect();
        records.sort_by_key(|(_, r)| (r.entry.accessed_at, r.touch));
        records
    }
}

/// File-system backed cache of encoded image bytes.
pub struct DiskCache {
    root: PathBuf,
    max_cache_age: Option<Duration>,
    max_cache_size: u64,
    cleanup_order: CleanupOrder,
    trim_on_write: bool,
    index: Mutex<DiskIndex>,
    index_ready: OnceCell<()>,
    locks: Vec<tokio::sync::RwLock<()>>,
    search_paths: RwLock<Vec<PathBuf>>,
}

impl DiskCache {
    /// Create a disk cache rooted at the configured directory. Nothing touches
    /// the file system until the first operation.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            root: config.resolved_disk_path(),
            max_cache_age: config.max_cache_age,
            max_cache_size: config.max_cache_size,
            cleanup_order: config.cleanup_order,
            trim_on_write: config.trim_on_write,
            index: Mutex::new(DiskIndex::default()),
            index_ready: OnceCell::new(),
            locks: (0..LOCK_STRIPES)
                .map(|_| tokio::sync::RwLock::new(()))
                .collect(),
            search_paths: RwLock::new(Vec::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the data file for `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.to_filename())
    }

    fn metadata_path(&self, filename: &str) -> PathBuf {
        self.root.join(filename).with_extension(META_EXTENSION)
    }

    fn lock_for(&self, filename: &str) -> &tokio::sync::RwLock<()> {
        let prefix = filename.get(..4).unwrap_or_default();
        let slot = usize::from_str_radix(prefix, 16).unwrap_or(0) % LOCK_STRIPES;
        &self.locks[slot]
    }

    async fn ensure_index(&self) -> io::Result<()> {
        self.index_ready
            .get_or_try_init(|| async {
                fs::create_dir_all(&self.root).await?;
                let records = scan_directory(&self.root).await?;
                let count = records.len();
                self.replace_index(records);
                debug!(root = ?self.root, count, "Disk cache index built");
                Ok::<(), io::Error>(())
            })
            .await
            .map(|_| ())
    }

    /// Rescan the cache directory, replacing the in-memory index.
    pub async fn rebuild_index(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let records = scan_directory(&self.root).await?;
        self.replace_index(records);
        // A later first use must not scan again
        let _ = self.index_ready.set(());
        Ok(())
    }

    fn replace_index(&self, records: Vec<(String, DiskIndexEntry)>) {
        let mut index = self.index.lock();
        index.records.clear();
        for (filename, entry) in records {
            index.upsert(filename, entry);
        }
    }

    /// Read the bytes stored for `key`. Failures are reported as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        if let Err(e) = self.ensure_index().await {
            warn!(root = ?self.root, error = %e, "Disk cache unavailable, treating as miss");
            return None;
        }

        let filename = key.to_filename();
        let path = self.root.join(&filename);
        let read = {
            let _guard = self.lock_for(&filename).read().await;
            fs::read(&path).await
        };

        match read {
            Ok(data) => {
                self.index.lock().mark_accessed(&filename);
                debug!(key = %key, size = data.len(), "Disk cache hit");
                Some(Bytes::from(data))
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::NotFound {
                    self.index.lock().records.remove(&filename);
                } else {
                    warn!(path = ?path, error = %e, "Failed to read cache data file");
                }
                self.get_from_search_paths(key, &filename).await
            }
        }
    }

    async fn get_from_search_paths(&self, key: &CacheKey, filename: &str) -> Option<Bytes> {
        let dirs = self.search_paths.read().clone();
        if dirs.is_empty() {
            return None;
        }

        let segment = last_path_segment(key);
        for dir in dirs {
            let candidates = std::iter::once(dir.join(filename))
                .chain(segment.as_ref().map(|segment| dir.join(segment)));
            for candidate in candidates {
                if let Ok(data) = fs::read(&candidate).await {
                    debug!(key = %key, path = ?candidate, "Found image in search path");
                    return Some(Bytes::from(data));
                }
            }
        }
        None
    }

    /// Store `data` under `key` without sidecar metadata.
    pub async fn set(&self, key: &CacheKey, data: &[u8]) -> Result<()> {
        self.store(key, data, None).await
    }

    /// Store `data` under `key`. The write is atomic to readers. An existing
    /// sidecar is replaced by `metadata`, or removed if `metadata` is None.
    pub async fn store(
        &self,
        key: &CacheKey,
        data: &[u8],
        metadata: Option<&SidecarMetadata>,
    ) -> Result<()> {
        self.ensure_index().await?;

        let filename = key.to_filename();
        let data_path = self.root.join(&filename);
        let meta_path = self.metadata_path(&filename);

        let metadata_json = metadata
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        {
            let _guard = self.lock_for(&filename).write().await;
            write_atomic(&data_path, data).await?;

            match metadata_json {
                Some(json) => {
                    if let Err(e) = write_atomic(&meta_path, &json).await {
                        // The data file is still valid without its sidecar
                        warn!(path = ?meta_path, error = %e, "Failed to write cache metadata file");
                    }
                }
                None => remove_if_exists(&meta_path).await?,
            }

            let now = SystemTime::now();
            self.index.lock().upsert(
                filename.clone(),
                DiskIndexEntry {
                    byte_size: data.len() as u64,
                    modified_at: now,
                    accessed_at: now,
                },
            );
        }

        debug!(key = %key, size = data.len(), "Stored entry in disk cache");

        if self.trim_on_write
            && self.max_cache_size > 0
            && self.total_size().await > self.max_cache_size
        {
            let report = self.trim_to_size(Some(&filename)).await;
            debug!(
                removed = report.removed_count,
                freed = report.freed_bytes,
                "Trimmed disk cache after write"
            );
        }

        Ok(())
    }

    /// Remove the entry for `key` and its sidecar.
    pub async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.ensure_index().await?;
        let filename = key.to_filename();
        self.remove_file_locked(&filename, None).await?;
        Ok(())
    }

    /// Remove `filename` under its stripe lock. When `expected_touch` is set,
    /// the file is left alone if it was written or read since it was picked.
    async fn remove_file_locked(
        &self,
        filename: &str,
        expected_touch: Option<u64>,
    ) -> io::Result<Option<u64>> {
        let _guard = self.lock_for(filename).write().await;

        if let Some(expected) = expected_touch {
            let current = self.index.lock().records.get(filename).map(|r| r.touch);
            if current != Some(expected) {
                return Ok(None);
            }
        }

        remove_if_exists(&self.root.join(filename)).await?;
        remove_if_exists(&self.metadata_path(filename)).await?;
        let removed = self.index.lock().records.remove(filename);
        Ok(removed.map(|r| r.entry.byte_size))
    }

    /// Remove every file the cache wrote. Other files in the root are left alone.
    pub async fn clear(&self) -> Result<()> {
        self.ensure_index().await?;

        let mut guards = Vec::with_capacity(self.locks.len());
        for lock in &self.locks {
            guards.push(lock.write().await);
        }

        let mut entries = fs::read_dir(&self.root).await?;
        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let owned = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_cache_filename);
            if !owned || entry.file_type().await?.is_dir() {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove cache file"),
            }
        }
        self.index.lock().records.clear();

        info!(root = ?self.root, removed, "Cleared disk cache");
        Ok(())
    }

    /// Two-pass cleanup: remove entries older than the maximum age and trim
    /// the remaining entries oldest-accessed first until the total size is
    /// within budget. Pass order follows the configured [`CleanupOrder`].
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        self.ensure_index().await?;

        let mut report = CleanupReport::default();
        let passes = match self.cleanup_order {
            CleanupOrder::AgeFirst => [true, false],
            CleanupOrder::SizeFirst => [false, true],
        };
        for age_pass in passes {
            let pass = if age_pass {
                self.remove_expired().await
            } else {
                self.trim_to_size(None).await
            };
            report.removed_count += pass.removed_count;
            report.freed_bytes += pass.freed_bytes;
        }

        info!(
            removed = report.removed_count,
            freed = report.freed_bytes,
            "Disk cache cleanup finished"
        );
        Ok(report)
    }

    async fn remove_expired(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let Some(max_age) = self.max_cache_age else {
            return report;
        };

        let now = SystemTime::now();
        let expired: Vec<(String, u64)> = self
            .index
            .lock()
            .records
            .iter()
            .filter(|(_, r)| {
                now.duration_since(r.entry.modified_at)
                    .unwrap_or_default()
                    > max_age
            })
            .map(|(name, r)| (name.clone(), r.touch))
            .collect();

        for (filename, touch) in expired {
            match self.remove_file_locked(&filename, Some(touch)).await {
                Ok(Some(size)) => report.record(size),
                Ok(None) => {}
                Err(e) => {
                    warn!(file = %filename, error = %e, "Failed to remove expired cache file")
                }
            }
        }
        report
    }

    /// Evict oldest-accessed entries until the total is within `max_cache_size`.
    /// `keep` is spared unless it alone exceeds the limit.
    async fn trim_to_size(&self, keep: Option<&str>) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.max_cache_size == 0 {
            return report;
        }

        let (mut total, candidates) = {
            let index = self.index.lock();
            (index.total_bytes(), index.by_access())
        };

        let mut deferred = None;
        for (filename, record) in candidates {
            if total <= self.max_cache_size {
                break;
            }
            if keep == Some(filename.as_str()) {
                deferred = Some((filename, record));
                continue;
            }
            match self.remove_file_locked(&filename, Some(record.touch)).await {
                Ok(Some(size)) => {
                    total = total.saturating_sub(size);
                    report.record(size);
                }
                Ok(None) => {}
                Err(e) => warn!(file = %filename, error = %e, "Failed to evict cache file"),
            }
        }

        // The kept entry alone exceeds the limit
        if let Some((filename, record)) = deferred.filter(|_| total > self.max_cache_size) {
            if let Ok(Some(size)) = self.remove_file_locked(&filename, Some(record.touch)).await {
                report.record(size);
            }
        }
        report
    }

    /// Total size of all indexed files in bytes.
    pub async fn total_size(&self) -> u64 {
        if self.ensure_index().await.is_err() {
            return 0;
        }
        self.index.lock().total_bytes()
    }

    pub async fn calculate_size(&self) -> CacheSize {
        if self.ensure_index().await.is_err() {
            return CacheSize::default();
        }
        let index = self.index.lock();
        CacheSize {
            file_count: index.records.len(),
            total_bytes: index.total_bytes(),
        }
    }

    /// Whether the index holds an entry for `key`. Never touches the file system.
    pub fn is_indexed(&self, key: &CacheKey) -> bool {
        self.index.lock().records.contains_key(&key.to_filename())
    }

    /// Whether bytes for `key` exist in the cache directory or a search path.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        if self.ensure_index().await.is_err() {
            return false;
        }
        let filename = key.to_filename();
        if self.index.lock().records.contains_key(&filename) {
            return true;
        }

        let dirs = self.search_paths.read().clone();
        let segment = last_path_segment(key);
        for dir in dirs {
            if fs::try_exists(dir.join(&filename)).await.unwrap_or(false) {
                return true;
            }
            if let Some(segment) = &segment {
                if fs::try_exists(dir.join(segment)).await.unwrap_or(false) {
                    return true;
                }
            }
        }
        false
    }

    /// Read the sidecar for `key`. A corrupt sidecar is removed.
    pub async fn read_metadata(&self, key: &CacheKey) -> Option<SidecarMetadata> {
        let filename = key.to_filename();
        let meta_path = self.metadata_path(&filename);

        let bytes = {
            let _guard = self.lock_for(&filename).read().await;
            fs::read(&meta_path).await.ok()?
        };

        match serde_json::from_slice(&bytes) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to parse cache metadata");
                let _guard = self.lock_for(&filename).write().await;
                let _ = fs::remove_file(&meta_path).await;
                None
            }
        }
    }

    /// Add a read-only directory consulted on a miss.
    pub fn add_search_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut paths = self.search_paths.write();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    pub fn remove_search_path(&self, path: &Path) {
        self.search_paths.write().retain(|p| p != path);
    }

    pub fn clear_search_paths(&self) {
        self.search_paths.write().clear();
    }

    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.search_paths.read().clone()
    }
}

/// Write to a temporary file then rename over the destination.
async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let temp_path = temp_path_for(path);

    if let Err(e) = fs::write(&temp_path, data).await {
        warn!(path = ?temp_path, error = %e, "Failed to write temporary cache file");
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_path, path).await {
        warn!(
            from = ?temp_path,
            to = ?path,
            error = %e,
            "Failed to rename temporary cache file"
        );
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(TEMP_EXTENSION);
    path.with_file_name(name)
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_data_filename(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Data files, sidecars and their temporary files.
fn is_cache_filename(name: &str) -> bool {
    let name = name.strip_suffix(".tmp").unwrap_or(name);
    let stem = name.strip_suffix(".meta").unwrap_or(name);
    is_data_filename(stem)
}

fn last_path_segment(key: &CacheKey) -> Option<String> {
    let url = Url::parse(key.as_str()).ok()?;
    url.path_segments()?
        .next_back()
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
}

/// Scan the cache directory, dropping leftovers of interrupted writes and
/// sidecars without a data file.
async fn scan_directory(root: &Path) -> io::Result<Vec<(String, DiskIndexEntry)>> {
    let mut entries = fs::read_dir(root).await?;
    let mut records = Vec::new();
    let mut sidecars = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            continue;
        };

        if !is_cache_filename(&name) {
            continue;
        }
        if name.ends_with(TEMP_EXTENSION) {
            debug!(path = ?path, "Removing leftover temporary cache file");
            let _ = fs::remove_file(&path).await;
            continue;
        }
        if let Some(stem) = name.strip_suffix(".meta") {
            sidecars.push(stem.to_owned());
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to stat cache file");
                continue;
            }
        };
        let modified_at = metadata.modified().unwrap_or_else(|_| SystemTime::now());
        records.push((
            name,
            DiskIndexEntry {
                byte_size: metadata.len(),
                modified_at,
                accessed_at: metadata.accessed().unwrap_or(modified_at),
            },
        ));
    }

    for stem in sidecars {
        if !records.iter().any(|(name, _)| *name == stem) {
            let _ = fs::remove_file(root.join(format!("{stem}.{META_EXTENSION}"))).await;
        }
    }

    Ok(records)
}
