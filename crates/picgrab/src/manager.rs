//! # Image Manager
//!
//! Resolves a URL through memory, disk and network. Concurrent loads of the
//! same key share one download: the first caller registers it, later callers
//! subscribe to it. A download is cancelled only when its last subscriber
//! cancels.
//!
//! Results arrive on the returned [`LoadHandle`]. A memory hit is placed on
//! the handle before `load` returns. A cancelled caller never receives
//! anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
    CacheEntry, CacheKey, CacheKeyFilter, ImageCache, SidecarMetadata, Validators, derive_key,
    parse_url,
};
use crate::config::{CacheConfig, DownloaderConfig};
use crate::decoder::{DecodedImage, ImageDecoder, StandardDecoder};
use crate::downloader::{
    DownloadCompletion, DownloadHandle, DownloadProgress, DownloadRequest, Downloader, FetchOutcome,
    ProgressSink,
};
use crate::error::{ImageError, Result};
use crate::options::{CacheType, LoadOptions};
use crate::token::OperationToken;

static SHARED: LazyLock<RwLock<Option<ImageManager>>> = LazyLock::new(|| RwLock::new(None));

/// A successfully loaded image.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub url: Url,
    pub key: CacheKey,
    pub image: DecodedImage,
    /// The encoded bytes the image was decoded from.
    pub data: Bytes,
    pub cache_type: CacheType,
}

pub type LoadResult = Result<LoadedImage>;

/// Receiving end of a load. Dropping it does not cancel the load.
#[derive(Debug)]
pub struct LoadHandle {
    token: OperationToken,
    rx: mpsc::UnboundedReceiver<LoadResult>,
}

impl LoadHandle {
    pub fn token(&self) -> &OperationToken {
        &self.token
    }

    /// Cancel this caller's interest. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the next result. Returns None once the load is finished or
    /// was cancelled. A second result only follows a revalidation that found
    /// a changed resource.
    pub async fn next(&mut self) -> Option<LoadResult> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            result = self.rx.recv() => result,
        }
    }

    /// A result that is already available, without waiting.
    pub fn try_next(&mut self) -> Option<LoadResult> {
        if self.token.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    id: u64,
    token: OperationToken,
    tx: mpsc::UnboundedSender<LoadResult>,
    progress: Option<ProgressSink>,
    /// Bytes already delivered from a cache hit, set while revalidating.
    cached_bytes: Option<Bytes>,
}

impl Subscriber {
    fn send(&self, result: LoadResult) {
        if !self.token.is_cancelled() {
            let _ = self.tx.send(result);
        }
    }
}

/// A download shared by every subscriber of one key.
struct InFlight {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    download: Mutex<Option<DownloadHandle>>,
    store_to_disk: AtomicBool,
}

impl InFlight {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            download: Mutex::new(None),
            store_to_disk: AtomicBool::new(false),
        }
    }

    fn add(&self, subscriber: Subscriber, memory_only: bool) {
        if !memory_only {
            self.store_to_disk.store(true, Ordering::Relaxed);
        }
        self.subscribers.lock().insert(subscriber.id, subscriber);
    }

    fn broadcast_progress(&self, progress: DownloadProgress) {
        let sinks: Vec<ProgressSink> = self
            .subscribers
            .lock()
            .values()
            .filter(|s| !s.token.is_cancelled())
            .filter_map(|s| s.progress.clone())
            .collect();
        for sink in sinks {
            sink(progress.clone());
        }
    }
}

/// What a finished download means for its subscribers.
enum Resolution {
    Loaded(LoadedImage),
    NotModified,
    Failed(ImageError),
}

struct ManagerInner {
    cache: Arc<ImageCache>,
    downloader: Downloader,
    decoder: Arc<dyn ImageDecoder>,
    cache_key_filter: RwLock<Option<CacheKeyFilter>>,
    in_flight: Mutex<HashMap<CacheKey, Arc<InFlight>>>,
    failed: Mutex<HashMap<CacheKey, ImageError>>,
    running: Mutex<HashMap<u64, OperationToken>>,
    next_id: AtomicU64,
}

/// Loads images through the cache tiers and the downloader.
#[derive(Clone)]
pub struct ImageManager {
    inner: Arc<ManagerInner>,
}

impl ImageManager {
    pub fn new(cache: Arc<ImageCache>, downloader: Downloader) -> Self {
        Self::with_decoder(cache, downloader, Arc::new(StandardDecoder))
    }

    pub fn with_decoder(
        cache: Arc<ImageCache>,
        downloader: Downloader,
        decoder: Arc<dyn ImageDecoder>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                cache,
                downloader,
                decoder,
                cache_key_filter: RwLock::new(None),
                in_flight: Mutex::new(HashMap::new()),
                failed: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Build a manager with its own cache and HTTP downloader.
    pub fn from_config(
        cache_config: CacheConfig,
        downloader_config: DownloaderConfig,
    ) -> Result<Self> {
        let cache = Arc::new(ImageCache::new(cache_config)?);
        let downloader = Downloader::new(downloader_config)?;
        Ok(Self::new(cache, downloader))
    }

    /// The process-wide default manager, built with default settings on
    /// first use.
    pub fn shared() -> Result<ImageManager> {
        if let Some(manager) = SHARED.read().as_ref() {
            return Ok(manager.clone());
        }
        let mut shared = SHARED.write();
        if let Some(manager) = shared.as_ref() {
            return Ok(manager.clone());
        }
        let manager = Self::from_config(CacheConfig::default(), DownloaderConfig::default())?;
        info!("Initialized shared image manager");
        *shared = Some(manager.clone());
        Ok(manager)
    }

    /// Install `manager` as the process-wide default.
    pub fn set_shared(manager: ImageManager) {
        *SHARED.write() = Some(manager);
    }

    /// Drop the process-wide default. The next `shared()` builds a new one.
    pub fn reset_shared() {
        SHARED.write().take();
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.inner.cache
    }

    pub fn downloader(&self) -> &Downloader {
        &self.inner.downloader
    }

    pub fn set_cache_key_filter(&self, filter: Option<CacheKeyFilter>) {
        *self.inner.cache_key_filter.write() = filter;
    }

    /// The cache key `url` resolves to.
    pub fn cache_key(&self, url: &str) -> Result<CacheKey> {
        self.inner.prepare(url).map(|(_, key)| key)
    }

    pub fn load(&self, url: &str, options: LoadOptions) -> LoadHandle {
        self.load_with_progress(url, options, None)
    }

    /// Load `url`, reporting download progress to `progress`.
    pub fn load_with_progress(
        &self,
        url: &str,
        options: LoadOptions,
        progress: Option<ProgressSink>,
    ) -> LoadHandle {
        let token = OperationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = LoadHandle {
            token: token.clone(),
            rx,
        };

        let prepared = options.validate().and_then(|_| self.inner.prepare(url));
        let (url, key) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!(url, error = %e, "Rejected load");
                let _ = tx.send(Err(e));
                token.complete();
                return handle;
            }
        };

        let mut subscriber = Subscriber {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            token,
            tx,
            progress,
            cached_bytes: None,
        };

        if !options.from_loader_only {
            if let Some((entry, image)) = self.inner.memory_hit(&key) {
                debug!(key = %key, "Memory cache hit");
                subscriber.send(Ok(LoadedImage {
                    url: url.clone(),
                    key: key.clone(),
                    image,
                    data: entry.encoded_bytes.clone(),
                    cache_type: CacheType::Memory,
                }));

                if options.refresh_cached {
                    subscriber.cached_bytes = Some(entry.encoded_bytes);
                    self.inner.track(&subscriber);
                    let inner = self.inner.clone();
                    tokio::spawn(
                        async move { inner.revalidate(url, key, options, subscriber).await },
                    );
                } else {
                    subscriber.token.complete();
                }
                return handle;
            }
        }

        self.inner.track(&subscriber);
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.resolve(url, key, options, subscriber, true).await });
        handle
    }

    /// Cancel every unfinished load.
    pub fn cancel_all(&self) {
        let tokens: Vec<_> = self.inner.running.lock().values().cloned().collect();
        info!(count = tokens.len(), "Cancelling all loads");
        for token in tokens {
            token.cancel();
        }
    }

    /// Whether any load is unfinished.
    pub fn is_running(&self) -> bool {
        !self.inner.running.lock().is_empty()
    }

    /// Keys that failed in this process and are not retried automatically.
    pub fn failed_keys(&self) -> Vec<CacheKey> {
        self.inner.failed.lock().keys().cloned().collect()
    }

    pub fn forget_failed(&self, key: &CacheKey) {
        self.inner.failed.lock().remove(key);
    }

    pub fn clear_failed(&self) {
        self.inner.failed.lock().clear();
    }
}

impl ManagerInner {
    fn prepare(&self, url: &str) -> Result<(Url, CacheKey)> {
        let url = parse_url(url)?;
        let key = derive_key(&url, self.cache_key_filter.read().as_ref())?;
        Ok((url, key))
    }

    fn memory_hit(&self, key: &CacheKey) -> Option<(CacheEntry, DecodedImage)> {
        let entry = self.cache.query_memory(key)?;
        let image = entry.decoded_image.clone()?;
        Some((entry, image))
    }

    fn track(self: &Arc<Self>, subscriber: &Subscriber) {
        let id = subscriber.id;
        self.running.lock().insert(id, subscriber.token.clone());
        let weak = Arc::downgrade(self);
        subscriber.token.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                inner.running.lock().remove(&id);
            }
        });
    }

    /// Deliver a final result, or nothing, and retire the subscriber.
    fn finish(&self, subscriber: Subscriber, result: Option<LoadResult>) {
        if let Some(result) = result {
            subscriber.send(result);
        }
        subscriber.token.complete();
        self.running.lock().remove(&subscriber.id);
    }

    async fn decode(&self, bytes: Bytes) -> Result<DecodedImage> {
        let decoder = self.decoder.clone();
        tokio::task::spawn_blocking(move || decoder.decode(&bytes))
            .await
            .map_err(|e| ImageError::Decode(format!("decoder task failed: {e}")))?
    }

    fn mark_failed(&self, key: &CacheKey, error: &ImageError) {
        if error.is_blacklistable() {
            debug!(key = %key, error = %error, "Recording failed key");
            self.failed.lock().insert(key.clone(), error.clone());
        }
    }

    /// Disk lookup, then network. With `recheck_disk`, a miss that raced with
    /// a finishing download of the same key looks at the disk once more.
    async fn resolve(
        self: Arc<Self>,
        url: Url,
        key: CacheKey,
        options: LoadOptions,
        mut subscriber: Subscriber,
        recheck_disk: bool,
    ) {
        if subscriber.token.is_cancelled() {
            return;
        }

        if !options.from_loader_only && !options.memory_only {
            if let Some(bytes) = self.cache.query_disk(&key).await {
                match self.decode(bytes.clone()).await {
                    Ok(image) => {
                        debug!(key = %key, "Disk cache hit");
                        self.cache.store_memory(CacheEntry::new(
                            key.clone(),
                            bytes.clone(),
                            Some(image.clone()),
                        ));
                        let loaded = LoadedImage {
                            url: url.clone(),
                            key: key.clone(),
                            image,
                            data: bytes.clone(),
                            cache_type: CacheType::Disk,
                        };

                        if options.refresh_cached {
                            subscriber.send(Ok(loaded));
                            subscriber.cached_bytes = Some(bytes);
                            self.revalidate(url, key, options, subscriber).await;
                        } else {
                            self.finish(subscriber, Some(Ok(loaded)));
                        }
                        return;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Discarding undecodable disk cache entry");
                        if let Err(e) = self.cache.remove(&key, true).await {
                            warn!(key = %key, error = %e, "Failed to remove disk cache entry");
                        }
                    }
                }
            }
        }

        if options.from_cache_only {
            debug!(key = %key, "Cache-only load missed");
            self.finish(subscriber, Some(Err(ImageError::NotCached(key.to_string()))));
            return;
        }

        self.start_or_attach(url, key, options, subscriber, None, recheck_disk);
    }

    /// Conditional refetch after a cache hit was already delivered.
    async fn revalidate(
        self: Arc<Self>,
        url: Url,
        key: CacheKey,
        options: LoadOptions,
        subscriber: Subscriber,
    ) {
        let validators = if options.memory_only {
            None
        } else {
            self.cache.validators(&key).await
        };
        debug!(key = %key, conditional = validators.is_some(), "Revalidating cached image");
        self.start_or_attach(url, key, options, subscriber, validators, false);
    }

    fn start_or_attach(
        self: &Arc<Self>,
        url: Url,
        key: CacheKey,
        options: LoadOptions,
        subscriber: Subscriber,
        validators: Option<Validators>,
        recheck_disk: bool,
    ) {
        enum Step {
            Attached(Arc<InFlight>),
            Started(Arc<InFlight>),
            Cached(Subscriber, CacheEntry, DecodedImage),
            OnDisk(Subscriber),
            Blocked(Subscriber, ImageError),
        }

        if subscriber.token.is_cancelled() {
            return;
        }
        let token = subscriber.token.clone();
        let subscriber_id = subscriber.id;
        let revalidating = subscriber.cached_bytes.is_some();

        let step = {
            let mut in_flight = self.in_flight.lock();
            if let Some(entry) = in_flight.get(&key) {
                entry.add(subscriber, options.memory_only);
                Step::Attached(entry.clone())
            } else if let Some((entry, image)) = (!options.from_loader_only && !revalidating)
                .then(|| self.memory_hit(&key))
                .flatten()
            {
                // A download of this key finished after the first lookup
                Step::Cached(subscriber, entry, image)
            } else if recheck_disk
                && !options.from_loader_only
                && !options.memory_only
                && self.cache.disk().is_indexed(&key)
            {
                // Stored to disk only, after the disk lookup missed
                Step::OnDisk(subscriber)
            } else if let Some(error) = (!options.retry_failed)
                .then(|| self.failed.lock().get(&key).cloned())
                .flatten()
            {
                Step::Blocked(subscriber, error)
            } else {
                let entry = Arc::new(InFlight::new());
                entry.add(subscriber, options.memory_only);
                in_flight.insert(key.clone(), entry.clone());
                Step::Started(entry)
            }
        };

        let entry = match step {
            Step::Attached(entry) => {
                debug!(key = %key, "Joined in-flight download");
                entry
            }
            Step::Cached(subscriber, entry, image) => {
                let loaded = LoadedImage {
                    url,
                    key,
                    image,
                    data: entry.encoded_bytes,
                    cache_type: CacheType::Memory,
                };
                self.finish(subscriber, Some(Ok(loaded)));
                return;
            }
            Step::OnDisk(subscriber) => {
                debug!(key = %key, "Entry reached the disk cache meanwhile");
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.resolve(url, key, options, subscriber, false).await
                });
                return;
            }
            Step::Blocked(subscriber, error) => {
                debug!(key = %key, "Skipping key that failed earlier");
                let result = (!revalidating).then(|| {
                    Err(ImageError::PreviouslyFailed {
                        key: key.to_string(),
                        source: Box::new(error),
                    })
                });
                self.finish(subscriber, result);
                return;
            }
            Step::Started(entry) => {
                if options.retry_failed {
                    self.failed.lock().remove(&key);
                }
                self.start_download(url, key.clone(), options, entry.clone(), validators);
                entry
            }
        };

        let weak_inner = Arc::downgrade(self);
        let weak_entry = Arc::downgrade(&entry);
        token.on_cancel(move || {
            if let (Some(inner), Some(entry)) = (weak_inner.upgrade(), weak_entry.upgrade()) {
                inner.unsubscribe(&key, &entry, subscriber_id);
            }
        });
    }

    fn start_download(
        self: &Arc<Self>,
        url: Url,
        key: CacheKey,
        options: LoadOptions,
        entry: Arc<InFlight>,
        validators: Option<Validators>,
    ) {
        let mut request =
            DownloadRequest::new(url.clone()).with_options(options.downloader_options());
        if let Some(validators) = validators {
            request = request.with_validators(validators);
        }

        let progress_entry = Arc::downgrade(&entry);
        let progress: ProgressSink = Arc::new(move |progress: DownloadProgress| {
            if let Some(entry) = progress_entry.upgrade() {
                entry.broadcast_progress(progress);
            }
        });

        let inner = Arc::clone(self);
        let completion_entry = entry.clone();
        let completion_key = key.clone();
        let handle = self.downloader.enqueue(
            request,
            Some(progress),
            Box::new(move |completion: DownloadCompletion| {
                tokio::spawn(async move {
                    inner
                        .finish_download(url, completion_key, completion_entry, completion)
                        .await
                });
            }),
        );

        debug!(key = %key, id = handle.id(), "Started download");
        *entry.download.lock() = Some(handle);
    }

    fn unsubscribe(&self, key: &CacheKey, entry: &Arc<InFlight>, subscriber_id: u64) {
        let abandoned = {
            let mut in_flight = self.in_flight.lock();
            let mut subscribers = entry.subscribers.lock();
            if subscribers.remove(&subscriber_id).is_none() || !subscribers.is_empty() {
                return;
            }
            if in_flight
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, entry))
            {
                in_flight.remove(key);
            }
            entry.download.lock().take()
        };

        if let Some(handle) = abandoned {
            debug!(key = %key, "Last subscriber left, cancelling download");
            handle.cancel();
        }
    }

    async fn finish_download(
        self: Arc<Self>,
        url: Url,
        key: CacheKey,
        entry: Arc<InFlight>,
        completion: DownloadCompletion,
    ) {
        let resolution = match completion.result {
            Ok(FetchOutcome::Body(body)) => match self.decode(body.bytes.clone()).await {
                Ok(image) => {
                    let to_disk = entry.store_to_disk.load(Ordering::Relaxed);
                    let metadata = SidecarMetadata {
                        key: key.to_string(),
                        validators: body.validators,
                        content_type: body.content_type,
                    };
                    let stored = self
                        .cache
                        .store(
                            &key,
                            body.bytes.clone(),
                            Some(image.clone()),
                            to_disk,
                            Some(&metadata),
                        )
                        .await;
                    if let Err(e) = stored {
                        warn!(key = %key, error = %e, "Disk cache write failed");
                    }
                    self.failed.lock().remove(&key);
                    Resolution::Loaded(LoadedImage {
                        url: url.clone(),
                        key: key.clone(),
                        image,
                        data: body.bytes,
                        cache_type: CacheType::None,
                    })
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Downloaded image failed to decode");
                    self.mark_failed(&key, &e);
                    Resolution::Failed(e)
                }
            },
            Ok(FetchOutcome::NotModified) => Resolution::NotModified,
            Err(e) => {
                self.mark_failed(&key, &e);
                Resolution::Failed(e)
            }
        };

        let subscribers: Vec<Subscriber> = {
            let mut in_flight = self.in_flight.lock();
            if in_flight
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &entry))
            {
                in_flight.remove(&key);
            }
            entry.download.lock().take();
            let mut subscribers = entry.subscribers.lock();
            let drained = subscribers.drain().map(|(_, s)| s).collect();
            drained
        };

        debug!(key = %key, subscribers = subscribers.len(), "Fanning out download result");
        for subscriber in subscribers {
            let revalidating = subscriber.cached_bytes.is_some();
            match &resolution {
                Resolution::Loaded(loaded) => {
                    let unchanged = subscriber.cached_bytes.as_ref() == Some(&loaded.data);
                    let result = (!unchanged).then(|| Ok(loaded.clone()));
                    self.finish(subscriber, result);
                }
                Resolution::NotModified if revalidating => self.finish(subscriber, None),
                Resolution::NotModified => {
                    let result = self.cached_result(&url, &key).await;
                    self.finish(subscriber, Some(result));
                }
                Resolution::Failed(e) if revalidating => {
                    debug!(key = %key, error = %e, "Revalidation failed, keeping cached image");
                    self.finish(subscriber, None);
                }
                Resolution::Failed(e) => self.finish(subscriber, Some(Err(e.clone()))),
            }
        }
    }

    /// Serve a "not modified" answer to a caller that had no cached copy.
    async fn cached_result(&self, url: &Url, key: &CacheKey) -> LoadResult {
        let (entry, cache_type) = self
            .cache
            .query(key, false)
            .await
            .ok_or_else(|| ImageError::NotCached(key.to_string()))?;
        let image = match entry.decoded_image {
            Some(image) => image,
            None => self.decode(entry.encoded_bytes.clone()).await?,
        };
        Ok(LoadedImage {
            url: url.clone(),
            key: key.clone(),
            image,
            data: entry.encoded_bytes,
            cache_type,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::downloader::tests::{MockTransport, body};
    use crate::downloader::Transport;
    use image::DynamicImage;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    pub(crate) fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    }

    /// Decodes anything except bytes starting with "bad" into a 1x1 image.
    #[derive(Default)]
    pub(crate) struct StubDecoder {
        calls: AtomicUsize,
    }

    impl ImageDecoder for StubDecoder {
        fn decode(&self, data: &[u8]) -> Result<DecodedImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if data.starts_with(b"bad") {
                return Err(ImageError::Decode("stub refuses".into()));
            }
            Ok(DecodedImage::new(DynamicImage::new_rgba8(1, 1), None))
        }
    }

    pub(crate) struct Fixture {
        pub(crate) manager: ImageManager,
        pub(crate) transport: Arc<MockTransport>,
        _dir: TempDir,
    }

    pub(crate) fn fixture_with(
        transport: MockTransport,
        configure: impl FnOnce(&mut CacheConfig),
    ) -> Fixture {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut cache_config = CacheConfig {
            disk_cache_path: Some(dir.path().to_path_buf()),
            ..CacheConfig::default()
        };
        configure(&mut cache_config);

        let transport = Arc::new(transport);
        let downloader = Downloader::with_transport(
            DownloaderConfig::default(),
            transport.clone() as Arc<dyn Transport>,
        )
        .unwrap();
        let cache = Arc::new(ImageCache::new(cache_config).unwrap());
        let manager =
            ImageManager::with_decoder(cache, downloader, Arc::new(StubDecoder::default()));
        Fixture {
            manager,
            transport,
            _dir: dir,
        }
    }

    pub(crate) fn fixture(delay: Duration) -> Fixture {
        fixture_with(MockTransport::new(delay), |_| {})
    }

    pub(crate) async fn wait_for_fetch(transport: &MockTransport) {
        while transport.active.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for_subscribers(manager: &ImageManager, url: &str, count: usize) {
        let key = manager.cache_key(url).unwrap();
        loop {
            let attached = manager
                .inner
                .in_flight
                .lock()
                .get(&key)
                .map(|entry| entry.subscribers.lock().len());
            if attached == Some(count) {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    const URL: &str = "https://x/img.png";

    #[tokio::test]
    async fn test_concurrent_loads_share_one_download() {
        let f = fixture(Duration::from_millis(50));

        let mut first = f.manager.load(URL, LoadOptions::default());
        let mut second = f.manager.load(URL, LoadOptions::default());
        let a = first.next().await.unwrap().unwrap();
        let b = second.next().await.unwrap().unwrap();

        assert_eq!(f.transport.calls(), 1);
        assert_eq!(a.cache_type, CacheType::None);
        assert_eq!(b.cache_type, CacheType::None);
        assert!(a.image.ptr_eq(&b.image));
        assert_eq!(a.data, b.data);
    }

    #[tokio::test]
    async fn test_many_concurrent_callers_one_fetch() {
        let f = fixture(Duration::from_millis(20));

        let handles: Vec<_> = (0..10)
            .map(|_| f.manager.load(URL, LoadOptions::default()))
            .collect();
        for mut handle in handles {
            assert!(handle.next().await.unwrap().is_ok());
        }
        assert_eq!(f.transport.calls(), 1);
        assert!(!f.manager.is_running());
    }

    #[tokio::test]
    async fn test_memory_hit_is_synchronous() {
        let f = fixture(Duration::ZERO);
        f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap();

        let mut handle = f.manager.load(URL, LoadOptions::default());
        let hit = handle.try_next().unwrap().unwrap();
        assert_eq!(hit.cache_type, CacheType::Memory);
        assert!(handle.next().await.is_none());
        assert_eq!(f.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_disk_hit_repopulates_memory() {
        let f = fixture(Duration::ZERO);
        f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap();
        f.manager.cache().clear_memory();

        let hit = f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap();
        assert_eq!(hit.cache_type, CacheType::Disk);
        assert_eq!(hit.data.as_ref(), URL.as_bytes());

        let again = f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap();
        assert_eq!(again.cache_type, CacheType::Memory);
        assert_eq!(f.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_memory_only_skips_disk() {
        let f = fixture(Duration::ZERO);
        let options = LoadOptions {
            memory_only: true,
            ..LoadOptions::default()
        };
        f.manager.load(URL, options).next().await.unwrap().unwrap();

        let key = f.manager.cache_key(URL).unwrap();
        assert!(!f.manager.cache().disk_image_exists(&key).await);
        assert!(f.manager.cache().query_memory(&key).is_some());
    }

    #[tokio::test]
    async fn test_cancel_before_start_delivers_nothing() {
        let gate = Arc::new(Notify::new());
        let f = fixture_with(MockTransport::gated(gate.clone()), |_| {});

        let progress_calls = Arc::new(AtomicUsize::new(0));
        let counter = progress_calls.clone();
        let progress: ProgressSink = Arc::new(move |_: DownloadProgress| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut handle = f
            .manager
            .load_with_progress(URL, LoadOptions::default(), Some(progress));
        handle.cancel();
        handle.cancel();

        gate.notify_waiters();
        assert!(handle.next().await.is_none());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(progress_calls.load(Ordering::SeqCst), 0);
        assert!(!f.manager.is_running());
    }

    #[tokio::test]
    async fn test_one_subscriber_cancelling_keeps_download() {
        let gate = Arc::new(Notify::new());
        let f = fixture_with(MockTransport::gated(gate.clone()), |_| {});

        let leaving = f.manager.load(URL, LoadOptions::default());
        let mut staying = f.manager.load(URL, LoadOptions::default());
        wait_for_subscribers(&f.manager, URL, 2).await;
        wait_for_fetch(&f.transport).await;

        leaving.cancel();
        gate.notify_one();

        let loaded = staying.next().await.unwrap().unwrap();
        assert_eq!(loaded.cache_type, CacheType::None);
        assert_eq!(f.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_last_subscriber_cancelling_cancels_download() {
        let gate = Arc::new(Notify::new());
        let f = fixture_with(MockTransport::gated(gate), |_| {});
        let mut events = f.manager.downloader().subscribe();

        let mut a = f.manager.load(URL, LoadOptions::default());
        let mut b = f.manager.load(URL, LoadOptions::default());
        wait_for_subscribers(&f.manager, URL, 2).await;
        wait_for_fetch(&f.transport).await;

        a.cancel();
        b.cancel();
        assert!(a.next().await.is_none());
        assert!(b.next().await.is_none());

        loop {
            match events.recv().await.unwrap() {
                crate::downloader::DownloadEvent::Cancelled { .. } => break,
                _ => continue,
            }
        }
        assert_eq!(f.manager.downloader().current_download_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_key_is_not_retried() {
        let f = fixture(Duration::ZERO);
        f.transport.respond(
            URL,
            Err(ImageError::Status {
                status: reqwest::StatusCode::NOT_FOUND,
                url: URL.into(),
            }),
        );

        let err = f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap_err();
        assert!(matches!(err, ImageError::Status { .. }));
        assert_eq!(f.manager.failed_keys().len(), 1);

        let err = f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap_err();
        assert!(matches!(err, ImageError::PreviouslyFailed { .. }));
        assert_eq!(f.transport.calls(), 1);

        f.transport.respond(URL, Ok(body("recovered")));
        let retry = LoadOptions {
            retry_failed: true,
            ..LoadOptions::default()
        };
        let loaded = f.manager.load(URL, retry).next().await.unwrap().unwrap();
        assert_eq!(loaded.data.as_ref(), b"recovered");
        assert_eq!(f.transport.calls(), 2);
        assert!(f.manager.failed_keys().is_empty());
    }

    #[tokio::test]
    async fn test_decode_failure_is_reported_and_recorded() {
        let f = fixture(Duration::ZERO);
        f.transport.respond(URL, Ok(body("bad bytes")));

        let err = f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Decode);

        let key = f.manager.cache_key(URL).unwrap();
        assert!(!f.manager.cache().disk_image_exists(&key).await);
        f.manager.forget_failed(&key);
        assert!(f.manager.failed_keys().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_not_recorded() {
        let f = fixture(Duration::ZERO);
        f.transport
            .respond(URL, Err(ImageError::Timeout(Duration::from_secs(15))));

        let err = f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap_err();
        assert!(matches!(err, ImageError::Timeout(_)));
        assert!(f.manager.failed_keys().is_empty());
    }

    #[tokio::test]
    async fn test_cache_only_miss() {
        let f = fixture(Duration::ZERO);
        let options = LoadOptions {
            from_cache_only: true,
            ..LoadOptions::default()
        };
        let err = f.manager.load(URL, options).next().await.unwrap().unwrap_err();
        assert!(matches!(err, ImageError::NotCached(_)));
        assert_eq!(f.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_loader_only_bypasses_cache() {
        let f = fixture(Duration::ZERO);
        f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap();

        let options = LoadOptions {
            from_loader_only: true,
            ..LoadOptions::default()
        };
        let loaded = f.manager.load(URL, options).next().await.unwrap().unwrap();
        assert_eq!(loaded.cache_type, CacheType::None);
        assert_eq!(f.transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_unchanged_notifies_once() {
        let f = fixture(Duration::ZERO);
        f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap();

        let options = LoadOptions {
            refresh_cached: true,
            ..LoadOptions::default()
        };
        let mut handle = f.manager.load(URL, options);
        let first = handle.next().await.unwrap().unwrap();
        assert_eq!(first.cache_type, CacheType::Memory);
        assert!(handle.next().await.is_none());
        assert_eq!(f.transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_changed_notifies_twice() {
        let f = fixture(Duration::ZERO);
        f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap();
        f.transport.respond(URL, Ok(body("v2")));

        let options = LoadOptions {
            refresh_cached: true,
            ..LoadOptions::default()
        };
        let mut handle = f.manager.load(URL, options);
        assert_eq!(handle.next().await.unwrap().unwrap().cache_type, CacheType::Memory);

        let second = handle.next().await.unwrap().unwrap();
        assert_eq!(second.cache_type, CacheType::None);
        assert_eq!(second.data.as_ref(), b"v2");

        let key = f.manager.cache_key(URL).unwrap();
        let entry = f.manager.cache().query_memory(&key).unwrap();
        assert_eq!(entry.encoded_bytes.as_ref(), b"v2");
    }

    #[tokio::test]
    async fn test_refresh_after_disk_hit() {
        let f = fixture(Duration::ZERO);
        f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap();
        f.manager.cache().clear_memory();
        f.transport.respond(URL, Ok(body("v2")));

        let options = LoadOptions {
            refresh_cached: true,
            ..LoadOptions::default()
        };
        let mut handle = f.manager.load(URL, options);
        let first = handle.next().await.unwrap().unwrap();
        assert_eq!(first.cache_type, CacheType::Disk);
        assert_eq!(first.data.as_ref(), URL.as_bytes());

        let second = handle.next().await.unwrap().unwrap();
        assert_eq!(second.cache_type, CacheType::None);
        assert_eq!(second.data.as_ref(), b"v2");
        assert!(handle.next().await.is_none());

        let key = f.manager.cache_key(URL).unwrap();
        let on_disk = f.manager.cache().query_disk(&key).await.unwrap();
        assert_eq!(on_disk.as_ref(), b"v2");
        assert_eq!(f.transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_disk_only_store_racing_a_miss_is_not_refetched() {
        let f = fixture_with(MockTransport::new(Duration::ZERO), |c| c.cache_in_memory = false);
        f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap();
        assert_eq!(f.transport.calls(), 1);

        // A caller whose disk lookup missed just before the first download
        // was stored reaches the registry after that download is gone.
        let (url, key) = f.manager.inner.prepare(URL).unwrap();
        assert!(f.manager.cache().query_memory(&key).is_none());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber {
            id: 1000,
            token: OperationToken::new(),
            tx,
            progress: None,
            cached_bytes: None,
        };
        f.manager
            .inner
            .start_or_attach(url, key, LoadOptions::default(), subscriber, None, true);

        let loaded = rx.recv().await.unwrap().unwrap();
        assert_eq!(loaded.cache_type, CacheType::Disk);
        assert_eq!(f.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_not_modified_is_silent() {
        let f = fixture(Duration::ZERO);
        f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap();
        f.transport.respond(URL, Ok(FetchOutcome::NotModified));

        let options = LoadOptions {
            refresh_cached: true,
            ..LoadOptions::default()
        };
        let mut handle = f.manager.load(URL, options);
        assert!(handle.next().await.unwrap().is_ok());
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn test_disk_failure_degrades_to_memory() {
        let blocker = TempDir::new().unwrap();
        let file = blocker.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let f = fixture_with(MockTransport::new(Duration::ZERO), |c| {
            c.disk_cache_path = Some(file.join("cache"));
        });

        let loaded = f.manager.load(URL, LoadOptions::default()).next().await.unwrap().unwrap();
        assert_eq!(loaded.cache_type, CacheType::None);

        let again = f.manager.load(URL, LoadOptions::default()).try_next().unwrap().unwrap();
        assert_eq!(again.cache_type, CacheType::Memory);
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let f = fixture(Duration::ZERO);

        let err = f
            .manager
            .load("not a url", LoadOptions::default())
            .try_next()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ImageError::InvalidUrl(_)));

        let conflicting = LoadOptions {
            low_priority: true,
            high_priority: true,
            ..LoadOptions::default()
        };
        let err = f.manager.load(URL, conflicting).try_next().unwrap().unwrap_err();
        assert!(matches!(err, ImageError::Config(_)));

        f.manager
            .set_cache_key_filter(Some(Arc::new(|_url: &Url| String::new())));
        let err = f.manager.load(URL, LoadOptions::default()).try_next().unwrap().unwrap_err();
        assert!(matches!(err, ImageError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_key_filter_coalesces_variants() {
        let f = fixture(Duration::from_millis(30));
        f.manager.set_cache_key_filter(Some(Arc::new(|url: &Url| {
            let mut url = url.clone();
            url.set_query(None);
            url.to_string()
        })));

        let mut a = f.manager.load("https://x/img.png?sig=1", LoadOptions::default());
        let mut b = f.manager.load("https://x/img.png?sig=2", LoadOptions::default());
        assert!(a.next().await.unwrap().is_ok());
        assert!(b.next().await.unwrap().is_ok());
        assert_eq!(f.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_and_is_running() {
        let gate = Arc::new(Notify::new());
        let f = fixture_with(MockTransport::gated(gate), |_| {});

        let mut a = f.manager.load("https://x/a.png", LoadOptions::default());
        let mut b = f.manager.load("https://x/b.png", LoadOptions::default());
        wait_for_fetch(&f.transport).await;
        assert!(f.manager.is_running());

        f.manager.cancel_all();
        assert!(!f.manager.is_running());
        assert!(a.next().await.is_none());
        assert!(b.next().await.is_none());
    }

    #[tokio::test]
    async fn test_progress_reaches_every_subscriber() {
        let f = fixture(Duration::from_millis(20));
        let counts: Vec<Arc<AtomicUsize>> = (0..2).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        let mut handles = Vec::new();
        for count in &counts {
            let count = count.clone();
            let progress: ProgressSink = Arc::new(move |_: DownloadProgress| {
                count.fetch_add(1, Ordering::SeqCst);
            });
            handles.push(
                f.manager
                    .load_with_progress(URL, LoadOptions::default(), Some(progress)),
            );
        }
        for handle in &mut handles {
            handle.next().await.unwrap().unwrap();
        }

        for count in counts {
            assert_eq!(count.load(Ordering::SeqCst), 2);
        }
    }

    #[tokio::test]
    async fn test_shared_instance_lifecycle() {
        let f = fixture(Duration::ZERO);
        ImageManager::set_shared(f.manager.clone());
        let shared = ImageManager::shared().unwrap();
        assert!(Arc::ptr_eq(shared.cache(), f.manager.cache()));

        ImageManager::reset_shared();
        let fresh = ImageManager::shared().unwrap();
        assert!(!Arc::ptr_eq(fresh.cache(), f.manager.cache()));
        ImageManager::reset_shared();
    }
}
