//! # Prefetcher
//!
//! Warms the cache for a batch of URLs through an [`ImageManager`], running
//! at most `max_concurrent_prefetches` loads at a time. Starting a new batch
//! cancels the one still running.
//!
//! Accounting: a successful load counts as finished, a failed load as both
//! finished and skipped, and a key cancelled before or during its load as
//! skipped. The report is delivered exactly once per batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::config::PrefetcherConfig;
use crate::error::{ImageError, Result};
use crate::manager::ImageManager;
use crate::options::{CacheType, LoadOptions};
use crate::token::OperationToken;

static SHARED: LazyLock<RwLock<Option<Prefetcher>>> = LazyLock::new(|| RwLock::new(None));

/// Called with `(finished, total)` after each key resolves.
pub type PrefetchProgress = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Final tally of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub total: usize,
    pub finished: usize,
    pub skipped: usize,
}

/// Handle of a running batch.
#[derive(Debug)]
pub struct PrefetchHandle {
    token: OperationToken,
    total: usize,
    report: oneshot::Receiver<PrefetchReport>,
}

impl PrefetchHandle {
    pub fn token(&self) -> &OperationToken {
        &self.token
    }

    /// Cancel every key not yet finished. Already counted keys stay counted.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the batch report.
    pub async fn finished(self) -> PrefetchReport {
        self.report.await.unwrap_or(PrefetchReport {
            total: self.total,
            finished: 0,
            skipped: self.total,
        })
    }
}

enum Outcome {
    Loaded(CacheType),
    Failed(ImageError),
    Skipped,
}

struct PrefetcherInner {
    manager: ImageManager,
    config: RwLock<PrefetcherConfig>,
    current: Mutex<Option<(u64, OperationToken)>>,
    next_job: AtomicU64,
}

/// Batch cache warmer
#[derive(Clone)]
pub struct Prefetcher {
    inner: Arc<PrefetcherInner>,
}

impl Prefetcher {
    pub fn new(manager: ImageManager) -> Self {
        Self::build(manager, PrefetcherConfig::default())
    }

    pub fn with_config(manager: ImageManager, config: PrefetcherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(manager, config))
    }

    fn build(manager: ImageManager, config: PrefetcherConfig) -> Self {
        Self {
            inner: Arc::new(PrefetcherInner {
                manager,
                config: RwLock::new(config),
                current: Mutex::new(None),
                next_job: AtomicU64::new(1),
            }),
        }
    }

    /// The process-wide default prefetcher, backed by [`ImageManager::shared`].
    pub fn shared() -> Result<Prefetcher> {
        if let Some(prefetcher) = SHARED.read().as_ref() {
            return Ok(prefetcher.clone());
        }
        let manager = ImageManager::shared()?;
        let mut shared = SHARED.write();
        let prefetcher = shared.get_or_insert_with(|| Prefetcher::new(manager));
        Ok(prefetcher.clone())
    }

    pub fn set_shared(prefetcher: Prefetcher) {
        *SHARED.write() = Some(prefetcher);
    }

    pub fn reset_shared() {
        SHARED.write().take();
    }

    pub fn manager(&self) -> &ImageManager {
        &self.inner.manager
    }

    pub fn config(&self) -> PrefetcherConfig {
        *self.inner.config.read()
    }

    /// Replace the configuration used by later batches.
    pub fn set_config(&self, config: PrefetcherConfig) -> Result<()> {
        config.validate()?;
        *self.inner.config.write() = config;
        Ok(())
    }

    pub fn prefetch<I, S>(&self, urls: I) -> PrefetchHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefetch_with_progress(urls, None)
    }

    /// Start a batch, cancelling the one still running.
    pub fn prefetch_with_progress<I, S>(
        &self,
        urls: I,
        progress: Option<PrefetchProgress>,
    ) -> PrefetchHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let urls: Vec<String> = urls.into_iter().map(Into::into).collect();
        let total = urls.len();
        let token = OperationToken::new();
        let (tx, rx) = oneshot::channel();

        let job_id = self.inner.next_job.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .inner
            .current
            .lock()
            .replace((job_id, token.clone()));
        if let Some((previous_id, previous)) = previous {
            debug!(job = previous_id, "Cancelling previous prefetch");
            previous.cancel();
        }

        let config = self.config();
        info!(job = job_id, total, "Prefetch started");
        let inner = self.inner.clone();
        let job_token = token.clone();
        tokio::spawn(async move {
            let report = inner
                .run(urls, config, job_token.clone(), progress)
                .await;
            job_token.complete();
            {
                let mut current = inner.current.lock();
                if current.as_ref().is_some_and(|(id, _)| *id == job_id) {
                    current.take();
                }
            }
            info!(
                job = job_id,
                finished = report.finished,
                skipped = report.skipped,
                "Prefetch finished"
            );
            let _ = tx.send(report);
        });

        PrefetchHandle {
            token,
            total,
            report: rx,
        }
    }

    /// Cancel the running batch, if any.
    pub fn cancel_prefetching(&self) {
        let current = self.inner.current.lock().take();
        if let Some((_, token)) = current {
            token.cancel();
        }
    }
}

impl PrefetcherInner {
    async fn run(
        &self,
        urls: Vec<String>,
        config: PrefetcherConfig,
        job: OperationToken,
        progress: Option<PrefetchProgress>,
    ) -> PrefetchReport {
        let mut report = PrefetchReport {
            total: urls.len(),
            ..PrefetchReport::default()
        };
        let mut pending = urls.into_iter();
        let mut in_progress = FuturesUnordered::new();

        loop {
            while in_progress.len() < config.max_concurrent_prefetches && !job.is_cancelled() {
                let Some(url) = pending.next() else {
                    break;
                };
                in_progress.push(prefetch_one(
                    self.manager.clone(),
                    url,
                    config.options,
                    job.clone(),
                ));
            }

            let Some(outcome) = in_progress.next().await else {
                break;
            };
            match outcome {
                Outcome::Loaded(cache_type) => {
                    debug!(?cache_type, "Prefetched key");
                    report.finished += 1;
                }
                Outcome::Failed(e) => {
                    debug!(error = %e, "Prefetch of key failed");
                    report.finished += 1;
                    report.skipped += 1;
                }
                Outcome::Skipped => report.skipped += 1,
            }
            if let Some(progress) = &progress {
                progress(report.finished, report.total);
            }
        }

        // Never started because the job was cancelled
        report.skipped += pending.count();
        report
    }
}

async fn prefetch_one(
    manager: ImageManager,
    url: String,
    options: LoadOptions,
    job: OperationToken,
) -> Outcome {
    if job.is_cancelled() {
        return Outcome::Skipped;
    }
    let mut handle = manager.load(&url, options);
    tokio::select! {
        biased;
        _ = job.cancelled() => {
            handle.cancel();
            Outcome::Skipped
        }
        result = handle.next() => match result {
            Some(Ok(loaded)) => Outcome::Loaded(loaded.cache_type),
            Some(Err(e)) => Outcome::Failed(e),
            None => Outcome::Skipped,
        },
    }
}
