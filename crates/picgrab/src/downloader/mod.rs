//! # Downloader
//!
//! Concurrency-limited fetcher. Tasks wait in three priority classes and are
//! started, up to `max_concurrent_downloads` at a time, in the configured
//! execution order. Changing the order only affects tasks not yet started.
//!
//! Every task reports progress zero or more times and completes exactly once,
//! except when cancelled while still queued: such a task is dropped silently.
//! Methods that start work spawn onto the current Tokio runtime.

mod task;
mod transport;

pub use task::{
    CompletionSink, DownloadCompletion, DownloadHandle, DownloadProgress, DownloadRequest,
    FetchOutcome, FetchedBody, ProgressSink, TaskState,
};
pub use transport::{FetchProgress, FetchRequest, HttpTransport, Transport, create_client};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DownloaderConfig;
use crate::error::{ImageError, Result};
use crate::options::{ExecutionOrder, Priority};
use task::DownloadTask;

/// Rewrites the headers of each request just before it is sent.
pub type HeadersFilter = Arc<dyn Fn(&Url, &HeaderMap) -> HeaderMap + Send + Sync>;

const EVENT_CAPACITY: usize = 64;

/// Hands out copies of a progressive download's prefix. A copy is taken when
/// the body has at least doubled since the previous one or is complete, so the
/// bytes copied stay linear in the body size.
#[derive(Default)]
struct PrefixSnapshots {
    last_len: AtomicUsize,
}

impl PrefixSnapshots {
    fn take(&self, received: &[u8], expected: Option<u64>) -> Option<Bytes> {
        let len = received.len();
        let last = self.last_len.load(Ordering::Relaxed);
        let complete = expected == Some(len as u64);
        if len <= last || (len < last.saturating_mul(2) && !complete) {
            return None;
        }
        self.last_len.store(len, Ordering::Relaxed);
        Some(Bytes::copy_from_slice(received))
    }
}

/// Lifecycle notifications published by a [`Downloader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Started { id: u64, url: Url },
    Finished { id: u64, url: Url, success: bool },
    Cancelled { id: u64, url: Url },
}

struct SchedulerState {
    high: VecDeque<Arc<DownloadTask>>,
    normal: VecDeque<Arc<DownloadTask>>,
    low: VecDeque<Arc<DownloadTask>>,
    executing: HashMap<u64, Arc<DownloadTask>>,
    max_concurrent: usize,
    order: ExecutionOrder,
    suspended: bool,
}

impl SchedulerState {
    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<Arc<DownloadTask>> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn queued_len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn pop_next(&mut self) -> Option<Arc<DownloadTask>> {
        let order = self.order;
        [&mut self.high, &mut self.normal, &mut self.low]
            .into_iter()
            .find(|queue| !queue.is_empty())
            .and_then(|queue| match order {
                ExecutionOrder::Fifo => queue.pop_front(),
                ExecutionOrder::Lifo => queue.pop_back(),
            })
    }

    fn remove_queued(&mut self, id: u64) -> Option<Arc<DownloadTask>> {
        for queue in [&mut self.high, &mut self.normal, &mut self.low] {
            if let Some(position) = queue.iter().position(|task| task.id == id) {
                return queue.remove(position);
            }
        }
        None
    }
}

struct DownloaderInner {
    transport: Arc<dyn Transport>,
    state: Mutex<SchedulerState>,
    headers: RwLock<HeaderMap>,
    headers_filter: RwLock<Option<HeadersFilter>>,
    timeout: Duration,
    events: broadcast::Sender<DownloadEvent>,
    next_id: AtomicU64,
}

/// Concurrency-limited image downloader. Cloning shares the same queue.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

impl Downloader {
    /// Create a downloader fetching over HTTP.
    pub fn new(config: DownloaderConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::with_transport(config, transport)
    }

    /// Create a downloader over a custom transport.
    pub fn with_transport(config: DownloaderConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            max_concurrent = config.max_concurrent_downloads,
            order = ?config.execution_order,
            "Downloader created"
        );

        Ok(Self {
            inner: Arc::new(DownloaderInner {
                transport,
                state: Mutex::new(SchedulerState {
                    high: VecDeque::new(),
                    normal: VecDeque::new(),
                    low: VecDeque::new(),
                    executing: HashMap::new(),
                    max_concurrent: config.max_concurrent_downloads,
                    order: config.execution_order,
                    suspended: false,
                }),
                headers: RwLock::new(config.headers),
                headers_filter: RwLock::new(None),
                timeout: config.download_timeout,
                events,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Queue a download. `completion` is invoked exactly once unless the task
    /// is cancelled before it starts.
    pub fn enqueue(
        &self,
        request: DownloadRequest,
        progress: Option<ProgressSink>,
        completion: CompletionSink,
    ) -> DownloadHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let priority = request.options.priority;
        let task = Arc::new(DownloadTask::new(id, request, progress, completion));
        let handle = DownloadHandle {
            id,
            token: task.token.clone(),
        };

        let weak: Weak<DownloaderInner> = Arc::downgrade(&self.inner);
        task.token.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                inner.cancel_queued(id);
            }
        });

        debug!(id, url = %task.request.url, ?priority, "Download queued");
        self.inner.state.lock().queue_mut(priority).push_back(task);
        self.inner.pump();
        handle
    }

    /// Cancel a download by handle. Idempotent.
    pub fn cancel(&self, handle: &DownloadHandle) {
        handle.cancel();
    }

    /// Cancel every queued and executing download.
    pub fn cancel_all(&self) {
        let tokens: Vec<_> = {
            let state = self.inner.state.lock();
            state
                .high
                .iter()
                .chain(state.normal.iter())
                .chain(state.low.iter())
                .chain(state.executing.values())
                .map(|task| task.token.clone())
                .collect()
        };
        info!(count = tokens.len(), "Cancelling all downloads");
        for token in tokens {
            token.cancel();
        }
    }

    pub fn set_max_concurrency(&self, max_concurrent: usize) -> Result<()> {
        if max_concurrent == 0 {
            return Err(ImageError::Config(
                "max_concurrent_downloads must be greater than zero".into(),
            ));
        }
        self.inner.state.lock().max_concurrent = max_concurrent;
        self.inner.pump();
        Ok(())
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.state.lock().max_concurrent
    }

    pub fn set_execution_order(&self, order: ExecutionOrder) {
        self.inner.state.lock().order = order;
    }

    pub fn execution_order(&self) -> ExecutionOrder {
        self.inner.state.lock().order
    }

    /// While suspended, tasks are queued but none are started.
    pub fn set_suspended(&self, suspended: bool) {
        self.inner.state.lock().suspended = suspended;
        if !suspended {
            self.inner.pump();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspended
    }

    /// Queued plus executing tasks.
    pub fn current_download_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.queued_len() + state.executing.len()
    }

    /// Set or, with `None`, remove a header sent with every request.
    pub fn set_header(&self, name: HeaderName, value: Option<HeaderValue>) {
        let mut headers = self.inner.headers.write();
        match value {
            Some(value) => {
                headers.insert(name, value);
            }
            None => {
                headers.remove(name);
            }
        }
    }

    pub fn header(&self, name: &HeaderName) -> Option<HeaderValue> {
        self.inner.headers.read().get(name).cloned()
    }

    pub fn set_headers_filter(&self, filter: Option<HeadersFilter>) {
        *self.inner.headers_filter.write() = filter;
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }
}

impl DownloaderInner {
    /// Start queued tasks while there are free slots.
    fn pump(self: &Arc<Self>) {
        loop {
            let task = {
                let mut state = self.state.lock();
                if state.suspended || state.executing.len() >= state.max_concurrent {
                    return;
                }
                let Some(task) = state.pop_next() else {
                    return;
                };
                // Cancelled between its cancel and the hook running
                if task.token.is_cancelled() || !task.transition(TaskState::Executing) {
                    task.discard();
                    continue;
                }
                state.executing.insert(task.id, task.clone());
                task
            };

            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.execute(task).await });
        }
    }

    fn cancel_queued(&self, id: u64) {
        let task = self.state.lock().remove_queued(id);
        if let Some(task) = task {
            if task.transition(TaskState::Cancelled) {
                debug!(id, url = %task.request.url, "Queued download cancelled");
                task.discard();
                let _ = self.events.send(DownloadEvent::Cancelled {
                    id,
                    url: task.request.url.clone(),
                });
            }
        }
    }

    fn build_fetch_request(&self, request: &DownloadRequest) -> FetchRequest {
        let mut headers = self.headers.read().clone();
        if let Some(filter) = self.headers_filter.read().as_ref() {
            headers = filter(&request.url, &headers);
        }
        FetchRequest {
            url: request.url.clone(),
            headers,
            use_transport_cache: request.options.use_transport_cache,
            validators: request.validators.clone(),
        }
    }

    async fn execute(self: Arc<Self>, task: Arc<DownloadTask>) {
        let url = task.request.url.clone();
        let _ = self.events.send(DownloadEvent::Started {
            id: task.id,
            url: url.clone(),
        });
        debug!(id = task.id, url = %url, "Download started");

        let fetch_request = self.build_fetch_request(&task.request);
        let progressive = task.request.options.progressive_download;
        let snapshots = PrefixSnapshots::default();
        let progress = |received: &[u8], expected: Option<u64>| {
            let partial_data = if progressive {
                snapshots.take(received, expected)
            } else {
                None
            };
            task.report_progress(DownloadProgress {
                received_bytes: received.len() as u64,
                expected_bytes: expected,
                partial_data,
            });
        };

        let fetch = self.transport.fetch(&fetch_request, &progress);
        let timed = async {
            if self.timeout.is_zero() {
                fetch.await
            } else {
                tokio::time::timeout(self.timeout, fetch)
                    .await
                    .unwrap_or(Err(ImageError::Timeout(self.timeout)))
            }
        };

        let (result, finished) = tokio::select! {
            biased;
            _ = task.token.cancelled() => (Err(ImageError::Cancelled), false),
            result = timed => (result, true),
        };

        let result = match result {
            Ok(FetchOutcome::Body(body))
                if body.from_transport_cache && task.request.options.ignore_cached_response =>
            {
                Ok(FetchOutcome::NotModified)
            }
            other => other,
        };

        let next_state = match &result {
            Ok(_) => TaskState::Completed,
            Err(ImageError::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };
        task.transition(next_state);
        task.token.complete();

        let event = match &result {
            Ok(_) => DownloadEvent::Finished {
                id: task.id,
                url: url.clone(),
                success: true,
            },
            Err(ImageError::Cancelled) => DownloadEvent::Cancelled {
                id: task.id,
                url: url.clone(),
            },
            Err(e) => {
                warn!(id = task.id, url = %url, error = %e, "Download failed");
                DownloadEvent::Finished {
                    id: task.id,
                    url: url.clone(),
                    success: false,
                }
            }
        };

        self.state.lock().executing.remove(&task.id);
        self.pump();

        let _ = self.events.send(event);
        task.complete(DownloadCompletion { result, finished });
        debug!(id = task.id, url = %url, ?next_state, "Download finished");
    }
}
