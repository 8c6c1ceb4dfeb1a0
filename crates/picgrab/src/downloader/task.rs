//! Download task state and the values a task reports to its sinks.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;

use crate::cache::Validators;
use crate::error::Result;
use crate::options::DownloaderOptions;
use crate::token::OperationToken;

/// Lifecycle of a [`DownloadTask`]. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Executing,
    Cancelled,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Cancelled | TaskState::Completed | TaskState::Failed
        )
    }

    fn can_transition_to(self, next: TaskState) -> bool {
        match (self, next) {
            (TaskState::Queued, TaskState::Executing | TaskState::Cancelled) => true,
            (
                TaskState::Executing,
                TaskState::Cancelled | TaskState::Completed | TaskState::Failed,
            ) => true,
            _ => false,
        }
    }
}

/// What to download and how.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: Url,
    pub options: DownloaderOptions,
    /// Validators of a locally cached copy. When present the request is
    /// conditional and an unchanged resource yields [`FetchOutcome::NotModified`].
    pub validators: Option<Validators>,
}

impl DownloadRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            options: DownloaderOptions::default(),
            validators: None,
        }
    }

    pub fn with_options(mut self, options: DownloaderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_validators(mut self, validators: Validators) -> Self {
        self.validators = Some(validators);
        self
    }
}

/// A progress report for an executing download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub received_bytes: u64,
    /// From Content-Length, when the origin sent one.
    pub expected_bytes: Option<u64>,
    /// Prefix received so far, only with progressive download enabled. Not every
    /// report carries one: a new prefix is handed out as the body grows.
    pub partial_data: Option<Bytes>,
}

/// A successfully fetched body.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub bytes: Bytes,
    pub validators: Validators,
    pub content_type: Option<String>,
    /// Served from the transport's own response cache.
    pub from_transport_cache: bool,
}

/// Result of a successful fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Body(FetchedBody),
    /// The origin confirmed the cached copy is still current.
    NotModified,
}

/// The single terminal report of a download.
#[derive(Debug, Clone)]
pub struct DownloadCompletion {
    pub result: Result<FetchOutcome>,
    /// False only when the transfer was aborted by a cancel.
    pub finished: bool,
}

pub type ProgressSink = Arc<dyn Fn(DownloadProgress) + Send + Sync>;
pub type CompletionSink = Box<dyn FnOnce(DownloadCompletion) + Send>;

pub(crate) struct DownloadTask {
    pub(crate) id: u64,
    pub(crate) request: DownloadRequest,
    pub(crate) token: OperationToken,
    state: Mutex<TaskState>,
    progress: Option<ProgressSink>,
    completion: Mutex<Option<CompletionSink>>,
}

impl DownloadTask {
    pub(crate) fn new(
        id: u64,
        request: DownloadRequest,
        progress: Option<ProgressSink>,
        completion: CompletionSink,
    ) -> Self {
        Self {
            id,
            request,
            token: OperationToken::new(),
            state: Mutex::new(TaskState::Queued),
            progress,
            completion: Mutex::new(Some(completion)),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Move to `next` if allowed. Returns false for illegal transitions.
    pub(crate) fn transition(&self, next: TaskState) -> bool {
        let mut state = self.state.lock();
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn report_progress(&self, progress: DownloadProgress) {
        if self.token.is_cancelled() {
            return;
        }
        if let Some(sink) = &self.progress {
            sink(progress);
        }
    }

    /// Invoke the completion sink. Later calls do nothing.
    pub(crate) fn complete(&self, completion: DownloadCompletion) {
        let sink = self.completion.lock().take();
        if let Some(sink) = sink {
            sink(completion);
        }
    }

    /// Drop the completion sink without invoking it.
    pub(crate) fn discard(&self) {
        self.completion.lock().take();
    }
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("url", &self.request.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

/// Handle of an enqueued download.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    pub(crate) id: u64,
    pub(crate) token: OperationToken,
}

impl DownloadHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &OperationToken {
        &self.token
    }

    /// Cancel the download. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}
