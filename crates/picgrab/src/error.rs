use std::sync::Arc;

use reqwest::StatusCode;

/// Coarse classification of [`ImageError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// DNS, connection, timeout or non-success status.
    Network,
    /// Malformed or unsupported image bytes.
    Decode,
    /// I/O, permission or space problems in the disk cache.
    Disk,
    /// Explicit cancellation. Not a failure.
    Cancelled,
    /// The cache key filter produced an unusable key.
    KeyDerivation,
    /// Rejected option or configuration combination.
    Config,
    /// A cache-only load found nothing.
    NotCached,
}

// Error type shared by every engine operation. Cloneable so a single
// download result can be fanned out to all subscribers of a key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ImageError {
    #[error("HTTP error: {source}")]
    Http {
        #[from]
        source: Arc<reqwest::Error>,
    },

    #[error("Server returned status code {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Disk cache error: {source}")]
    Disk {
        #[from]
        source: Arc<std::io::Error>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid cache key derived from {0}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No cached image for key {0}")]
    NotCached(String),

    #[error("Key {key} failed earlier in this process: {source}")]
    PreviouslyFailed {
        key: String,
        source: Box<ImageError>,
    },
}

impl ImageError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImageError::Http { .. }
            | ImageError::Status { .. }
            | ImageError::Timeout(_)
            | ImageError::InvalidUrl(_) => ErrorKind::Network,
            ImageError::Decode(_) => ErrorKind::Decode,
            ImageError::Disk { .. } => ErrorKind::Disk,
            ImageError::Cancelled => ErrorKind::Cancelled,
            ImageError::InvalidKey(_) => ErrorKind::KeyDerivation,
            ImageError::Config(_) => ErrorKind::Config,
            ImageError::NotCached(_) => ErrorKind::NotCached,
            ImageError::PreviouslyFailed { source, .. } => source.kind(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImageError::Cancelled)
    }

    /// Whether a failure of this kind should block automatic retries of the key.
    /// Transient conditions (timeouts, unreachable hosts) stay retryable.
    pub(crate) fn is_blacklistable(&self) -> bool {
        match self {
            ImageError::Timeout(_) => false,
            ImageError::Http { source } => !(source.is_timeout() || source.is_connect()),
            other => matches!(other.kind(), ErrorKind::Network | ErrorKind::Decode),
        }
    }
}

// Manual conversions because of the Arc wrapping.
impl From<reqwest::Error> for ImageError {
    fn from(err: reqwest::Error) -> Self {
        ImageError::Http {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for ImageError {
    fn from(err: std::io::Error) -> Self {
        ImageError::Disk {
            source: Arc::new(err),
        }
    }
}

impl From<url::ParseError> for ImageError {
    fn from(err: url::ParseError) -> Self {
        ImageError::InvalidUrl(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ImageError>;
