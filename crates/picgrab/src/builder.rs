//! # Builder for DownloaderConfig
//!
//! Fluent construction of a [`DownloaderConfig`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use picgrab_engine::{DownloaderConfig, ExecutionOrder};
//!
//! let config = DownloaderConfig::builder()
//!     .with_max_concurrent_downloads(4)
//!     .with_execution_order(ExecutionOrder::Lifo)
//!     .with_download_timeout(Duration::from_secs(30))
//!     .with_header("X-Api-Key", "my-secret-key")
//!     .with_credentials("user", "pass")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.max_concurrent_downloads, 4);
//! ```

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::config::DownloaderConfig;
use crate::error::Result;
use crate::options::ExecutionOrder;

/// Builder for creating DownloaderConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct DownloaderConfigBuilder {
    config: DownloaderConfig,
}

impl DownloaderConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: DownloaderConfig::default(),
        }
    }

    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.config.max_concurrent_downloads = max;
        self
    }

    pub fn with_execution_order(mut self, order: ExecutionOrder) -> Self {
        self.config.execution_order = order;
        self
    }

    /// Set the per-request timeout. Zero disables it.
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_timeout = timeout;
        self
    }

    /// Set the connection timeout (time to establish initial connection)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set whether to follow redirects
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.headers.insert(name, value);
        }
        self
    }

    /// Set all HTTP headers, replacing any existing headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers = headers;
        self
    }

    /// Basic auth credentials sent with every request
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password.into());
        self
    }

    /// Byte budget of the transport response cache. 0 disables it.
    pub fn with_response_cache_capacity(mut self, bytes: u64) -> Self {
        self.config.response_cache_capacity = bytes;
        self
    }

    pub fn with_system_proxy(mut self, use_system_proxy: bool) -> Self {
        self.config.use_system_proxy = use_system_proxy;
        self
    }

    /// Validate and build the DownloaderConfig instance
    pub fn build(self) -> Result<DownloaderConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for DownloaderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
