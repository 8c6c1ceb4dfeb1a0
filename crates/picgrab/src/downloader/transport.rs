//! # Transport
//!
//! The network seam of the downloader. [`HttpTransport`] fetches over reqwest,
//! streaming the body so progress can be reported chunk by chunk, and keeps a
//! small response cache used for conditional revalidation.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use moka::sync::Cache;
use reqwest::header::{
    CONTENT_TYPE, ETAG, HeaderMap, HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::{Client, StatusCode};
use tracing::{debug, info};
use url::Url;

use crate::cache::Validators;
use crate::config::DownloaderConfig;
use crate::downloader::task::{FetchOutcome, FetchedBody};
use crate::error::{ImageError, Result};

/// Upper bound of the buffer preallocated from Content-Length.
const MAX_PREALLOCATION: u64 = 8 * 1024 * 1024;

/// A single network fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    /// Headers sent with this request, already merged and filtered.
    pub headers: HeaderMap,
    /// Consult the transport's own response cache.
    pub use_transport_cache: bool,
    /// Validators of the caller's cached copy.
    pub validators: Option<Validators>,
}

/// Called with the bytes received so far and the expected total.
pub type FetchProgress<'a> = &'a (dyn Fn(&[u8], Option<u64>) + Send + Sync);

/// Fetches raw bytes from an origin.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: FetchProgress<'_>,
    ) -> Result<FetchOutcome>;
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &DownloaderConfig) -> Result<Client> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(config.max_concurrent_downloads)
        .user_agent(&config.user_agent)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if config.use_system_proxy {
        info!("Using system proxy settings for downloads");
    } else {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled for downloads");
    }

    client_builder.build().map_err(ImageError::from)
}

#[derive(Clone)]
struct CachedResponse {
    bytes: Bytes,
    validators: Validators,
    content_type: Option<String>,
}

/// HTTP(S) transport backed by reqwest.
pub struct HttpTransport {
    client: Client,
    credentials: Option<(String, Option<String>)>,
    response_cache: Option<Cache<String, CachedResponse>>,
}

impl HttpTransport {
    pub fn new(config: &DownloaderConfig) -> Result<Self> {
        let client = create_client(config)?;
        let mut transport = Self::with_client(client, config.response_cache_capacity);
        transport.credentials = config
            .username
            .clone()
            .map(|username| (username, config.password.clone()));
        Ok(transport)
    }

    /// Wrap an existing client. A `response_cache_capacity` of 0 disables the
    /// response cache.
    pub fn with_client(client: Client, response_cache_capacity: u64) -> Self {
        let response_cache = (response_cache_capacity > 0).then(|| {
            Cache::builder()
                .max_capacity(response_cache_capacity)
                .weigher(|_key: &String, value: &CachedResponse| {
                    u32::try_from(value.bytes.len()).unwrap_or(u32::MAX)
                })
                .build()
        });

        Self {
            client,
            credentials: None,
            response_cache,
        }
    }

    fn cached_response(&self, url: &Url) -> Option<CachedResponse> {
        self.response_cache.as_ref()?.get(url.as_str())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: FetchProgress<'_>,
    ) -> Result<FetchOutcome> {
        let cached = if request.use_transport_cache {
            self.cached_response(&request.url)
        } else {
            None
        };

        let conditional = request
            .validators
            .clone()
            .or_else(|| cached.as_ref().map(|c| c.validators.clone()))
            .filter(|v| !v.is_empty());

        let mut builder = self
            .client
            .get(request.url.clone())
            .headers(request.headers.clone());
        if let Some(validators) = &conditional {
            if let Some(etag) = &validators.etag {
                builder = builder.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(last_modified) = &validators.last_modified {
                builder = builder.header(IF_MODIFIED_SINCE, last_modified.as_str());
            }
        }
        if let Some((username, password)) = &self.credentials {
            builder = builder.basic_auth(username, password.as_ref());
        }

        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            if request.validators.is_some() {
                debug!(url = %request.url, "Origin reports resource unchanged");
                return Ok(FetchOutcome::NotModified);
            }
            if let Some(cached) = cached {
                debug!(url = %request.url, "Serving revalidated response from transport cache");
                progress(&cached.bytes, Some(cached.bytes.len() as u64));
                return Ok(FetchOutcome::Body(FetchedBody {
                    bytes: cached.bytes,
                    validators: cached.validators,
                    content_type: cached.content_type,
                    from_transport_cache: true,
                }));
            }
        }

        if !status.is_success() {
            return Err(ImageError::Status {
                status,
                url: request.url.to_string(),
            });
        }

        let (validators, content_type) = extract_cache_headers(response.headers());
        let expected = response.content_length();
        let capacity = expected.unwrap_or(0).min(MAX_PREALLOCATION) as usize;
        let mut buffer = BytesMut::with_capacity(capacity);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            progress(&buffer, expected);
        }
        let bytes = buffer.freeze();

        if let Some(cache) = &self.response_cache {
            if !validators.is_empty() {
                cache.insert(
                    request.url.to_string(),
                    CachedResponse {
                        bytes: bytes.clone(),
                        validators: validators.clone(),
                        content_type: content_type.clone(),
                    },
                );
            }
        }

        debug!(url = %request.url, size = bytes.len(), "Fetched resource");
        Ok(FetchOutcome::Body(FetchedBody {
            bytes,
            validators,
            content_type,
            from_transport_cache: false,
        }))
    }
}

/// Extract validators and content type from response headers
fn extract_cache_headers(headers: &HeaderMap) -> (Validators, Option<String>) {
    let header = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };

    let validators = Validators {
        etag: header(ETAG),
        last_modified: header(LAST_MODIFIED),
    };
    (validators, header(CONTENT_TYPE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use parking_lot::Mutex;

    fn request(url: String) -> FetchRequest {
        FetchRequest {
            url: Url::parse(&url).unwrap(),
            headers: HeaderMap::new(),
            use_transport_cache: false,
            validators: None,
        }
    }

    fn transport() -> HttpTransport {
        HttpTransport::new(&DownloaderConfig::default()).unwrap()
    }

    fn body(outcome: FetchOutcome) -> FetchedBody {
        match outcome {
            FetchOutcome::Body(body) => body,
            FetchOutcome::NotModified => panic!("expected a body"),
        }
    }

    #[tokio::test]
    async fn test_fetch_streams_body_with_progress() {
        let mut server = mockito::Server::new_async().await;
        let payload = vec![7u8; 1024];
        let mock = server
            .mock("GET", "/img.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_header("etag", "\"v1\"")
            .with_body(payload.clone())
            .create_async()
            .await;

        let reports = Mutex::new(Vec::new());
        let progress = |received: &[u8], expected: Option<u64>| {
            reports.lock().push((received.len(), expected));
        };

        let outcome = transport()
            .fetch(&request(format!("{}/img.png", server.url())), &progress)
            .await
            .unwrap();
        let fetched = body(outcome);

        assert_eq!(fetched.bytes.as_ref(), payload.as_slice());
        assert_eq!(fetched.content_type.as_deref(), Some("image/png"));
        assert_eq!(fetched.validators.etag.as_deref(), Some("\"v1\""));
        assert!(!fetched.from_transport_cache);

        let reports = reports.lock();
        let (received, expected) = *reports.last().unwrap();
        assert_eq!(received, 1024);
        assert!(matches!(expected, None | Some(1024)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing.png")
            .with_status(404)
            .create_async()
            .await;

        let err = transport()
            .fetch(&request(format!("{}/missing.png", server.url())), &|_, _| {})
            .await
            .unwrap_err();
        match err {
            ImageError::Status { status, .. } => assert_eq!(status, StatusCode::NOT_FOUND),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_conditional_request_not_modified() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/img.png")
            .match_header("if-none-match", "\"v1\"")
            .with_status(304)
            .create_async()
            .await;

        let mut req = request(format!("{}/img.png", server.url()));
        req.validators = Some(Validators {
            etag: Some("\"v1\"".into()),
            last_modified: None,
        });

        let outcome = transport().fetch(&req, &|_, _| {}).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::NotModified));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transport_cache_revalidation() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/img.png")
            .match_header("if-none-match", Matcher::Missing)
            .with_status(200)
            .with_header("etag", "\"abc\"")
            .with_body("original")
            .create_async()
            .await;
        let revalidate = server
            .mock("GET", "/img.png")
            .match_header("if-none-match", "\"abc\"")
            .with_status(304)
            .create_async()
            .await;

        let transport = transport();
        let mut req = request(format!("{}/img.png", server.url()));
        body(transport.fetch(&req, &|_, _| {}).await.unwrap());

        req.use_transport_cache = true;
        let cached = body(transport.fetch(&req, &|_, _| {}).await.unwrap());
        assert!(cached.from_transport_cache);
        assert_eq!(cached.bytes.as_ref(), b"original");

        first.assert_async().await;
        revalidate.assert_async().await;
    }

    #[tokio::test]
    async fn test_sends_request_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/img.png")
            .match_header("x-token", "secret")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let mut req = request(format!("{}/img.png", server.url()));
        req.headers.insert("x-token", "secret".parse().unwrap());
        body(transport().fetch(&req, &|_, _| {}).await.unwrap());
        mock.assert_async().await;
    }
}
