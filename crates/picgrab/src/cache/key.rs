//! # Cache Keys
//!
//! Derivation of cache keys from request URLs, optionally rewritten by a
//! user-supplied filter (e.g. to strip volatile query parameters).

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{ImageError, Result};

/// Rewrites a request URL into the string used as its cache key.
pub type CacheKeyFilter = Arc<dyn Fn(&Url) -> String + Send + Sync>;

/// Identity of one cacheable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-derived key. Empty keys are rejected.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ImageError::InvalidKey(key));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic, filename-safe digest of the key.
    pub fn to_filename(&self) -> String {
        let hash = Sha256::digest(self.0.as_bytes());
        format!("{hash:x}")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parse and normalize a request URL.
pub fn parse_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim())?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(ImageError::InvalidUrl(format!(
            "unsupported scheme '{other}' in {url}"
        ))),
    }
}

/// Derive the cache key for `url`, through `filter` when one is given.
pub fn derive_key(url: &Url, filter: Option<&CacheKeyFilter>) -> Result<CacheKey> {
    match filter {
        Some(filter) => {
            let key = filter(url);
            if key.trim().is_empty() {
                return Err(ImageError::InvalidKey(url.to_string()));
            }
            Ok(CacheKey(key))
        }
        None => Ok(CacheKey(url.as_str().to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_normalized_url() {
        let url = parse_url("HTTPS://Example.com/a/../img.png").unwrap();
        let key = derive_key(&url, None).unwrap();
        assert_eq!(key.as_str(), "https://example.com/img.png");
    }

    #[test]
    fn test_filter_strips_query() {
        let filter: CacheKeyFilter = Arc::new(|url: &Url| {
            let mut url = url.clone();
            url.set_query(None);
            url.to_string()
        });
        let a = parse_url("https://x/img.png?token=1").unwrap();
        let b = parse_url("https://x/img.png?token=2").unwrap();
        assert_eq!(
            derive_key(&a, Some(&filter)).unwrap(),
            derive_key(&b, Some(&filter)).unwrap()
        );
    }

    #[test]
    fn test_empty_filter_result_is_invalid_key() {
        let filter: CacheKeyFilter = Arc::new(|_url: &Url| String::new());
        let url = parse_url("https://x/img.png").unwrap();
        assert!(matches!(
            derive_key(&url, Some(&filter)),
            Err(ImageError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(
            parse_url("ftp://x/img.png"),
            Err(ImageError::InvalidUrl(_))
        ));
        assert!(parse_url("not a url").is_err());
    }

    #[test]
    fn test_filename_is_deterministic() {
        let a = CacheKey::new("https://x/img.png").unwrap();
        let b = CacheKey::new("https://x/img.png").unwrap();
        let c = CacheKey::new("https://x/other.png").unwrap();
        assert_eq!(a.to_filename(), b.to_filename());
        assert_ne!(a.to_filename(), c.to_filename());
        assert_eq!(a.to_filename().len(), 64);
    }
}
