//! Remote store abstraction.
//!
//! [`RemoteAdapter`] is the capability interface every provider implements.
//! Providers differ in what they can promise (verbatim content, stable
//! version tokens, trustworthy timestamps); those promises are reported via
//! [`Capabilities`] instead of a type hierarchy, and the provider itself is
//! chosen by `remote.provider` in the config.
//!
//! Every failure is a [`RemoteError`], which knows whether it is retryable.
//!
//! # Rate limiting
//!
//! [`RateLimiter`] is a token bucket shared by all concurrent callers.
//! Adapters that send several HTTP requests per operation take a token per
//! request; single-request adapters are wrapped in [`ThrottledRemote`], which
//! takes one per call and adds a per-call timeout. A call that exceeds its
//! timeout fails with [`RemoteError::Timeout`], which is retryable.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Config;
use crate::connector_notion::NotionRemote;
use crate::models::{RemoteContent, RemoteMeta};
use crate::remote_memory::InMemoryRemote;

/// Errors reported by remote adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("rate limited by remote")]
    RateLimited { retry_after: Option<Duration> },

    #[error("remote call timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("remote server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("remote document not found: {0}")]
    NotFound(String),

    #[error("version conflict on {id}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        id: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid remote response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Rate limits, timeouts, network failures and 5xx responses.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited { .. }
                | RemoteError::Timeout
                | RemoteError::Network(_)
                | RemoteError::Server { .. }
        )
    }

    /// Server-provided delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// What a provider guarantees about the data it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Fetching returns exactly the bytes last written, so a successful
    /// write can be trusted without reading it back.
    pub verbatim_content: bool,
    /// Version tokens change on every content change, so an unchanged token
    /// means unchanged content.
    pub stable_versions: bool,
    /// Modification times are precise enough for newest-wins resolution.
    pub trustworthy_timestamps: bool,
    /// Granularity of remote modification times; a reported time may be up
    /// to this much earlier than the real edit.
    pub timestamp_resolution: Duration,
}

/// Client for one remote document store.
///
/// `parent` / `target` ids are whatever the provider uses to address a
/// container (a page, a database); documents are its direct children.
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Provider name, e.g. `"notion"`.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Syntactic check of a target id, used when loading mappings.
    fn validate_target(&self, target: &str) -> std::result::Result<(), String>;

    /// Content and metadata of a document, or `None` if it does not exist.
    async fn fetch(&self, id: &str) -> Result<Option<RemoteContent>, RemoteError>;

    /// Create a document named `name` under `parent`.
    async fn create(
        &self,
        parent: &str,
        name: &str,
        content: &[u8],
    ) -> Result<RemoteMeta, RemoteError>;

    /// Replace a document's content.
    ///
    /// When `expected_version` is given and the stored version differs, the
    /// update is refused with [`RemoteError::VersionConflict`].
    async fn update(
        &self,
        id: &str,
        content: &[u8],
        expected_version: Option<&str>,
    ) -> Result<RemoteMeta, RemoteError>;

    async fn delete(&self, id: &str) -> Result<(), RemoteError>;

    /// Documents directly under `parent`.
    async fn list_children(&self, parent: &str) -> Result<Vec<RemoteMeta>, RemoteError>;
}

/// Build the adapter selected by `remote.provider`.
///
/// The Notion adapter issues several HTTP requests per operation, so it
/// applies the rate limit and timeout to each request itself. Single-call
/// providers are wrapped in [`ThrottledRemote`].
pub fn create_remote(config: &Config) -> Result<Arc<dyn RemoteAdapter>> {
    let remote = &config.remote;
    match remote.provider.as_str() {
        "notion" => Ok(Arc::new(NotionRemote::from_config(remote)?)),
        "memory" => Ok(Arc::new(ThrottledRemote::new(
            Arc::new(InMemoryRemote::new()),
            remote.requests_per_second,
            remote.burst,
            Duration::from_secs(remote.timeout_secs),
        ))),
        other => bail!("Unknown remote provider: {}", other),
    }
}

// ============ Throttling ============

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by every call made through one adapter.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            rate: requests_per_second,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
                bucket.last = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Rate-limited, timeout-bounded view of an adapter whose operations are
/// single requests.
pub struct ThrottledRemote {
    inner: Arc<dyn RemoteAdapter>,
    limiter: RateLimiter,
    timeout: Duration,
}

impl ThrottledRemote {
    pub fn new(
        inner: Arc<dyn RemoteAdapter>,
        requests_per_second: f64,
        burst: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            limiter: RateLimiter::new(requests_per_second, burst),
            timeout,
        }
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        self.limiter.acquire().await;
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }
}

#[async_trait]
impl RemoteAdapter for ThrottledRemote {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn validate_target(&self, target: &str) -> std::result::Result<(), String> {
        self.inner.validate_target(target)
    }

    async fn fetch(&self, id: &str) -> Result<Option<RemoteContent>, RemoteError> {
        self.call(self.inner.fetch(id)).await
    }

    async fn create(
        &self,
        parent: &str,
        name: &str,
        content: &[u8],
    ) -> Result<RemoteMeta, RemoteError> {
        self.call(self.inner.create(parent, name, content)).await
    }

    async fn update(
        &self,
        id: &str,
        content: &[u8],
        expected_version: Option<&str>,
    ) -> Result<RemoteMeta, RemoteError> {
        self.call(self.inner.update(id, content, expected_version))
            .await
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.call(self.inner.delete(id)).await
    }

    async fn list_children(&self, parent: &str) -> Result<Vec<RemoteMeta>, RemoteError> {
        self.call(self.inner.list_children(parent)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(RemoteError::RateLimited { retry_after: None }.is_retryable());
        assert!(RemoteError::Timeout.is_retryable());
        assert!(RemoteError::Network("reset".into()).is_retryable());
        assert!(RemoteError::Server {
            status: 502,
            message: String::new()
        }
        .is_retryable());
        assert!(!RemoteError::Unauthorized("bad token".into()).is_retryable());
        assert!(!RemoteError::NotFound("x".into()).is_retryable());
        assert!(!RemoteError::VersionConflict {
            id: "x".into(),
            expected: None,
            actual: None
        }
        .is_retryable());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let err = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(RemoteError::Timeout.retry_after(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_calls_after_burst() {
        let limiter = RateLimiter::new(2.0, 2);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        // Two immediate, then two more at 0.5s intervals.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(990), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
    }

    struct Slow;

    #[async_trait]
    impl RemoteAdapter for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                verbatim_content: true,
                stable_versions: true,
                trustworthy_timestamps: true,
                timestamp_resolution: Duration::ZERO,
            }
        }
        fn validate_target(&self, _target: &str) -> std::result::Result<(), String> {
            Ok(())
        }
        async fn fetch(&self, _id: &str) -> Result<Option<RemoteContent>, RemoteError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
        async fn create(&self, _: &str, _: &str, _: &[u8]) -> Result<RemoteMeta, RemoteError> {
            Err(RemoteError::Rejected {
                status: 400,
                message: "unsupported".into(),
            })
        }
        async fn update(
            &self,
            _: &str,
            _: &[u8],
            _: Option<&str>,
        ) -> Result<RemoteMeta, RemoteError> {
            Err(RemoteError::Rejected {
                status: 400,
                message: "unsupported".into(),
            })
        }
        async fn delete(&self, _: &str) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn list_children(&self, _: &str) -> Result<Vec<RemoteMeta>, RemoteError> {
            Ok(vec![])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_as_retryable() {
        let remote = ThrottledRemote::new(Arc::new(Slow), 10.0, 1, Duration::from_secs(1));
        let err = remote.fetch("x").await.unwrap_err();
        assert_eq!(err, RemoteError::Timeout);
        assert!(err.is_retryable());
    }
}
