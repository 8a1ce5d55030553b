//! Bounded exponential backoff.
//!
//! [`Backoff`] is a small state machine: every failure is fed to
//! [`Backoff::next`], which either yields the delay before the next attempt or
//! gives up. Only errors that report themselves as retryable are retried, and
//! never more than `max_retries` times.
//!
//! Delays double from `base_delay` (`retry_delay` in the mapping config) and
//! are capped at [`MAX_DELAY`]. A server-provided `Retry-After` replaces the
//! computed delay for that step.

use std::future::Future;
use std::time::Duration;

use crate::error::SyncError;
use crate::remote::RemoteError;

/// Upper bound for a single backoff delay.
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// Errors that know whether repeating the operation can help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        RemoteError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        RemoteError::retry_after(self)
    }
}

impl Retryable for SyncError {
    fn is_retryable(&self) -> bool {
        SyncError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Remote(e) => e.retry_after(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: MAX_DELAY,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

/// Outcome of feeding one failure to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Wait this long, then attempt again.
    Retry(Duration),
    /// The error is fatal or the attempts are exhausted.
    GiveUp,
}

/// Retry state for one operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    /// Retries performed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn next<E: Retryable>(&mut self, err: &E) -> Step {
        if !err.is_retryable() || self.retries >= self.policy.max_retries {
            return Step::GiveUp;
        }
        self.retries += 1;

        let delay = match err.retry_after() {
            Some(hint) => hint,
            None => {
                let factor = 1u32 << (self.retries - 1).min(16);
                self.policy.base_delay.saturating_mul(factor)
            }
        };
        Step::Retry(delay.min(self.policy.max_delay))
    }
}

/// Run `op` until it succeeds, fails fatally, or runs out of retries.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::new(policy);
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match backoff.next(&err) {
                Step::Retry(delay) => {
                    tracing::debug!(
                        retry = backoff.retries(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Step::GiveUp => return Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_and_stop_at_max_retries() {
        let mut backoff = Backoff::new(RetryPolicy::new(3, Duration::from_secs(5)));
        let err = RemoteError::Timeout;
        assert_eq!(backoff.next(&err), Step::Retry(Duration::from_secs(5)));
        assert_eq!(backoff.next(&err), Step::Retry(Duration::from_secs(10)));
        assert_eq!(backoff.next(&err), Step::Retry(Duration::from_secs(20)));
        assert_eq!(backoff.next(&err), Step::GiveUp);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let mut backoff = Backoff::new(RetryPolicy::new(3, Duration::from_secs(1)));
        assert_eq!(
            backoff.next(&RemoteError::Unauthorized("token".into())),
            Step::GiveUp
        );
        assert_eq!(backoff.retries(), 0);
    }

    #[test]
    fn retry_after_overrides_and_is_capped() {
        let mut backoff = Backoff::new(RetryPolicy::new(2, Duration::from_secs(1)));
        let hinted = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(backoff.next(&hinted), Step::Retry(Duration::from_secs(7)));
        let huge = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(3600)),
        };
        assert_eq!(backoff.next(&huge), Step::Retry(MAX_DELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<&str, RemoteError> =
            with_retry(RetryPolicy::new(3, Duration::from_secs(1)), || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::Network("reset".into()))
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), RemoteError> =
            with_retry(RetryPolicy::new(2, Duration::from_millis(10)), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Server {
                    status: 503,
                    message: "unavailable".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
