//! Bounded retry policy for collaborator calls
//!
//! Waiting is done with `tokio::time::sleep`, so a retrying task yields
//! instead of blocking its worker thread.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    None,
    Fixed(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

/// Retry settings as they appear in configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(2))
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        if settings.backoff_ms == 0 {
            Self::immediate(settings.max_attempts)
        } else {
            Self::fixed(settings.max_attempts, Duration::from_millis(settings.backoff_ms))
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::None,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_after(&self, _attempt: u32) -> Duration {
        match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(d) => d,
        }
    }

    /// Run `op` until it succeeds or `max_attempts` is reached.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = None;

        for attempt in 1..=self.max_attempts {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(label, attempt, max_attempts = self.max_attempts, error = %e, "Attempt failed");
                    last_err = Some(e);
                    if attempt < self.max_attempts {
                        let delay = self.delay_after(attempt);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| anyhow!("no attempts made"));
        Err(err.context(format!(
            "{} gave up after {} attempts",
            label, self.max_attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        let result = policy
            .run("flaky", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(anyhow!("timeout"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(3);

        let result: Result<()> = policy
            .run("dead", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("connection refused")) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(format!("{:#}", err).contains("gave up after 3 attempts"));
    }

    #[test]
    fn test_zero_attempts_is_promoted_to_one() {
        let policy = RetryPolicy::immediate(0);
        assert_eq!(policy.max_attempts, 1);

        let calls = AtomicU32::new(0);
        let result: Result<()> = tokio_test::block_on(policy.run("once", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("refused")) }
        }));
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
