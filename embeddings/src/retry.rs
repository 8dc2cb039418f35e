//! Bounded exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EmbeddingError, Result};

/// Retry settings for one embedding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound for any delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the attempt count.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32, error: &EmbeddingError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let backoff = self.base_delay_ms.saturating_mul(1u64 << exponent);
        let wanted = match error {
            EmbeddingError::RateLimited { retry_after_secs } => {
                backoff.max(retry_after_secs.saturating_mul(1000))
            }
            _ => backoff,
        };
        Duration::from_millis(wanted.min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt, &e);
                    warn!("Embedding call failed: {e}; retrying in {delay:?} (attempt {attempt}/{max_attempts})");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let err = EmbeddingError::Timeout(String::new());
        assert_eq!(policy.delay_for(1, &err), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2, &err), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10, &err), Duration::from_millis(5_000));

        let limited = EmbeddingError::RateLimited { retry_after_secs: 2 };
        assert_eq!(policy.delay_for(1, &limited), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = RetryPolicy::default()
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EmbeddingError::Unavailable("down".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_capped() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = RetryPolicy::default()
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EmbeddingError::Timeout("slow".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(EmbeddingError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = RetryPolicy::default()
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EmbeddingError::MalformedResponse("bad".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
