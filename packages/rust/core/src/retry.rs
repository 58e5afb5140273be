//! Bounded exponential-backoff retry.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};
use xaio_shared::RetryConfig;

/// Retry bounds: attempt cap plus a backoff floor and ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy with the default 1s floor and 10s ceiling.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept after failed attempt `attempt` (1-based): the floor
    /// doubled per attempt, clamped to the ceiling.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.initial_backoff.saturating_mul(1u32 << exp);
        delay.clamp(self.initial_backoff, self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with an error `is_retryable`
    /// rejects, or the attempt cap is reached. The last error is returned
    /// unchanged on exhaustion.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, R>(&self, operation: &str, is_retryable: R, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if is_retryable(&e) {
                        error!(operation, attempt, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts).with_backoff(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_backoff(Duration::ZERO, Duration::ZERO)
    }

    #[test]
    fn delays_double_between_floor_and_ceiling() {
        let policy = RetryPolicy::new(5);
        let delays: Vec<u64> = (1..=6).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = RetryPolicy::new(5);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn policy_from_config() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 2_000,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(4), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = fast(5)
            .run("test", |_| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 { Err("timeout".to_string()) } else { Ok(attempt) }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = fast(5)
            .run("test", |e: &String| e != "refused", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("refused".to_string()) }
            })
            .await;
        assert_eq!(result, Err("refused".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = fast(4)
            .run("test", |_| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("failure {attempt}")) }
            })
            .await;
        assert_eq!(result, Err("failure 4".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
