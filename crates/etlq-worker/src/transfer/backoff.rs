//! Exponential retry around fallible async operations

use std::future::Future;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

/// Retry budget: `max_retries` retries after the first attempt, the delay
/// doubling after each one (1s, 2s, 4s, 8s, 16s by default)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay slept before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_delay
            .checked_mul(2u32.saturating_pow(retry))
            .unwrap_or(Duration::MAX)
    }

    /// Worst-case time spent sleeping when every attempt fails
    pub fn total_delay(&self) -> Duration {
        (0..self.max_retries)
            .map(|retry| self.delay_for(retry))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Run `operation` until it succeeds or the budget is spent
    ///
    /// The last error is returned as is. `label` names the operation in the
    /// retry warnings.
    pub async fn execute<T, E, F, Fut>(&self, label: &str, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_if(label, operation, |_: &E| true).await
    }

    /// Like [`execute`](Self::execute), but an error rejected by
    /// `should_retry` is returned at once
    pub async fn execute_if<T, E, F, Fut, P>(
        &self,
        label: &str,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut delay = self.initial_delay;
        let mut retries_left = self.max_retries;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if retries_left > 0 && should_retry(&err) => {
                    warn!(
                        operation = label,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        retries_left,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    retries_left -= 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[derive(Debug, PartialEq)]
    struct Boom(u32);

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom #{}", self.0)
        }
    }

    #[test]
    fn test_delay_progression() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..5).map(|r| policy.delay_for(r).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(policy.total_delay(), Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_operation_runs_retries_plus_one_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: Result<(), Boom> = BackoffPolicy::default()
            .execute("always fails", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(Boom(n))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        // The error from the sixth call comes back untouched
        assert_eq!(result.unwrap_err(), Boom(6));
        assert_eq!(started.elapsed(), Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = BackoffPolicy::default()
            .execute("flaky", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(Boom(n))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_no_retries_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Boom> = BackoffPolicy::none()
            .execute("once", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Boom(1)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: Result<(), Boom> = BackoffPolicy::default()
            .execute_if(
                "permanent",
                || {
                    let calls = calls.clone();
                    async move { Err(Boom(calls.fetch_add(1, Ordering::SeqCst) + 1)) }
                },
                |err: &Boom| err.0 < 2,
            )
            .await;

        // The first error is retried, the second is not
        assert_eq!(result.unwrap_err(), Boom(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }
}
