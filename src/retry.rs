//! Bounded retries for transient failures
//!
//! Cluster reads during an install, component creation and the domain suffix
//! lookup all retry a small, fixed number of times. [`RetryConfig`] names the
//! attempt budget and the wait between attempts; [`retry_with_backoff`]
//! drives the operation and logs every failed attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Wait between two attempts
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backoff {
    /// Same delay every time
    Fixed(Duration),
    /// Doubling delay starting at `initial`, capped at `max`
    Exponential {
        /// First delay
        initial: Duration,
        /// Upper bound
        max: Duration,
    },
}

/// Attempt budget and backoff of a retried operation
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first; at least one is always made
    pub attempts: u32,
    /// Wait schedule
    pub backoff: Backoff,
    /// Scale each wait by a random factor in `[0.5, 1.5)`
    pub jitter: bool,
}

impl RetryConfig {
    /// `attempts` tries, `delay` apart
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Fixed(delay),
            jitter: false,
        }
    }

    /// `attempts` tries with jittered, doubling waits
    pub fn exponential(attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Exponential { initial, max },
            jitter: true,
        }
    }

    /// Un-jittered wait before retry number `retry` (1-based)
    pub fn base_delay(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if !self.jitter || base.is_zero() {
            return base;
        }
        base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent
///
/// Returns the last error when every attempt failed.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if attempt >= attempts {
            warn!(operation = %operation_name, attempts, error = %err, "giving up");
            return Err(err);
        }

        let delay = config.delay(attempt);
        debug!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "attempt failed, retrying"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn failing_until(successes_after: u32) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<u32, String>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n > successes_after {
                Ok(n)
            } else {
                Err(format!("attempt {} failed", n))
            })
        };
        (calls, op)
    }

    #[rstest]
    #[case(1, Duration::from_millis(100))]
    #[case(2, Duration::from_millis(200))]
    #[case(3, Duration::from_millis(400))]
    #[case(6, Duration::from_secs(2))]
    #[case(40, Duration::from_secs(2))]
    fn test_exponential_delay_doubles_up_to_cap(#[case] retry: u32, #[case] expected: Duration) {
        let config = RetryConfig::exponential(50, Duration::from_millis(100), Duration::from_secs(2));
        assert_eq!(config.base_delay(retry), expected);
    }

    #[tokio::test]
    async fn test_retried_once_then_succeeds() {
        let (calls, op) = failing_until(1);
        let result = retry_with_backoff(&RetryConfig::fixed(2, Duration::ZERO), "describe cluster", op).await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_last_error_returned_when_budget_spent() {
        let (calls, op) = failing_until(u32::MAX);
        let result = retry_with_backoff(&RetryConfig::fixed(3, Duration::ZERO), "list nodes", op).await;
        assert_eq!(result, Err("attempt 3 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_calls_once() {
        let (calls, op) = failing_until(0);
        let result = retry_with_backoff(&RetryConfig::fixed(0, Duration::ZERO), "op", op).await;
        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Story: components are created with three attempts two seconds apart;
    /// the paused clock shows the retries wait the full fixed delay.
    #[tokio::test(start_paused = true)]
    async fn story_fixed_backoff_waits_exact_delay() {
        let (calls, op) = failing_until(u32::MAX);
        let start = tokio::time::Instant::now();

        let result = retry_with_backoff(&RetryConfig::fixed(3, Duration::from_secs(2)), "create component", op).await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jittered_wait_stays_within_bounds() {
        let (_, op) = failing_until(1);
        let start = tokio::time::Instant::now();
        let config = RetryConfig::exponential(2, Duration::from_secs(10), Duration::from_secs(60));

        retry_with_backoff(&config, "op", op).await.unwrap();

        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(15));
    }
}
