use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::ExchangeError;

/// Exponential backoff with jitter.
///
/// Formula: min(max_delay, base * 2^attempt) ± jitter_factor
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max_delay,
            // Negative jitter would make gen_range panic
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Calculate the next delay and increment the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp_delay = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        let capped_delay = exp_delay.min(self.max_delay);

        let jitter_range = capped_delay.as_secs_f64() * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_secs = (capped_delay.as_secs_f64() + jitter).max(0.0);

        self.attempt = self.attempt.saturating_add(1);

        Duration::from_secs_f64(final_secs)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Retry budget for venue calls. Only transient failures are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: 0.1,
        }
    }
}

/// A call that gave up, with the number of attempts made.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted {
    pub error: ExchangeError,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.jitter,
        )
    }

    /// Run `call` until it succeeds, fails permanently, or the attempt budget is spent.
    ///
    /// A venue retry-after hint replaces the computed delay.
    pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> Result<(T, u32), RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut backoff = self.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match call(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let delay = error.retry_after().unwrap_or_else(|| backoff.next_delay());
                    tracing::warn!(
                        "⚠️  {} failed (attempt {}/{}): {} - retrying in {:?}",
                        label,
                        attempt,
                        max_attempts,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    if error.is_transient() {
                        tracing::error!("❌ {} gave up after {} attempts: {}", label, attempt, error);
                    }
                    return Err(RetryExhausted {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_increases_exponentially() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10), 0.0);
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60), 0.2);
        let secs = backoff.next_delay().as_secs_f64();
        assert!((8.0..=12.0).contains(&secs), "delay was {}", secs);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = &AtomicU32::new(0);
        let (value, attempts) = no_jitter()
            .run("create_order", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(ExchangeError::Timeout(Duration::from_secs(1)))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_fail_immediately() {
        let calls = &AtomicU32::new(0);
        let err = no_jitter()
            .run("create_order", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ExchangeError::InsufficientBalance("USDT".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_bounded() {
        let err = no_jitter()
            .run("fetch", |_| async {
                Err::<(), _>(ExchangeError::Network("reset".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_honored() {
        let start = tokio::time::Instant::now();
        let calls = &AtomicU32::new(0);
        no_jitter()
            .run("create_order", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ExchangeError::RateLimited {
                        retry_after: Some(Duration::from_secs(3)),
                    })
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
