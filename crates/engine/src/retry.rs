//! Bounded retry with exponential backoff and jitter.
//!
//! One implementation shared by the scheduler's requeue delays and any
//! downstream consumer with the same needs (e.g. thumbnail generation).

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use segmentd_core::config::RetryConfig;

/// Backoff schedule for an operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor,
        }
    }

    /// Delay before the attempt after `attempt` (1-based) failed:
    /// `min(max_delay, initial_delay * backoff_factor^(attempt-1))` plus
    /// jitter bounded to an eighth of the base delay, so synchronized
    /// clients fan out without drifting past timing tolerances.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let scaled = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exponent as i32);
        let base = (scaled as u64).min(self.max_delay.as_millis() as u64);
        Duration::from_millis(base + jitter_ms(base / 8))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Compute jitter without rand: use the nanosecond fraction of current time.
fn jitter_ms(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    nanos % bound
}

pub struct RetryExecutor;

impl RetryExecutor {
    /// Run `op` until it succeeds, fails non-retryably, or `max_attempts`
    /// is exhausted. The closure receives the 1-based attempt number; the
    /// last error is surfaced unchanged.
    pub async fn execute<T, E, F, Fut, R>(
        policy: &RetryPolicy,
        is_retryable: R,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < policy.max_attempts && is_retryable(&error) => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy(max_attempts: u32, initial_ms: u64, factor: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_secs(30),
            backoff_factor: factor,
        }
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff_factor: 2.0,
        };
        // Jitter adds at most base/8
        let d1 = policy.delay_for(1).as_millis() as u64;
        let d2 = policy.delay_for(2).as_millis() as u64;
        let d3 = policy.delay_for(3).as_millis() as u64;
        assert!((100..=113).contains(&d1), "d1={d1}");
        assert!((200..=225).contains(&d2), "d2={d2}");
        assert!((350..=394).contains(&d3), "capped d3={d3}");
    }

    #[test]
    fn jitter_is_bounded() {
        for _ in 0..100 {
            assert!(jitter_ms(100) < 100);
        }
        assert_eq!(jitter_ms(0), 0);
    }

    #[tokio::test]
    async fn success_needs_no_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            RetryExecutor::execute(&policy(3, 10, 2.0), |_| true, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> =
            RetryExecutor::execute(&policy(5, 10, 2.0), |_| false, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent".to_string()) }
            })
            .await;
        assert_eq!(result.unwrap_err(), "permanent");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_timing_follows_backoff_schedule() {
        // maxAttempts 3, initialDelay 1000ms, factor 2: retries fire after
        // ~1000ms and ~2000ms gaps, then the last error surfaces.
        let times = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        let result: Result<(), String> = RetryExecutor::execute(
            &policy(3, 1000, 2.0),
            |_| true,
            |attempt| {
                times.lock().unwrap().push(start.elapsed());
                async move { Err(format!("transient #{attempt}")) }
            },
        )
        .await;
        assert_eq!(result.unwrap_err(), "transient #3");

        let times = times.lock().unwrap();
        assert_eq!(times.len(), 3);
        let gap1 = (times[1] - times[0]).as_millis() as i64;
        let gap2 = (times[2] - times[1]).as_millis() as i64;
        // ±20% tolerance around the nominal 1000/2000ms
        assert!((800..=1200).contains(&gap1), "gap1={gap1}");
        assert!((1600..=2400).contains(&gap2), "gap2={gap2}");
    }

    #[tokio::test(start_paused = true)]
    async fn last_attempt_error_is_surfaced() {
        let result: Result<(), String> =
            RetryExecutor::execute(&policy(2, 5, 2.0), |_| true, |attempt| async move {
                Err(format!("attempt-{attempt}"))
            })
            .await;
        assert_eq!(result.unwrap_err(), "attempt-2");
    }
}
