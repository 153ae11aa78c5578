//! Retry engine with exponential backoff and jitter
//!
//! Every other component routes its remote calls through
//! [`execute_with_retry`]:
//! - Each attempt is bounded by `timeout`; a timeout is a retryable failure
//! - Failures are classified by a caller-supplied predicate
//! - Retryable failures wait `min(max_delay, base_delay * 2^(n-1))` plus up to
//!   30% jitter (capped at `max_delay`) before the next attempt
//! - After `max_retries` retries the last error is returned with the full
//!   attempt trace

use crate::error::SyncError;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Fraction of the backoff floor added as random jitter
const JITTER_FRACTION: f64 = 0.3;

/// Retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Time budget for a single attempt
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::backend()
    }
}

impl RetryConfig {
    /// Profile for calls to the remote backend (3 retries, 300 ms to 5 s)
    pub fn backend() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(5_000),
            timeout: Duration::from_secs(10),
        }
    }

    /// Profile for generic API calls (3 retries, 500 ms to 10 s)
    pub fn api() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(10_000),
            timeout: Duration::from_secs(30),
        }
    }

    /// Unjittered delay before retry number `attempt` (1-based)
    pub fn backoff_floor(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Jittered delay before retry number `attempt`, never above `max_delay`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let floor = self.backoff_floor(attempt);
        let jitter_ceiling = floor.as_secs_f64() * JITTER_FRACTION;
        let jitter = if jitter_ceiling > 0.0 {
            rand::thread_rng().gen_range(0.0..=jitter_ceiling)
        } else {
            0.0
        };
        (floor + Duration::from_secs_f64(jitter)).min(self.max_delay)
    }
}

/// Why a single attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: Display> Display for AttemptError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Failed(e) => write!(f, "{}", e),
            AttemptError::TimedOut(d) => write!(f, "timed out after {:?}", d),
        }
    }
}

/// One entry of the attempt trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    pub error: String,
    pub elapsed: Duration,
    /// Delay scheduled before the next attempt, if any
    pub delay_before_next: Option<Duration>,
}

/// Final failure returned by the retry engine
#[derive(Debug, Clone)]
pub struct RetryFailure<E> {
    pub last_error: AttemptError<E>,
    pub attempts: u32,
    /// False when a non-retryable failure stopped the loop early
    pub exhausted: bool,
    pub trace: Vec<AttemptRecord>,
}

impl<E> RetryFailure<E> {
    /// Total time spent sleeping between attempts
    pub fn total_delay(&self) -> Duration {
        self.trace
            .iter()
            .filter_map(|r| r.delay_before_next)
            .sum()
    }
}

/// Run `operation` under the retry policy
///
/// `is_retryable` classifies operation errors; timeouts are always retryable.
pub async fn execute_with_retry<T, E, F, Fut, P>(
    mut operation: F,
    is_retryable: P,
    config: &RetryConfig,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut trace = Vec::new();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let started = Instant::now();

        let error = match tokio::time::timeout(config.timeout, operation()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(attempt = attempt, "Operation succeeded after retries");
                }
                return Ok(value);
            }
            Ok(Err(e)) => AttemptError::Failed(e),
            Err(_) => AttemptError::TimedOut(config.timeout),
        };

        let retryable = match &error {
            AttemptError::Failed(e) => is_retryable(e),
            AttemptError::TimedOut(_) => true,
        };
        let elapsed = started.elapsed();

        if !retryable {
            warn!(error = %error, attempt = attempt, "Non-retryable error encountered");
            trace.push(AttemptRecord {
                attempt,
                error: error.to_string(),
                elapsed,
                delay_before_next: None,
            });
            return Err(RetryFailure {
                last_error: error,
                attempts: attempt,
                exhausted: false,
                trace,
            });
        }

        if attempt > config.max_retries {
            warn!(
                error = %error,
                attempts = attempt,
                max_retries = config.max_retries,
                "Retry attempts exhausted"
            );
            trace.push(AttemptRecord {
                attempt,
                error: error.to_string(),
                elapsed,
                delay_before_next: None,
            });
            return Err(RetryFailure {
                last_error: error,
                attempts: attempt,
                exhausted: true,
                trace,
            });
        }

        let delay = config.backoff_delay(attempt);
        warn!(
            error = %error,
            attempt = attempt,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Retrying after error"
        );
        trace.push(AttemptRecord {
            attempt,
            error: error.to_string(),
            elapsed,
            delay_before_next: Some(delay),
        });

        tokio::time::sleep(delay).await;
    }
}

/// Retry an operation returning [`SyncError`], classifying with
/// [`SyncError::is_retryable`] and mapping timeouts to [`SyncError::Timeout`]
pub async fn retry_sync_call<T, F, Fut>(
    operation: F,
    config: &RetryConfig,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    execute_with_retry(operation, SyncError::is_retryable, config)
        .await
        .map_err(|failure| match failure.last_error {
            AttemptError::Failed(e) => e,
            AttemptError::TimedOut(d) => SyncError::Timeout(d),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(5_000),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_presets() {
        let backend = RetryConfig::backend();
        assert_eq!(backend.max_retries, 3);
        assert_eq!(backend.base_delay, Duration::from_millis(300));
        assert_eq!(backend.max_delay, Duration::from_millis(5_000));

        let api = RetryConfig::api();
        assert_eq!(api.max_retries, 3);
        assert_eq!(api.base_delay, Duration::from_millis(500));
        assert_eq!(api.max_delay, Duration::from_millis(10_000));
    }

    #[test]
    fn test_backoff_floor_doubles_and_caps() {
        let config = fast_config();
        assert_eq!(config.backoff_floor(1), Duration::from_millis(300));
        assert_eq!(config.backoff_floor(2), Duration::from_millis(600));
        assert_eq!(config.backoff_floor(3), Duration::from_millis(1_200));
        assert_eq!(config.backoff_floor(6), Duration::from_millis(5_000));
        assert_eq!(config.backoff_floor(200), Duration::from_millis(5_000));
    }

    #[test]
    fn test_backoff_delay_stays_within_bounds() {
        let config = fast_config();
        for attempt in 1..=8 {
            for _ in 0..50 {
                let delay = config.backoff_delay(attempt);
                assert!(delay >= config.backoff_floor(attempt));
                assert!(delay <= config.max_delay);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_fourth_attempt() {
        let config = fast_config();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let mut seen_at = Vec::new();

        let result = execute_with_retry(
            || {
                seen_at.push(Instant::now());
                let calls = Arc::clone(&calls_clone);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(SyncError::TransientNetwork("connection reset".into()))
                    } else {
                        Ok("delivered")
                    }
                }
            },
            SyncError::is_retryable,
            &config,
        )
        .await;

        assert_eq!(result.unwrap(), "delivered");
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        for (i, pair) in seen_at.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            let attempt = i as u32 + 1;
            assert!(gap >= config.backoff_floor(attempt), "gap {:?} below floor", gap);
            assert!(gap <= config.max_delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = execute_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::PermanentValidation("seat taken".into())) }
            },
            SyncError::is_retryable,
            &fast_config(),
        )
        .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!failure.exhausted);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.trace.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_full_trace() {
        let config = fast_config();

        let result: Result<(), _> = execute_with_retry(
            || async { Err(SyncError::TransientNetwork("offline".into())) },
            SyncError::is_retryable,
            &config,
        )
        .await;

        let failure = result.unwrap_err();
        assert!(failure.exhausted);
        assert_eq!(failure.attempts, config.max_retries + 1);
        assert_eq!(failure.trace.len(), 4);
        assert!(failure.trace.last().unwrap().delay_before_next.is_none());
        assert!(failure.total_delay() >= Duration::from_millis(300 + 600 + 1_200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried() {
        let config = RetryConfig {
            max_retries: 1,
            timeout: Duration::from_millis(100),
            ..fast_config()
        };
        let calls = AtomicU32::new(0);

        let result = retry_sync_call(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok::<_, SyncError>(n)
                }
            },
            &config,
        )
        .await;

        assert_eq!(result, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_timeouts_map_to_timeout_error() {
        let config = RetryConfig {
            max_retries: 1,
            timeout: Duration::from_millis(100),
            ..fast_config()
        };

        let result: Result<(), SyncError> = retry_sync_call(
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            &config,
        )
        .await;

        assert_eq!(result, Err(SyncError::Timeout(Duration::from_millis(100))));
    }
}
