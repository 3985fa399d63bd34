use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::event_sourcing::StoreResult;

// ============================================================================
// Conflict Retry (caller side)
// ============================================================================
//
// The stores never retry. A caller racing other writers on one aggregate can
// wrap its "load, decide, append" step in `retry_on_conflict`: the closure is
// re-run with exponential backoff while it fails with EventAlreadyExists.
// Every other error is returned at once.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// For hot aggregates with many concurrent writers
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let next = (delay.as_millis() as f64) * self.multiplier;
        Duration::from_millis(next as u64).min(self.max_delay)
    }
}

/// Re-run `operation` while it fails with a version conflict
pub async fn retry_on_conflict<F, Fut, T>(config: RetryConfig, mut operation: F) -> StoreResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt = attempt, "Append succeeded after conflict retry");
                }
                return Ok(result);
            }
            Err(error) if !error.is_conflict() => return Err(error),
            Err(error) => {
                if attempt >= config.max_attempts {
                    tracing::error!(
                        attempt = attempt,
                        error = %error,
                        "Still conflicting after all retries"
                    );
                    return Err(error);
                }

                tracing::warn!(
                    attempt = attempt,
                    error = %error,
                    delay_ms = delay.as_millis(),
                    "Version conflict, retrying after delay"
                );

                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn conflict() -> StoreError {
        StoreError::EventAlreadyExists {
            event_store_id: "counters".to_string(),
            aggregate_id: "A".to_string(),
            version: 2,
        }
    }

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_conflicts_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_on_conflict(config(3), |_attempt| {
            let counter = counter_clone.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok("appended")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "appended");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let result =
            retry_on_conflict(config(2), |_attempt| async { Err::<(), _>(conflict()) }).await;
        assert!(result.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let counter = AtomicU32::new(0);

        let result = retry_on_conflict(config(5), |_attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StoreError::Channel("closed".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Channel(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = config(5);
        assert_eq!(config.next_delay(Duration::from_millis(10)), Duration::from_millis(20));
        assert_eq!(config.next_delay(Duration::from_millis(80)), Duration::from_millis(100));
    }
}
