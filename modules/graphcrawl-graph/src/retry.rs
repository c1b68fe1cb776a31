use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{GraphError, Result};

/// Bounded retry for write conflicts between concurrent workers.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            ..Self::default()
        }
    }

    /// Full-jitter backoff: uniform in `[0, min(max_delay, base * 2^attempt)]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let cap = exp.min(self.max_delay);
        let cap_ms = cap.as_millis() as u64;
        if cap_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=cap_ms))
    }
}

/// Run `op`, retrying only on [`GraphError::Conflict`]. Any other error and
/// the final conflict are returned unchanged.
pub async fn with_conflict_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(GraphError::Conflict(detail)) if attempt + 1 < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    detail = detail.as_str(),
                    "Write conflict, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn conflict_then_success_is_retried() {
        let calls = AtomicU32::new(0);
        let result = with_conflict_retry(&fast(), "edge", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(GraphError::Conflict("deadlock".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_conflict_surfaces_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_conflict_retry(&fast(), "edge", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GraphError::Conflict("deadlock".into()))
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_conflict_retry(&fast(), "edge", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GraphError::Neo4j("syntax".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_respects_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        };
        for attempt in 0..10 {
            assert!(policy.backoff(attempt) <= Duration::from_millis(250));
        }
    }
}
