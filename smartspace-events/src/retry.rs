//! Retry with backoff for transient storage errors.

use rand::Rng;
use smartspace_core::{RetryConfig, SpaceResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Run `op` until it succeeds, retrying transient errors with exponential
/// backoff and sequence conflicts immediately.
///
/// Any other error, or exhausting `max_retries`, returns the last error.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &'static str,
    mut op: F,
) -> SpaceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SpaceResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_retries && e.is_sequence_conflict() => {
                // The next attempt recomputes the seq inside its own transaction.
                debug!(operation, attempt, error = %e, "Retrying after sequence conflict");
            }
            Err(e) if attempt < config.max_retries && e.is_transient() => {
                let delay = jittered(config.backoff_for(attempt));
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient storage error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
        attempt += 1;
    }
}

/// Add up to 25% random jitter so retrying writers spread out.
fn jittered(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartspace_core::{EntityIdType, ScopeId, SpaceError, SpaceId, StorageError, ValidationError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry(&fast(), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SpaceError::from(StorageError::Unavailable {
                    reason: "down".to_string(),
                }))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_sequence_conflicts_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let scope = ScopeId::Space(SpaceId::now_v7());
        let result = with_retry(&fast(), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SpaceError::from(StorageError::SequenceConflict { scope, seq: 4 }))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: SpaceResult<()> = with_retry(&fast(), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SpaceError::from(ValidationError::RequiredFieldMissing {
                field: "content".to_string(),
            }))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: SpaceResult<()> = with_retry(&fast(), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SpaceError::from(StorageError::TransactionFailed {
                reason: "busy".to_string(),
            }))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
