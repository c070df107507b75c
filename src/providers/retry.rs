use crate::heal::CancelFlag;
use crate::providers::AiError;
use std::time::Duration;
use tracing::warn;

/// Maximum backoff cap to prevent excessively long waits.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Transport failures, timeouts, non-2xx statuses and rate limits are
/// transient. A misconfigured gateway fails the same way every time.
fn is_retryable(err: &AiError) -> bool {
    match err {
        AiError::Unavailable(_) | AiError::RateLimited(_) => true,
        AiError::Misconfigured(_) | AiError::Cancelled => false,
    }
}

/// Retry an async operation with exponential backoff.
///
/// Starts with `initial_delay` and doubles it each attempt, capping at 30 seconds.
/// Non-retryable errors are returned immediately. Cancelling `cancel` cuts
/// a pending backoff short with `AiError::Cancelled`.
///
/// # Arguments
/// * `max_attempts` - Total number of calls made, including the first (minimum 1)
/// * `initial_delay` - The delay before the first retry
/// * `cancel` - Interrupts the wait between attempts
/// * `f` - The async closure to retry; it is re-invoked with the same inputs
pub async fn retry_with_backoff<F, Fut, T>(
    max_attempts: u32,
    initial_delay: Duration,
    cancel: &CancelFlag,
    f: F,
) -> std::result::Result<T, AiError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, AiError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut delay = initial_delay;
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(err) => {
                if attempt >= max_attempts || !is_retryable(&err) {
                    return Err(err);
                }

                warn!(
                    attempt,
                    max_attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "AI request failed, retrying"
                );

                if !cancel.sleep(delay).await {
                    return Err(AiError::Cancelled);
                }

                delay = (delay * 2).min(MAX_DELAY);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let result = retry_with_backoff(3, Duration::from_millis(1), &CancelFlag::new(), || async {
            Ok::<_, AiError>(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retries_on_retryable_error() {
        let counter = AtomicU32::new(0);

        let result = retry_with_backoff(3, Duration::from_millis(1), &CancelFlag::new(), || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(AiError::Unavailable("503 service unavailable".into()))
                } else {
                    Ok(99)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 99);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_on_misconfiguration() {
        let counter = AtomicU32::new(0);

        let result = retry_with_backoff(3, Duration::from_millis(1), &CancelFlag::new(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(AiError::Misconfigured("no API key".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let counter = AtomicU32::new(0);

        let result = retry_with_backoff(3, Duration::from_millis(1), &CancelFlag::new(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(AiError::RateLimited("429".into())) }
        })
        .await;

        assert!(matches!(result, Err(AiError::RateLimited(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_calls_once() {
        let counter = AtomicU32::new(0);

        let _ = retry_with_backoff(0, Duration::from_millis(1), &CancelFlag::new(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(AiError::Unavailable("down".into())) }
        })
        .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let counter = AtomicU32::new(0);
        let cancel = CancelFlag::new();

        let started = std::time::Instant::now();
        let result = retry_with_backoff(5, Duration::from_secs(30), &cancel, || {
            counter.fetch_add(1, Ordering::SeqCst);
            cancel.cancel();
            async { Err::<i32, _>(AiError::Unavailable("503".into())) }
        })
        .await;

        assert!(matches!(result, Err(AiError::Cancelled)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
