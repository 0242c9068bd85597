use crate::error::ProxyError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 10_000;

/// Backoff before re-running attempt `attempt` (0-based):
/// `min(100ms * 2^n, 10s)` scaled by a uniform factor in [0.75, 1.25].
pub fn backoff_delay(attempt: u32) -> Duration {
    let capped = BASE_DELAY_MS
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
        .min(MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((capped as f64 * jitter) as u64)
}

/// Runs `attempt_fn` up to `max_retries + 1` times, sleeping between
/// retryable failures. A backoff that would overrun `deadline` fails
/// immediately with the last error.
pub async fn execute<T, F, Fut>(
    label: &str,
    max_retries: u32,
    deadline: Instant,
    mut attempt_fn: F,
) -> Result<T, ProxyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProxyError>>,
{
    let mut attempt = 0u32;
    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || attempt >= max_retries {
                    return Err(err);
                }
                let delay = backoff_delay(attempt);
                if Instant::now() + delay > deadline {
                    tracing::warn!(
                        "{}: backoff {}ms exceeds remaining budget, giving up: {}",
                        label,
                        delay.as_millis(),
                        err
                    );
                    return Err(err);
                }
                attempt += 1;
                tracing::warn!(
                    "{}: attempt {}/{} failed, retrying in {}ms: {}",
                    label,
                    attempt,
                    max_retries + 1,
                    delay.as_millis(),
                    err
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_within_jitter_bounds() {
        for attempt in 0..12 {
            let nominal = (BASE_DELAY_MS * 2u64.pow(attempt.min(16))).min(MAX_DELAY_MS);
            for _ in 0..50 {
                let delay = backoff_delay(attempt).as_millis() as u64;
                assert!(
                    delay >= nominal * 3 / 4 && delay <= nominal * 5 / 4,
                    "attempt {}: {}ms outside [{}ms, {}ms]",
                    attempt,
                    delay,
                    nominal * 3 / 4,
                    nominal * 5 / 4
                );
            }
        }
    }

    #[test]
    fn backoff_caps_at_ten_seconds() {
        let delay = backoff_delay(30);
        assert!(delay <= Duration::from_millis(MAX_DELAY_MS * 5 / 4));
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_error_runs_max_retries_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = execute(
            "test",
            3,
            Instant::now() + Duration::from_secs(600),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProxyError::RetryableStatus(503))
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = execute(
            "test",
            5,
            Instant::now() + Duration::from_secs(600),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProxyError::BadRequest("nope".to_string()))
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_runs_initial_attempt_only() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = execute(
            "test",
            0,
            Instant::now() + Duration::from_secs(600),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProxyError::Timeout)
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = execute(
            "test",
            3,
            Instant::now() + Duration::from_secs(600),
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProxyError::RetryableStatus(503))
                    } else {
                        Ok(200u16)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 200);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_exceeding_deadline_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        // Deadline shorter than the minimum first backoff (75ms).
        let result: Result<(), _> = execute(
            "test",
            5,
            Instant::now() + Duration::from_millis(10),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProxyError::RetryableStatus(502))
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
