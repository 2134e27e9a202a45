use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Substrings (lowercase) that mark an error message as transient.
const RETRYABLE_MARKERS: &[&str] = &[
    "rate limit",
    "secondary rate",
    "429",
    "502",
    "503",
    "504",
    "bad gateway",
    "gateway timeout",
    "service unavailable",
    "econnreset",
    "connection reset",
    "etimedout",
    "timed out",
    "timeout",
];

/// Classify an error message by looking for known transient markers.
///
/// Auth, not-found and validation failures never match and are surfaced
/// immediately by callers.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Exponential backoff: attempt `n` (0-based) waits `base * 2^n`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt cap is reached.
pub async fn with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let next = attempt.saturating_add(1);
                if next >= policy.max_attempts || !is_retryable(&e) {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    op = label,
                    attempt = next,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn classifies_transient_messages() {
        for msg in [
            "API rate limit exceeded for user",
            "HTTP 502: Bad Gateway",
            "error: 503 Service Unavailable",
            "read tcp: connection reset by peer",
            "dial tcp: i/o timeout",
            "ECONNRESET",
            "You have exceeded a secondary rate limit",
        ] {
            assert!(is_retryable_message(msg), "{msg} should be retryable");
        }
        for msg in [
            "HTTP 401: Bad credentials",
            "GraphQL: Could not resolve to an issue (repository.issue)",
            "validation failed: label name invalid",
        ] {
            assert!(!is_retryable_message(msg), "{msg} should not be retryable");
        }
    }

    #[test]
    fn delays_double() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<u32, String> = with_backoff(policy, "test", |e: &String| is_retryable_message(e), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("502 bad gateway".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_attempt_cap() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let result: Result<(), String> = with_backoff(policy, "test", |_: &String| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("timeout".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let result: Result<(), String> = with_backoff(policy, "test", |e: &String| is_retryable_message(e), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("HTTP 404: Not Found".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
