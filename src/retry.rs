use rand::Rng;
use std::future::Future;
use tokio::time::{Duration, sleep};
use tracing::warn;

/// Backoff discipline for calls to the search and language-model providers.
/// Failures are classified as retryable by substring match against the error
/// text; anything else propagates immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retryable_patterns: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            retryable_patterns: [
                "rate limit",
                "rate_limit",
                "timeout",
                "timed out",
                "429",
                "500",
                "502",
                "503",
                "connection reset",
                "connection closed",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, message: &str) -> bool {
        let lowered = message.to_lowercase();
        self.retryable_patterns
            .iter()
            .any(|pattern| lowered.contains(pattern.as_str()))
    }

    /// `min(base * 2^attempt + jitter(0..30%), max_delay)`. Jitter keeps
    /// concurrently retrying scans from hammering a provider in lockstep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << attempt.min(16)) as f64;
        let jitter = exp * rand::rng().random_range(0.0..0.30);
        let total = Duration::from_millis((exp + jitter) as u64);
        total.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, the error is fatal, or retries are exhausted.
/// The last error is propagated when retries run out.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    op_name: &'static str,
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
            Err(err) => {
                if attempt >= policy.max_retries || !policy.is_retryable(&err.to_string()) {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    target = "argus.retry",
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn classifies_rate_limit_and_5xx_as_retryable() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable("HTTP 429 Too Many Requests"));
        assert!(policy.is_retryable("HTTP 503"));
        assert!(policy.is_retryable("request timed out"));
        assert!(!policy.is_retryable("HTTP 401 Unauthorized"));
        assert!(!policy.is_retryable("invalid json"));
    }

    #[test]
    fn delay_is_bounded_by_max() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            ..RetryPolicy::default()
        };
        for attempt in 0..10 {
            assert!(policy.delay_for(attempt) <= Duration::from_millis(250));
        }
    }

    #[test]
    fn delay_grows_with_attempts() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };
        // Even with maximal jitter on attempt 0 (13ms), attempt 2 is >= 40ms.
        assert!(policy.delay_for(2) > policy.delay_for(0));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retry(&fast_policy(), "test_op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("HTTP 503".to_string())
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
    async fn fatal_errors_propagate_without_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry(&fast_policy(), "test_op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("HTTP 401 Unauthorized".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry(&fast_policy(), "test_op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("HTTP 502 (call {n})")) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "HTTP 502 (call 3)");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
