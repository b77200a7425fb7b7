//! Same-key retry with backoff
//!
//! Separate from key rotation: a call site can wrap its own operation in
//! `retry_with_backoff` before handing it to `Rotator::execute`, so one key is
//! retried a few times before the rotator moves on to the next key.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tracing::debug;

use crate::classify::{FailureClass, FailureClassifier, KeyFailure};

/// Extra wait added per prior attempt when the service reports throttling.
const RATE_LIMIT_STEP: Duration = Duration::from_secs(5);

/// How often and how long to retry one key.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retrying.
    pub max_attempts: u32,
    /// First delay of the exponential schedule.
    pub base_delay: Duration,
    /// Cap for the exponential schedule.
    pub max_delay: Duration,
    /// Wait after a rate-limit or other transient failure.
    pub rate_limit_delay: Duration,
    /// Add up to a quarter of the delay at random.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(64),
            rate_limit_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the next attempt after `failed` attempts have failed,
    /// without jitter.
    pub fn delay_for(&self, failed: u32, class: FailureClass) -> Duration {
        match class {
            FailureClass::Retryable => self.rate_limit_delay + RATE_LIMIT_STEP * failed,
            _ => {
                let exp = failed.saturating_sub(1).min(16);
                self.base_delay
                    .saturating_mul(1u32 << exp)
                    .min(self.max_delay)
            }
        }
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let spread = (delay.as_millis() / 4) as u64;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=spread))
    }
}

/// Run `operation` up to `policy.max_attempts` times on the same key.
///
/// Auth failures return immediately: retrying a rejected key cannot help and
/// the rotator needs to see the error to invalidate it. Transient failures
/// wait `rate_limit_delay` (growing per attempt); anything else follows the
/// exponential schedule. The last error is returned unchanged.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    classifier: &FailureClassifier,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: KeyFailure,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut failed = 0u32;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        failed += 1;

        let message = err.to_string();
        let class = classifier.classify_error(&err);
        if class == FailureClass::Auth || failed >= max_attempts {
            return Err(err);
        }

        let delay = policy.with_jitter(policy.delay_for(failed, class));
        debug!(
            attempt = failed,
            max_attempts,
            class = class.label(),
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "retrying on the same key"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            rate_limit_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    /// Fails with `message` for the first `failures` calls, then succeeds.
    fn flaky(
        counter: &Arc<AtomicU32>,
        failures: u32,
        message: &'static str,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, String>> {
        let counter = counter.clone();
        move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures {
                Err(message.to_string())
            } else {
                Ok(n)
            })
        }
    }

    #[test]
    fn exponential_schedule_is_capped() {
        let policy = fast_policy();
        assert_eq!(policy.delay_for(1, FailureClass::Fatal), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, FailureClass::Fatal), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, FailureClass::Fatal), Duration::from_millis(250));
        assert_eq!(policy.delay_for(40, FailureClass::Fatal), Duration::from_millis(250));
    }

    #[test]
    fn rate_limit_schedule_grows_per_attempt() {
        let policy = fast_policy();
        assert_eq!(policy.delay_for(1, FailureClass::Retryable), Duration::from_secs(6));
        assert_eq!(policy.delay_for(2, FailureClass::Retryable), Duration::from_secs(11));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = RetryPolicy {
            jitter: true,
            ..fast_policy()
        };
        for _ in 0..50 {
            let d = policy.with_jitter(Duration::from_millis(400));
            assert!(d >= Duration::from_millis(400) && d <= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let out = retry_with_backoff(
            &fast_policy(),
            &FailureClassifier::default(),
            flaky(&counter, 2, "response contained no image data"),
        )
        .await
        .unwrap();

        assert_eq!(out, 3);
        // 100ms + 200ms of backoff on the paused clock
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_with_last_error() {
        let counter = Arc::new(AtomicU32::new(0));

        let err = retry_with_backoff(
            &fast_policy(),
            &FailureClassifier::default(),
            flaky(&counter, 10, "503 model overloaded"),
        )
        .await
        .unwrap_err();

        assert_eq!(err, "503 model overloaded");
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_is_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));

        let err = retry_with_backoff(
            &fast_policy(),
            &FailureClassifier::default(),
            flaky(&counter, 10, "API key not valid"),
        )
        .await
        .unwrap_err();

        assert_eq!(err, "API key not valid");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn none_policy_runs_once() {
        let counter = Arc::new(AtomicU32::new(0));

        let result = retry_with_backoff(
            &RetryPolicy::none(),
            &FailureClassifier::default(),
            flaky(&counter, 1, "429"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
