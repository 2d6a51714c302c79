//! Retry policy and a generic async retry wrapper.

use std::future::Future;
use std::time::Duration;

use clubsync_core::config::QueueConfig;
use clubsync_core::task::CollectionSettings;

/// Bounded exponential backoff: `base_delay * multiplier^(n-1)` before retry `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: multiplier.max(1),
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, 1)
    }

    /// Per-entity fetch policy from a task's collection settings.
    pub fn from_settings(settings: &CollectionSettings) -> Self {
        Self::new(
            settings.retry_attempts.saturating_add(1),
            Duration::from_secs(u64::from(settings.retry_delay_minutes) * 60),
            2,
        )
    }

    /// Job-level policy for the queue.
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_secs(config.base_delay_secs),
            config.multiplier,
        )
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1);
        let factor = self.multiplier.checked_pow(exp).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30), 2)
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `retryable` decides per error whether another attempt makes sense; the
/// last error is returned once attempts run out.
pub async fn retry_with<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    label: &str,
    retryable: R,
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
            Err(e) if policy.should_retry(attempt) && retryable(&e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "🔁 {label} failed (attempt {attempt}/{}): {e}; retrying in {}s",
                    policy.max_attempts,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
