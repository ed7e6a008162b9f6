//! Retry and reconnect policies.
//!
//! Two policies live here:
//! - [`RetryPolicy`]: bounded retries with exponential backoff and jitter,
//!   used for idempotent REST reads.
//! - [`ReconnectPolicy`]: the fixed-delay reconnect schedule of the event
//!   stream client.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::stream::client::StreamDefaults;

/// Bounded retry policy for request/response calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Computes the delay to apply after the given failed attempt.
    ///
    /// `attempt` is 1-based.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            jitter: Duration::from_millis(50),
        }
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// policy runs out of attempts.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "retry_attempt_failed",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Reconnect schedule for the event stream.
///
/// The delay is constant: no growth and no jitter. With
/// `max_consecutive_failures` unset the stream retries until it is
/// disconnected or the server ends it for good.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait between a failure and the next connection attempt.
    pub delay: Duration,
    /// Consecutive failures (without an open in between) after which the
    /// stream gives up. `None` retries forever.
    pub max_consecutive_failures: Option<usize>,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_consecutive_failures: None,
        }
    }

    pub fn with_max_consecutive_failures(mut self, limit: usize) -> Self {
        self.max_consecutive_failures = Some(limit);
        self
    }

    /// Whether another attempt is allowed after `failures` consecutive
    /// failures.
    pub fn allows_retry_after(&self, failures: usize) -> bool {
        self.max_consecutive_failures
            .map_or(true, |limit| failures < limit)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(StreamDefaults::RECONNECT_DELAY)
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
