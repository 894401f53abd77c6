//! Bounded exponential retry for transient store failures.
//!
//! Before attempt `n` (1-indexed) the controller waits `2^n - 2` time units, so the
//! first attempt runs immediately and the waits grow 0, 2, 6, 14, 30, ... units.
//! Only failures that classify themselves as transient are retried; everything else
//! propagates on the spot.
//!
//! Operations handed to [`Backoff::retry`] may run more than once. They must be
//! idempotent or all-or-nothing at the partition they touch.

use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Classifies a failure as retryable or not.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Failure returned by [`Backoff::retry`].
///
/// Both variants carry the operation's own error unchanged, so callers can still match
/// on its kind after unwrapping.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt failed transiently.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// A non-transient failure; no retry was attempted after it.
    #[error(transparent)]
    Aborted(E),
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The operation's own error.
    pub fn inner(&self) -> &E {
        match self {
            RetryError::Exhausted { source, .. } => source,
            RetryError::Aborted(e) => e,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } => source,
            RetryError::Aborted(e) => e,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Retry policy: attempt cap plus the length of one backoff time unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (minimum 1).
    pub max_attempts: u32,
    /// One backoff time unit.
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            unit: Duration::from_millis(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, unit: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            unit,
        }
    }

    /// A policy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Wait before the given attempt (1-indexed): `unit * (2^attempt - 2)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u128
            .checked_shl(attempt)
            .unwrap_or(u128::MAX)
            .saturating_sub(2);
        let nanos = self.unit.as_nanos().saturating_mul(factor);
        Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
    }

    /// Sum of every wait a fully failing operation goes through.
    pub fn total_wait(&self) -> Duration {
        (1..=self.max_attempts)
            .map(|attempt| self.delay_for_attempt(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Sleeping seam, so tests can observe the schedule without waiting it out.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Backoff controller: a retry policy bound to a sleeper.
#[derive(Debug, Clone)]
pub struct Backoff<S = ThreadSleeper> {
    policy: RetryPolicy,
    sleeper: S,
}

impl Backoff<ThreadSleeper> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleeper: ThreadSleeper,
        }
    }
}

impl Default for Backoff<ThreadSleeper> {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl<S: Sleeper> Backoff<S> {
    pub fn with_sleeper(policy: RetryPolicy, sleeper: S) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// `operation` receives the 1-indexed attempt number.
    pub fn retry<T, E, F>(&self, operation: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        E: Retryable + Display + std::error::Error + 'static,
        F: FnMut(u32) -> Result<T, E>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let delay = self.policy.delay_for_attempt(attempt);
            if !delay.is_zero() {
                self.sleeper.sleep(delay);
            }

            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => return Err(RetryError::Aborted(err)),
                Err(err) if attempt >= max_attempts => {
                    warn!(operation, attempts = attempt, error = %err, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    warn!(
                        operation,
                        attempt,
                        next_delay_ms = self.policy.delay_for_attempt(attempt + 1).as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::StoreError;

    #[derive(Debug, Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl Sleeper for &RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    fn units(policy: &RetryPolicy, attempts: std::ops::RangeInclusive<u32>) -> Vec<u128> {
        attempts
            .map(|a| policy.delay_for_attempt(a).as_nanos() / policy.unit.as_nanos())
            .collect()
    }

    #[test]
    fn delays_follow_two_pow_n_minus_two() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        assert_eq!(units(&policy, 1..=5), vec![0, 2, 6, 14, 30]);
    }

    #[test]
    fn default_policy_total_wait_is_a_few_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 12);
        // sum(2^n - 2, n = 1..=12) = 8166 units of 1ms
        assert_eq!(policy.total_wait(), Duration::from_millis(8166));
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy = RetryPolicy::new(200, Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(150), Duration::from_nanos(u64::MAX));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let sleeper = RecordingSleeper::default();
        let backoff = Backoff::with_sleeper(RetryPolicy::new(5, Duration::from_millis(1)), &sleeper);

        let result = backoff.retry("append", |attempt| {
            if attempt < 3 {
                Err(StoreError::transient("contention"))
            } else {
                Ok(attempt)
            }
        });

        assert_eq!(result.unwrap(), 3);
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_millis(2), Duration::from_millis(6)]
        );
    }

    #[test]
    fn exhausted_retries_keep_the_error_kind() {
        let sleeper = RecordingSleeper::default();
        let backoff = Backoff::with_sleeper(RetryPolicy::new(5, Duration::from_millis(1)), &sleeper);
        let mut calls = 0;

        let err = backoff
            .retry::<(), _, _>("append", |_| {
                calls += 1;
                Err(StoreError::transient("network blip"))
            })
            .unwrap_err();

        assert_eq!(calls, 5);
        assert!(matches!(err, RetryError::Exhausted { attempts: 5, .. }));
        assert_eq!(err.into_inner(), StoreError::transient("network blip"));
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![2, 6, 14, 30].into_iter().map(Duration::from_millis).collect::<Vec<_>>()
        );
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let sleeper = RecordingSleeper::default();
        let backoff = Backoff::with_sleeper(RetryPolicy::default(), &sleeper);
        let mut calls = 0;

        let err = backoff
            .retry::<(), _, _>("append", |_| {
                calls += 1;
                Err(StoreError::permanent("bad payload"))
            })
            .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(err, RetryError::Aborted(StoreError::Permanent(_))));
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }
}
