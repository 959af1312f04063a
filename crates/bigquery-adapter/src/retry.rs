//! Bounded retry with exponential backoff and connection-reopen side effects.
//!
//! This is pure control flow: it knows how to classify an [`AdapterError`]
//! and when to give up, but nothing about the remote service behind the
//! operation it wraps.

use std::thread;
use std::time::{Duration, Instant};

use bigquery_common::{AdapterError, AdapterErrorKind, AdapterResult};
use tracing::debug;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAXIMUM_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Propagate immediately, never retry.
    Fatal,
    /// Retry on the backoff schedule.
    Retryable,
    /// Retry, but close and reopen the connection first.
    RetryableReopen,
}

/// Classify a failure. Unknown kinds are fatal: when in doubt, fail closed.
pub fn classify(error: &AdapterError) -> ErrorClass {
    use AdapterErrorKind::*;
    match error.kind() {
        ConnectionReset | ConnectionLost => ErrorClass::RetryableReopen,
        ServerError | BadGateway | RateLimitExceeded => ErrorClass::Retryable,
        Forbidden if error.has_reason("rateLimitExceeded") => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never less than 1.
    pub max_attempts: u32,
    /// Wall-clock budget across all attempts and sleeps.
    pub deadline: Option<Duration>,
    pub initial_delay: Duration,
    pub maximum_delay: Duration,
}

impl RetryPolicy {
    /// Build a policy from a configured retry count. A retry count of zero
    /// means one attempt with no retrying.
    pub fn from_job_retries(retries: u32, deadline: Option<Duration>) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            deadline,
            initial_delay: DEFAULT_INITIAL_DELAY,
            maximum_delay: DEFAULT_MAXIMUM_DELAY,
        }
    }

    pub fn no_retry() -> Self {
        Self::from_job_retries(0, None)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_job_retries(1, None)
    }
}

/// Delay before the retry following failed attempt `attempt` (zero-based):
/// `initial * 2^attempt`, capped at `maximum`.
pub fn backoff_delay(initial: Duration, maximum: Duration, attempt: u32) -> Duration {
    initial
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(maximum)
}

/// The full backoff schedule as a restartable sequence.
pub fn backoff_delays(initial: Duration, maximum: Duration) -> impl Iterator<Item = Duration> {
    (0u32..).map(move |attempt| backoff_delay(initial, maximum, attempt))
}

/// Run `op` under `policy`. On each failure: classify; stop on a fatal
/// class, exhausted attempts, or an elapsed deadline, propagating the
/// failure unchanged. A reopen-required failure invokes `on_reopen` exactly
/// once before the next attempt.
pub fn run<T, F, R>(policy: &RetryPolicy, mut on_reopen: R, mut op: F) -> AdapterResult<T>
where
    F: FnMut() -> AdapterResult<T>,
    R: FnMut(&AdapterError) -> AdapterResult<()>,
{
    let started = Instant::now();
    let mut failed_attempts = 0u32;
    loop {
        let error = match op() {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        failed_attempts += 1;
        if classify(&error) == ErrorClass::Fatal || failed_attempts >= policy.max_attempts {
            return Err(error);
        }

        let delay = backoff_delay(
            policy.initial_delay,
            policy.maximum_delay,
            failed_attempts - 1,
        );
        if let Some(deadline) = policy.deadline
            && started.elapsed() + delay >= deadline
        {
            return Err(error);
        }

        if classify(&error) == ErrorClass::RetryableReopen {
            on_reopen(&error)?;
        }

        debug!(
            attempt = failed_attempts,
            max_attempts = policy.max_attempts,
            "retrying after error: {error}"
        );
        thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(retries: u32, deadline: Option<Duration>) -> RetryPolicy {
        RetryPolicy {
            max_attempts: retries.saturating_add(1),
            deadline,
            initial_delay: Duration::ZERO,
            maximum_delay: Duration::ZERO,
        }
    }

    fn retryable() -> AdapterError {
        AdapterError::new(AdapterErrorKind::ServerError, "boom")
    }

    fn reopenable() -> AdapterError {
        AdapterError::new(AdapterErrorKind::ConnectionReset, "reset")
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&retryable()), ErrorClass::Retryable);
        assert_eq!(classify(&reopenable()), ErrorClass::RetryableReopen);
        assert_eq!(
            classify(&AdapterError::new(AdapterErrorKind::BadRequest, "nope")),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify(&AdapterError::new(AdapterErrorKind::Timeout, "slow")),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify(&AdapterError::new(AdapterErrorKind::Internal, "???")),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_classify_rate_limited_forbidden_is_retryable() {
        use bigquery_common::ErrorDetail;
        let plain = AdapterError::new(AdapterErrorKind::Forbidden, "denied");
        assert_eq!(classify(&plain), ErrorClass::Fatal);

        let rate_limited = AdapterError::new(AdapterErrorKind::Forbidden, "denied")
            .with_details(vec![ErrorDetail::new(Some("rateLimitExceeded"), "slow down")]);
        assert_eq!(classify(&rate_limited), ErrorClass::Retryable);
    }

    #[test]
    fn test_backoff_schedule_doubles_and_caps() {
        let delays: Vec<_> =
            backoff_delays(Duration::from_secs(1), Duration::from_secs(3))
                .take(5)
                .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
    }

    #[test]
    fn test_run_stops_at_max_attempts() {
        let attempts = Cell::new(0u32);
        let result: AdapterResult<()> = run(&fast_policy(2, None), |_| Ok(()), || {
            attempts.set(attempts.get() + 1);
            Err(retryable())
        });
        assert!(result.is_err());
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_run_zero_retries_means_single_attempt() {
        let attempts = Cell::new(0u32);
        let result: AdapterResult<()> = run(&fast_policy(0, None), |_| Ok(()), || {
            attempts.set(attempts.get() + 1);
            Err(retryable())
        });
        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_run_fatal_stops_immediately() {
        let attempts = Cell::new(0u32);
        let result: AdapterResult<()> = run(&fast_policy(5, None), |_| Ok(()), || {
            attempts.set(attempts.get() + 1);
            Err(AdapterError::new(AdapterErrorKind::NotFound, "missing"))
        });
        assert_eq!(result.unwrap_err().kind(), AdapterErrorKind::NotFound);
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_run_deadline_stops_retrying() {
        let attempts = Cell::new(0u32);
        let result: AdapterResult<()> = run(
            &fast_policy(10, Some(Duration::ZERO)),
            |_| Ok(()),
            || {
                attempts.set(attempts.get() + 1);
                Err(retryable())
            },
        );
        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_run_reopens_exactly_once_per_reopenable_failure() {
        let reopens = Cell::new(0u32);
        let attempts = Cell::new(0u32);
        let result = run(
            &fast_policy(3, None),
            |_| {
                reopens.set(reopens.get() + 1);
                Ok(())
            },
            || {
                attempts.set(attempts.get() + 1);
                if attempts.get() < 3 {
                    Err(reopenable())
                } else {
                    Ok(attempts.get())
                }
            },
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(reopens.get(), 2);
    }

    #[test]
    fn test_run_plain_retryable_never_reopens() {
        let reopens = Cell::new(0u32);
        let attempts = Cell::new(0u32);
        let result = run(
            &fast_policy(3, None),
            |_| {
                reopens.set(reopens.get() + 1);
                Ok(())
            },
            || {
                attempts.set(attempts.get() + 1);
                if attempts.get() == 1 {
                    Err(retryable())
                } else {
                    Ok(())
                }
            },
        );
        assert!(result.is_ok());
        assert_eq!(reopens.get(), 0);
    }

    #[test]
    fn test_run_succeeds_first_try() {
        let result = run(&RetryPolicy::default(), |_| Ok(()), || Ok(42));
        assert_eq!(result.unwrap(), 42);
    }
}
