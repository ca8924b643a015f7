//! Bounded retry with capped exponential backoff
//!
//! One primitive shared by every caller that needs to retry a fallible async
//! operation. Attempts are bounded by count, never by wall-clock time.

use crate::config::CrawlerConfig;
use std::future::Future;
use std::time::Duration;

/// How many times to try and how long to wait in between
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_retry_delay_ms),
            Duration::from_millis(config.max_retry_delay_ms),
        )
    }

    /// Returns the delay to wait before retry number `retry` (1-based)
    ///
    /// The base delay doubles with each retry until it reaches `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Whether a failure is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The classifier marked the failure as not retryable
    Permanent { attempts: u32, source: E },

    /// Every attempt failed transiently
    Exhausted { attempts: u32, source: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Permanent { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_source(self) -> E {
        match self {
            Self::Permanent { source, .. } | Self::Exhausted { source, .. } => source,
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or runs out of attempts
///
/// # Arguments
///
/// * `policy` - Attempt bound and backoff schedule
/// * `classify` - Decides whether an error is transient
/// * `notify` - Called with `(retry number, delay, error)` before each backoff sleep
/// * `op` - The operation; receives the 1-based attempt number
///
/// # Returns
///
/// The first successful value, or a `RetryError` carrying the last error and
/// the number of attempts made
pub async fn retry_with_backoff<T, E, Op, Fut, Classify, Notify>(
    policy: &RetryPolicy,
    classify: Classify,
    mut notify: Notify,
    mut op: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Classify: Fn(&E) -> ErrorClass,
    Notify: FnMut(u32, Duration, &E),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if classify(&error) == ErrorClass::Permanent {
            return Err(RetryError::Permanent {
                attempts: attempt,
                source: error,
            });
        }

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: error,
            });
        }

        let delay = policy.delay_for(attempt);
        notify(attempt, delay, &error);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
