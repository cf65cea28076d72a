//! Retry budget and exponential backoff for chunk fetches and probes.
//!
//! Errors are sorted into [`FailureType`]s. Permanent failures never retry;
//! transient and rate-limited ones retry until the budget is spent, waiting
//! `base * 2^(n-1)` (capped) plus jitter, or the server's `Retry-After`.
//!
//! ```
//! use transfer_core::download::{DownloadError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::with_retry_budget(3);
//! let error = DownloadError::http_status("https://example.com/a.jpg", 503);
//! assert!(matches!(
//!     policy.should_retry(classify_error(&error), 1),
//!     RetryDecision::Retry { attempt: 2, .. }
//! ));
//! ```

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::DownloadError;
use super::rate_limiter::{RateLimiter, parse_retry_after};
use crate::config::DEFAULT_RETRY_BUDGET;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Classification of request failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, connection reset.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, invalid URL, ignored range request.
    Permanent,

    /// Server rate limiting (HTTP 429).
    RateLimited,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the request after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry the request.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Retry budget with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry budget plus the first attempt.
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_BUDGET + 1,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `retry_budget` retries after the first attempt.
    #[must_use]
    pub fn new(retry_budget: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: retry_budget.saturating_add(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Creates a policy with a custom retry budget, using defaults for other settings.
    #[must_use]
    pub fn with_retry_budget(retry_budget: u32) -> Self {
        Self {
            max_attempts: retry_budget.saturating_add(1),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn retry_budget(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Determines whether to retry after `attempt` (1-indexed) failed.
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure".to_string(),
            };
        }
        if attempt >= self.max_attempts {
            debug!(attempt, "retry budget exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("retry budget of {} exhausted", self.retry_budget()),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(attempt, ?failure_type, delay_ms = delay.as_millis(), "scheduling retry");
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Full retry decision for a concrete error.
    ///
    /// A parseable `Retry-After` replaces the computed backoff and is recorded
    /// with the limiter so the whole domain backs off.
    pub fn decide(
        &self,
        error: &DownloadError,
        attempt: u32,
        limiter: &RateLimiter,
        url: &str,
    ) -> RetryDecision {
        match self.should_retry(classify_error(error), attempt) {
            RetryDecision::Retry { attempt, delay } => {
                let delay = extract_retry_after_delay(error, url, limiter).unwrap_or(delay);
                RetryDecision::Retry { delay, attempt }
            }
            decision @ RetryDecision::DoNotRetry { .. } => decision,
        }
    }

    /// `min(base * 2^(attempt-1), max)` plus up to half the base as jitter.
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
            .saturating_add(self.calculate_jitter())
    }

    fn calculate_jitter(&self) -> Duration {
        let max_jitter_ms = u64::try_from(self.base_delay.as_millis() / 2).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms))
    }
}

/// Server-requested delay carried by `error`, recorded against the domain.
fn extract_retry_after_delay(
    error: &DownloadError,
    url: &str,
    rate_limiter: &RateLimiter,
) -> Option<Duration> {
    let DownloadError::HttpStatus {
        retry_after: Some(header),
        ..
    } = error
    else {
        return None;
    };
    let delay = parse_retry_after(header)?;
    rate_limiter.record_rate_limit(url, delay);
    Some(delay)
}

/// Sleeps for `delay` unless the token fires first.
///
/// # Errors
///
/// Returns [`DownloadError::Canceled`] when canceled.
pub async fn backoff(delay: Duration, cancel: &CancellationToken) -> Result<(), DownloadError> {
    tokio::select! {
        () = cancel.cancelled() => Err(DownloadError::Canceled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Failure type of `error`. Anything local to this process (storage,
/// bookkeeping, integrity, cancellation) is permanent.
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => match *status {
            429 => FailureType::RateLimited,
            408 | 500..=599 => FailureType::Transient,
            _ => FailureType::Permanent,
        },
        DownloadError::Timeout { .. }
        | DownloadError::Network { .. }
        | DownloadError::ShortBody { .. } => FailureType::Transient,
        DownloadError::InvalidUrl { .. }
        | DownloadError::RangeIgnored { .. }
        | DownloadError::Integrity { .. }
        | DownloadError::MissingPart { .. }
        | DownloadError::Storage(_)
        | DownloadError::Store(_)
        | DownloadError::Canceled => FailureType::Permanent,
    }
}
