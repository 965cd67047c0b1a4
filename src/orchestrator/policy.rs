//! What to do after a page attempt fails.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::PageError;

/// Retry budget and failure tolerance for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per page, including the first. Values below 1 act as 1.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Record failing pages as skipped instead of stopping the run.
    #[serde(default)]
    pub skip_errors: bool,
    /// Delay before the first retry; doubles with each further retry.
    #[serde(default = "default_retry_delay", with = "duration_secs")]
    pub retry_delay: Duration,
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            skip_errors: false,
            retry_delay: default_retry_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_delay.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDisposition {
    Retry,
    Skip,
    Abort,
}

/// Decide the fate of a page whose attempt number `attempt` (1-based) failed with `error`.
///
/// Transient failures are retried while attempts remain. Failures tied to the
/// page itself are never retried.
pub fn decide(error: &PageError, attempt: u32, policy: &RetryPolicy) -> PageDisposition {
    if !error.is_skip_eligible() && attempt < policy.max_attempts() {
        return PageDisposition::Retry;
    }

    if policy.skip_errors {
        PageDisposition::Skip
    } else {
        PageDisposition::Abort
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error() -> PageError {
        PageError::Api {
            status: Some(500),
            message: "HTTP 500".to_string(),
        }
    }

    fn policy(max_retries: u32, skip_errors: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            skip_errors,
            retry_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_transient_errors_retry_while_attempts_remain() {
        let p = policy(3, false);
        assert_eq!(decide(&api_error(), 1, &p), PageDisposition::Retry);
        assert_eq!(decide(&api_error(), 2, &p), PageDisposition::Retry);
        assert_eq!(decide(&api_error(), 3, &p), PageDisposition::Abort);

        let unexpected = PageError::Unexpected("disk full".to_string());
        assert_eq!(decide(&unexpected, 1, &p), PageDisposition::Retry);
    }

    #[test]
    fn test_exhausted_transient_errors_skip_when_allowed() {
        assert_eq!(decide(&api_error(), 2, &policy(2, true)), PageDisposition::Skip);
        assert_eq!(decide(&api_error(), 2, &policy(2, false)), PageDisposition::Abort);
    }

    #[test]
    fn test_page_failures_never_retry() {
        let errors = [
            PageError::Timeout {
                limit: Duration::from_secs(120),
            },
            PageError::RepetitionDetected { consecutive: 6 },
            PageError::TokenLimitExceeded { limit: 8192 },
        ];
        for error in &errors {
            assert_eq!(decide(error, 1, &policy(5, true)), PageDisposition::Skip);
            assert_eq!(decide(error, 1, &policy(5, false)), PageDisposition::Abort);
        }
    }

    #[test]
    fn test_zero_retries_means_one_attempt() {
        let p = policy(0, true);
        assert_eq!(p.max_attempts(), 1);
        assert_eq!(decide(&api_error(), 1, &p), PageDisposition::Skip);
    }

    #[test]
    fn test_backoff_doubles() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let p: RetryPolicy = toml::from_str("skip_errors = true\nretry_delay = 0.5").unwrap();
        assert_eq!(p.max_retries, 2);
        assert!(p.skip_errors);
        assert_eq!(p.retry_delay, Duration::from_millis(500));
    }
}
