//! Retry policy and failure classification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use super::durations;
use super::ConfigError;

/// Classified judge backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    Timeout,
    ServerError,
    AuthError,
    MalformedRequest,
}

impl FailureKind {
    /// Transient failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited | FailureKind::Timeout | FailureKind::ServerError
        )
    }

    /// Fatal failures are never retried.
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Timeout => "timeout",
            FailureKind::ServerError => "server_error",
            FailureKind::AuthError => "auth_error",
            FailureKind::MalformedRequest => "malformed_request",
        };
        f.write_str(name)
    }
}

/// How transient failures are retried. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total calls per logical invocation, first attempt included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failure
    #[serde(default = "default_min_backoff", with = "durations")]
    pub min_backoff: Duration,

    /// Upper bound for any single delay
    #[serde(default = "default_max_backoff", with = "durations")]
    pub max_backoff: Duration,

    /// Failure kinds that are retried
    #[serde(default = "default_retryable")]
    pub retryable: BTreeSet<FailureKind>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(8)
}

fn default_retryable() -> BTreeSet<FailureKind> {
    [
        FailureKind::RateLimited,
        FailureKind::Timeout,
        FailureKind::ServerError,
    ]
    .into_iter()
    .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_backoff: default_min_backoff(),
            max_backoff: default_max_backoff(),
            retryable: default_retryable(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether a failure of this kind gets another attempt.
    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        kind.is_transient() && self.retryable.contains(&kind)
    }

    /// Nominal delay after failed attempt `attempt` (1-based), before jitter:
    /// `min(max_backoff, min_backoff * 2^(attempt - 1))`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.min_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "retry_policy.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.min_backoff > self.max_backoff {
            return Err(ConfigError::InvalidConfiguration(format!(
                "retry_policy.min_backoff ({:?}) exceeds max_backoff ({:?})",
                self.min_backoff, self.max_backoff
            )));
        }
        if let Some(kind) = self.retryable.iter().find(|k| k.is_fatal()) {
            return Err(ConfigError::InvalidConfiguration(format!(
                "retry_policy.retryable contains fatal failure kind '{}'",
                kind
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.is_retryable(FailureKind::Timeout));
        assert!(!policy.is_retryable(FailureKind::AuthError));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_nominal_delay_doubles_then_caps() {
        let policy = RetryPolicy {
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(100));
        assert_eq!(policy.nominal_delay(2), Duration::from_millis(200));
        assert_eq!(policy.nominal_delay(3), Duration::from_millis(350));
        assert_eq!(policy.nominal_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_fatal_kind_cannot_be_retryable() {
        let mut policy = RetryPolicy::default();
        policy.retryable.insert(FailureKind::MalformedRequest);
        assert!(matches!(
            policy.validate(),
            Err(ConfigError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let policy = RetryPolicy {
            min_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_deserialize_human_durations() {
        let policy: RetryPolicy = serde_yaml::from_str(
            "max_attempts: 5\nmin_backoff: 250ms\nmax_backoff: 2s\nretryable: [timeout]\n",
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.min_backoff, Duration::from_millis(250));
        assert_eq!(policy.max_backoff, Duration::from_secs(2));
        assert!(!policy.is_retryable(FailureKind::RateLimited));
    }
}
