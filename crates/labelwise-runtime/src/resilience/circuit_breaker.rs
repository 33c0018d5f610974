//! Circuit breaker per judge backend.
//!
//! Repeated exhausted calls open a backend's circuit for `recovery_timeout`;
//! a fatal failure (bad credentials, rejected request) trips it for good, so
//! later calls fail fast instead of hammering a backend that cannot succeed.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use labelwise_core::BreakerSettings;

/// State of one backend's circuit.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitState {
    /// Normal operation
    Closed { failures: u32 },

    /// Calls are rejected until the recovery timeout passes
    Open { opened_at: Instant },

    /// Letting trial calls through to check recovery
    HalfOpen { successes: u32 },

    /// Permanently halted after a fatal failure
    Tripped { reason: String },
}

/// Whether a call may go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitCheck {
    Allow,
    Reject { reason: String },
}

/// Circuit breaker keyed by backend instance.
pub struct CircuitBreaker {
    states: RwLock<HashMap<String, CircuitState>>,
    settings: BreakerSettings,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Decide whether a call to `backend` may proceed.
    pub fn check(&self, backend: &str) -> CircuitCheck {
        let mut states = self.states.write();
        match states.get(backend) {
            Some(CircuitState::Tripped { reason }) => CircuitCheck::Reject {
                reason: reason.clone(),
            },
            Some(CircuitState::Open { opened_at }) => {
                let remaining = self
                    .settings
                    .recovery_timeout
                    .saturating_sub(opened_at.elapsed());
                if remaining.is_zero() {
                    states.insert(backend.to_string(), CircuitState::HalfOpen { successes: 0 });
                    tracing::info!(backend, "Circuit half-open, allowing trial calls");
                    CircuitCheck::Allow
                } else {
                    CircuitCheck::Reject {
                        reason: format!("circuit open for another {:?}", round_millis(remaining)),
                    }
                }
            }
            _ => CircuitCheck::Allow,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, backend: &str) {
        let mut states = self.states.write();
        match states.get(backend).cloned() {
            Some(CircuitState::HalfOpen { successes }) => {
                if successes + 1 >= self.settings.success_threshold {
                    states.insert(backend.to_string(), CircuitState::Closed { failures: 0 });
                    tracing::info!(backend, "Circuit closed after successful recovery");
                } else {
                    states.insert(
                        backend.to_string(),
                        CircuitState::HalfOpen {
                            successes: successes + 1,
                        },
                    );
                }
            }
            Some(CircuitState::Closed { failures }) if failures > 0 => {
                states.insert(backend.to_string(), CircuitState::Closed { failures: 0 });
            }
            _ => {}
        }
    }

    /// Record a call whose transient failures outlasted the retry policy.
    pub fn record_failure(&self, backend: &str) {
        let mut states = self.states.write();
        match states.get(backend).cloned() {
            state @ (None | Some(CircuitState::Closed { .. })) => {
                let failures = match state {
                    Some(CircuitState::Closed { failures }) => failures + 1,
                    _ => 1,
                };
                if failures >= self.settings.failure_threshold {
                    states.insert(
                        backend.to_string(),
                        CircuitState::Open {
                            opened_at: Instant::now(),
                        },
                    );
                    tracing::warn!(backend, failures, "Circuit opened after repeated failures");
                } else {
                    states.insert(backend.to_string(), CircuitState::Closed { failures });
                }
            }
            Some(CircuitState::HalfOpen { .. }) => {
                states.insert(
                    backend.to_string(),
                    CircuitState::Open {
                        opened_at: Instant::now(),
                    },
                );
                tracing::warn!(backend, "Circuit reopened after failed recovery attempt");
            }
            Some(CircuitState::Open { .. }) | Some(CircuitState::Tripped { .. }) => {}
        }
    }

    /// Halt `backend` for the rest of the run.
    pub fn trip(&self, backend: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(backend, reason = %reason, "Circuit tripped, backend halted");
        self.states
            .write()
            .insert(backend.to_string(), CircuitState::Tripped { reason });
    }

    pub fn state(&self, backend: &str) -> CircuitState {
        self.states
            .read()
            .get(backend)
            .cloned()
            .unwrap_or(CircuitState::Closed { failures: 0 })
    }

    /// Backends currently halted or open, for the batch summary.
    pub fn unhealthy_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .states
            .read()
            .iter()
            .filter(|(_, state)| {
                matches!(state, CircuitState::Open { .. } | CircuitState::Tripped { .. })
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Reset all circuits to closed.
    pub fn reset(&self) {
        self.states.write().clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

fn round_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerSettings {
            failure_threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
            success_threshold: 1,
        })
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.check("openai/gpt-4o"), CircuitCheck::Allow);
        assert_eq!(cb.state("openai/gpt-4o"), CircuitState::Closed { failures: 0 });
    }

    #[test]
    fn test_circuit_opens_after_failures() {
        let cb = breaker(2, 60_000);

        cb.record_failure("a");
        assert_eq!(cb.check("a"), CircuitCheck::Allow);

        cb.record_failure("a");
        assert!(matches!(cb.check("a"), CircuitCheck::Reject { .. }));
        assert_eq!(cb.unhealthy_backends(), vec!["a".to_string()]);
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = breaker(3, 60_000);
        cb.record_failure("a");
        cb.record_failure("a");
        cb.record_success("a");
        cb.record_failure("a");
        cb.record_failure("a");
        assert_eq!(cb.check("a"), CircuitCheck::Allow);
    }

    #[test]
    fn test_backends_are_independent() {
        let cb = breaker(1, 60_000);
        cb.record_failure("a");
        assert!(matches!(cb.check("a"), CircuitCheck::Reject { .. }));
        assert_eq!(cb.check("b"), CircuitCheck::Allow);
    }

    #[test]
    fn test_recovery_through_half_open() {
        let cb = breaker(1, 0);
        cb.record_failure("a");
        assert_eq!(cb.check("a"), CircuitCheck::Allow);
        assert_eq!(cb.state("a"), CircuitState::HalfOpen { successes: 0 });

        cb.record_success("a");
        assert_eq!(cb.state("a"), CircuitState::Closed { failures: 0 });
    }

    #[test]
    fn test_failed_half_open_call_reopens() {
        let cb = breaker(1, 0);
        cb.record_failure("a");
        assert_eq!(cb.check("a"), CircuitCheck::Allow);
        cb.record_failure("a");
        assert!(matches!(cb.state("a"), CircuitState::Open { .. }));
    }

    #[test]
    fn test_trip_is_permanent() {
        let cb = breaker(5, 0);
        cb.trip("a", "Authentication failed: invalid key");

        cb.record_success("a");
        cb.record_failure("a");
        match cb.check("a") {
            CircuitCheck::Reject { reason } => assert!(reason.contains("invalid key")),
            CircuitCheck::Allow => panic!("tripped backend must stay halted"),
        }

        cb.reset();
        assert_eq!(cb.check("a"), CircuitCheck::Allow);
    }
}
