//! Resilience patterns for labelwise-runtime.
//!
//! This module provides:
//! - Circuit breaker per judge backend
//! - Per-judge usage accounting

mod circuit_breaker;
mod usage;

pub use circuit_breaker::{CircuitBreaker, CircuitCheck, CircuitState};
pub use usage::{JudgeUsage, UsageSnapshot, UsageTracker};
