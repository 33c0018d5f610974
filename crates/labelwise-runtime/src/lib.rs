//! # labelwise-runtime
//!
//! Async labeling runtime for labelwise.
//!
//! This crate performs every judge call. The arithmetic (soft labels,
//! temperature, voting) lives in `labelwise-core` and stays deterministic;
//! this crate adds what talking to model backends needs:
//! - A shared permit pool bounding in-flight requests
//! - Per-call timeouts, retry with backoff, circuit breaking
//! - Strategy judges, cost-aware cascades, batch orchestration
//!
//! ## Example
//!
//! ```rust,ignore
//! use labelwise_core::LabelingConfig;
//! use labelwise_runtime::{BackendRegistry, Orchestrator};
//!
//! let config = LabelingConfig::from_file("labeling.yaml")?;
//! let orchestrator = Orchestrator::from_config(&config, &BackendRegistry::with_defaults())?;
//!
//! let report = orchestrator.label_batch(records).await;
//! println!("{} labeled, {} failed", report.summary.labeled, report.summary.failed_total());
//! ```

use thiserror::Error;

use labelwise_core::ConfigError;

pub mod cache;
pub mod caller;
pub mod cascade;
pub mod judge;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod resilience;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{ResponseCache, ResponseKey};
pub use caller::{ConcurrencyLimit, RateLimitedCaller};
pub use cascade::{CascadeController, CascadeError, CascadeStage};
pub use judge::{consult_all, Judge, JudgeError, StrategyJudge, UnavailableReason};
pub use orchestrator::{
    BatchReport, BatchSummary, FailureCounts, LabelCounts, LabelingPolicy, Orchestrator,
    OrchestratorBuilder,
};
pub use providers::{
    ApiCredential, BackendError, BackendFactory, BackendRegistry, ChatMessage, JudgeBackend,
};
pub use resilience::{CircuitBreaker, CircuitState, JudgeUsage, UsageSnapshot, UsageTracker};
pub use retry::{with_retry, RetryOutcome};

#[cfg(feature = "openai")]
pub use providers::{OpenAiBackend, OpenAiBackendFactory};

/// Errors from assembling the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend for judge '{judge}' could not be created: {source}")]
    Backend {
        judge: String,
        #[source]
        source: BackendError,
    },

    #[error("Unknown judge: {0}")]
    UnknownJudge(String),

    #[error("Invalid runtime setup: {0}")]
    Invalid(String),
}
