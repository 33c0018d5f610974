//! # labelwise-core
//!
//! Deterministic building blocks for labeling conversation records as
//! reasoning-required (`0`) or non-reasoning-sufficient (`1`).
//!
//! This crate answers, without ever calling a model:
//! - What does a judge see for this record? ([`StrategyKind::view`])
//! - How sure was the judge? ([`SoftLabelExtractor`])
//! - What do several judges decide together? ([`VotingEngine`])
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: same responses always produce the same labels
//! 2. **No I/O**: backend calls live in `labelwise-runtime`
//! 3. **Bounded**: soft labels and confidences always lie in `[0, 1]`
//! 4. **Explicit**: degenerate vote sets are errors, never silent defaults
//!
//! ## Example
//!
//! ```rust,ignore
//! use labelwise_core::{JudgeResponse, SoftLabelExtractor, VotingEngine};
//!
//! let extraction = SoftLabelExtractor::new()
//!     .extract(&JudgeResponse::with_logprobs("1", -2.1, -0.2))?;
//! assert_eq!(extraction.label, Label::NonReasoningSufficient);
//! ```

pub mod config;
pub mod extractor;
pub mod strategy;
pub mod types;
pub mod voting;

// Re-export main types at crate root
pub use config::{
    BackendSettings, BreakerSettings, CacheSettings, CascadeStep, ConfigError, FailureKind,
    JudgeConfig, LabelingConfig, RetryPolicy,
};
pub use extractor::{
    parse_label_token, Extraction, ExtractionError, SoftLabelExtractor, Temperature,
};
pub use strategy::{MissingFields, PromptView, RecordField, StrategyKind, ViewOptions};
pub use types::{
    EnsembleResult, FailedRecord, FailureClass, JudgeResponse, Label, LabeledRecord,
    PolicyKind, Record, RecordContext, RecordOutcome, StrategyResult, TokenUsage, Turn, Vote,
};
pub use voting::{AggregationError, StrategyWeights, VoteOutcome, VotingEngine, VotingMode};
