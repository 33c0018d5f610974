//! Labeling configuration.
//!
//! Configurations are YAML or JSON documents. They are validated against the
//! embedded JSON Schema first, then checked semantically, so every
//! configuration error surfaces before a single record is labeled.

pub mod durations;
mod parser;
mod retry;
mod schema;

pub use parser::{
    BackendSettings, BreakerSettings, CacheSettings, CascadeStep, ConfigError, JudgeConfig,
    LabelingConfig,
};
pub use retry::{FailureKind, RetryPolicy};
pub use schema::{config_schema, validate_config_schema, SchemaError};
