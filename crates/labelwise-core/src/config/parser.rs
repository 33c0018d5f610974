//! Labeling configuration parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::durations;
use super::retry::RetryPolicy;
use super::schema::validate_config_schema;
use crate::extractor::{SoftLabelExtractor, Temperature};
use crate::strategy::{StrategyKind, ViewOptions, DEFAULT_HISTORY_TURNS};
use crate::types::PolicyKind;
use crate::voting::{StrategyWeights, VotingEngine, VotingMode};

/// Errors that can occur when loading a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    SchemaViolation(Vec<String>),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Where a judge's backend comes from. Everything besides `provider` is
/// handed to the backend factory untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendSettings {
    /// Registered backend factory name (e.g., "openai")
    pub provider: String,

    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl BackendSettings {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            settings: serde_json::Map::new(),
        }
    }

    /// Provider-specific settings as a JSON object.
    pub fn settings_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.settings.clone())
    }

    /// Sampling temperature requested from the backend, if set.
    pub fn sampling_temperature(&self) -> Option<f64> {
        self.settings
            .get("sampling_temperature")
            .and_then(serde_json::Value::as_f64)
    }
}

/// One configured judge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgeConfig {
    /// Unique judge identifier, also the key into `strategy_weights`
    pub id: String,

    /// Context policy
    pub strategy: StrategyKind,

    /// Independent calls averaged per record
    #[serde(default = "default_samples")]
    pub samples: u32,

    /// Strategy used when the record lacks fields `strategy` needs
    #[serde(default)]
    pub fallback: Option<StrategyKind>,

    /// Ask the backend for a separate explanation of each label
    #[serde(default)]
    pub rationale: bool,

    pub backend: BackendSettings,
}

fn default_samples() -> u32 {
    1
}

/// One step of a cascade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CascadeStep {
    pub judge: String,
    pub threshold: f64,
}

/// Circuit breaker settings, shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSettings {
    /// Consecutive exhausted calls before opening
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open breaker rejects calls
    #[serde(default = "default_recovery_timeout", with = "durations")]
    pub recovery_timeout: Duration,

    /// Successful half-open calls needed to close again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_success_threshold() -> u32 {
    2
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_max_entries")]
    pub max_entries: u64,

    #[serde(default = "default_ttl", with = "durations")]
    pub ttl: Duration,
}

fn default_max_entries() -> u64 {
    10_000
}

fn default_ttl() -> Duration {
    Duration::from_secs(3600)
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: default_max_entries(),
            ttl: default_ttl(),
        }
    }
}

/// A complete labeling run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelingConfig {
    /// Maximum in-flight backend calls across the whole run
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Records labeled concurrently (defaults to `concurrency_limit`)
    #[serde(default)]
    pub record_concurrency: Option<usize>,

    /// Deadline for a single backend call
    #[serde(default = "default_call_timeout", with = "durations")]
    pub call_timeout: Duration,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default)]
    pub voting_mode: VotingMode,

    #[serde(default)]
    pub strategy_weights: StrategyWeights,

    /// Calibration temperature for soft labels (must be > 0)
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Prior turns shown to history-aware strategies
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,

    pub judges: Vec<JudgeConfig>,

    #[serde(default = "default_policy")]
    pub policy: PolicyKind,

    #[serde(default)]
    pub cascade_steps: Vec<CascadeStep>,

    /// Judges consulted when a cascade runs out of confident steps
    #[serde(default)]
    pub full_vote: Vec<String>,

    #[serde(default)]
    pub circuit_breaker: BreakerSettings,

    #[serde(default)]
    pub cache: CacheSettings,
}

fn default_concurrency_limit() -> usize {
    8
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_history_turns() -> usize {
    DEFAULT_HISTORY_TURNS
}

fn default_policy() -> PolicyKind {
    PolicyKind::Voting
}

impl LabelingConfig {
    /// Parse a configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Load a configuration file, choosing the format by extension
    /// (`.json` is JSON, anything else is YAML).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        validate_config_schema(&value).map_err(ConfigError::SchemaViolation)?;
        let config: LabelingConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "concurrency_limit must be positive".to_string(),
            ));
        }
        if self.record_concurrency == Some(0) {
            return Err(ConfigError::InvalidConfiguration(
                "record_concurrency must be positive".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::InvalidConfiguration(
                "call_timeout must be positive".to_string(),
            ));
        }

        self.retry_policy.validate()?;
        self.temperature()?;

        if self.judges.is_empty() {
            return Err(ConfigError::MissingField("judges".to_string()));
        }

        let mut ids = HashSet::new();
        for judge in &self.judges {
            if judge.id.is_empty() {
                return Err(ConfigError::MissingField("judges[].id".to_string()));
            }
            if !ids.insert(judge.id.as_str()) {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "duplicate judge id '{}'",
                    judge.id
                )));
            }
            if judge.samples == 0 {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "judge '{}' must take at least one sample",
                    judge.id
                )));
            }
            if judge.samples > 1 && judge.backend.sampling_temperature() == Some(0.0) {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "judge '{}' takes {} samples at sampling_temperature 0; samples would be identical",
                    judge.id, judge.samples
                )));
            }
        }

        for (name, weight) in self.strategy_weights.iter() {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "strategy weight for '{}' must be a finite non-negative number, got {}",
                    name, weight
                )));
            }
            if !ids.contains(name.as_str()) {
                tracing::warn!(judge = %name, "strategy weight for unknown judge ignored");
            }
        }

        for step in &self.cascade_steps {
            if !ids.contains(step.judge.as_str()) {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "cascade step references unknown judge '{}'",
                    step.judge
                )));
            }
            if !(0.0..=1.0).contains(&step.threshold) {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "cascade threshold for '{}' must lie in [0, 1], got {}",
                    step.judge, step.threshold
                )));
            }
        }

        for judge in &self.full_vote {
            if !ids.contains(judge.as_str()) {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "full_vote references unknown judge '{}'",
                    judge
                )));
            }
        }

        if self.policy == PolicyKind::Cascade && self.cascade_steps.is_empty() {
            return Err(ConfigError::MissingField("cascade_steps".to_string()));
        }

        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.success_threshold == 0
        {
            return Err(ConfigError::InvalidConfiguration(
                "circuit_breaker thresholds must be positive".to_string(),
            ));
        }

        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "cache.max_entries must be positive when the cache is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Look up a judge by id.
    pub fn judge(&self, id: &str) -> Option<&JudgeConfig> {
        self.judges.iter().find(|j| j.id == id)
    }

    pub fn effective_record_concurrency(&self) -> usize {
        self.record_concurrency.unwrap_or(self.concurrency_limit)
    }

    /// Configured temperature, `1.0` when absent.
    pub fn temperature(&self) -> Result<Temperature, ConfigError> {
        self.temperature
            .map(Temperature::new)
            .transpose()
            .map(Option::unwrap_or_default)
    }

    pub fn extractor(&self) -> Result<SoftLabelExtractor, ConfigError> {
        Ok(SoftLabelExtractor::with_temperature(self.temperature()?))
    }

    pub fn view_options(&self) -> ViewOptions {
        ViewOptions {
            history_turns: self.history_turns,
        }
    }

    /// Engine for the voting policy, in the configured mode.
    pub fn voting_engine(&self) -> VotingEngine {
        VotingEngine::new(self.voting_mode, self.strategy_weights.clone())
    }

    /// Engine for a cascade's full vote, always weighted.
    pub fn full_vote_engine(&self) -> VotingEngine {
        VotingEngine::weighted(self.strategy_weights.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOTING_YAML: &str = r#"
concurrency_limit: 4
call_timeout: 20s
retry_policy:
  max_attempts: 4
  min_backoff: 100ms
  max_backoff: 2s
voting_mode: confidence_weighted
strategy_weights:
  history: 1.5
temperature: 1.3
judges:
  - id: plain
    strategy: text_only
    backend:
      provider: openai
      model: gpt-4o-mini
  - id: history
    strategy: text_plus_history
    samples: 3
    fallback: text_only
    backend:
      provider: openai
policy: voting
"#;

    #[test]
    fn test_parse_voting_config() {
        let config = LabelingConfig::from_yaml(VOTING_YAML).unwrap();
        assert_eq!(config.concurrency_limit, 4);
        assert_eq!(config.effective_record_concurrency(), 4);
        assert_eq!(config.call_timeout, Duration::from_secs(20));
        assert_eq!(config.retry_policy.max_attempts, 4);
        assert_eq!(config.voting_mode, VotingMode::ConfidenceWeighted);
        assert_eq!(config.strategy_weights.weight("history"), 1.5);
        assert_eq!(config.strategy_weights.weight("plain"), 1.0);
        assert_eq!(config.judges.len(), 2);
        assert_eq!(config.judges[1].samples, 3);
        assert_eq!(config.judges[1].fallback, Some(StrategyKind::TextOnly));
        assert_eq!(
            config.judges[0].backend.settings_value()["model"],
            "gpt-4o-mini"
        );
        assert_eq!(config.extractor().unwrap().temperature().value(), 1.3);
    }

    #[test]
    fn test_defaults() {
        let config = LabelingConfig::from_yaml(
            "judges:\n  - id: a\n    strategy: text_only\n    backend: { provider: openai }\n",
        )
        .unwrap();
        assert_eq!(config.concurrency_limit, 8);
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.history_turns, 6);
        assert_eq!(config.policy, PolicyKind::Voting);
        assert_eq!(config.voting_mode, VotingMode::Weighted);
        assert_eq!(config.judges[0].samples, 1);
        assert!(!config.cache.enabled);
        assert_eq!(config.extractor().unwrap().temperature().value(), 1.0);
    }

    #[test]
    fn test_from_json() {
        let json = r#"{"judges":[{"id":"a","strategy":"full_context","backend":{"provider":"openai"}}],"policy":"single"}"#;
        let config = LabelingConfig::from_json(json).unwrap();
        assert_eq!(config.policy, PolicyKind::Single);
        assert_eq!(config.judges[0].strategy, StrategyKind::FullContext);
    }

    #[test]
    fn test_schema_violation_reported() {
        let err = LabelingConfig::from_yaml("concurrency_limit: 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::SchemaViolation(_)));
    }

    #[test]
    fn test_non_positive_temperature_rejected() {
        let yaml = "temperature: 0\njudges:\n  - id: a\n    strategy: text_only\n    backend: { provider: openai }\n";
        assert!(matches!(
            LabelingConfig::from_yaml(yaml),
            Err(ConfigError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_duplicate_judge_rejected() {
        let yaml = r#"
judges:
  - { id: a, strategy: text_only, backend: { provider: openai } }
  - { id: a, strategy: full_context, backend: { provider: openai } }
"#;
        let err = LabelingConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_cascade_requires_steps() {
        let yaml = r#"
policy: cascade
judges:
  - { id: a, strategy: text_only, backend: { provider: openai } }
"#;
        let err = LabelingConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(ref f) if f == "cascade_steps"));
    }

    #[test]
    fn test_cascade_unknown_judge_rejected() {
        let yaml = r#"
policy: cascade
judges:
  - { id: a, strategy: text_only, backend: { provider: openai } }
cascade_steps:
  - { judge: b, threshold: 0.9 }
"#;
        assert!(matches!(
            LabelingConfig::from_yaml(yaml),
            Err(ConfigError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_full_vote_unknown_judge_rejected() {
        let yaml = r#"
judges:
  - { id: a, strategy: text_only, backend: { provider: openai } }
full_vote: [a, z]
"#;
        assert!(LabelingConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_from_file_picks_format_by_extension() {
        let dir = std::env::temp_dir();
        let json_path = dir.join(format!("labelwise-config-{}.json", std::process::id()));
        fs::write(
            &json_path,
            r#"{"judges":[{"id":"a","strategy":"text_only","backend":{"provider":"openai"}}]}"#,
        )
        .unwrap();
        let config = LabelingConfig::from_file(&json_path).unwrap();
        assert_eq!(config.judges[0].id, "a");
        fs::remove_file(&json_path).unwrap();

        let missing = LabelingConfig::from_file(dir.join("labelwise-does-not-exist.yaml"));
        assert!(matches!(missing, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_multi_sample_at_zero_temperature_rejected() {
        let yaml = r#"
judges:
  - id: a
    strategy: text_only
    samples: 5
    backend: { provider: openai, sampling_temperature: 0 }
"#;
        match LabelingConfig::from_yaml(yaml) {
            Err(ConfigError::InvalidConfiguration(msg)) => assert!(msg.contains("'a'")),
            other => panic!("expected invalid configuration, got {:?}", other.map(|_| ())),
        }

        let single = yaml.replace("samples: 5", "samples: 1");
        assert!(LabelingConfig::from_yaml(&single).is_ok());
        let warm = yaml.replace("sampling_temperature: 0", "sampling_temperature: 0.8");
        let config = LabelingConfig::from_yaml(&warm).unwrap();
        assert_eq!(config.judges[0].backend.sampling_temperature(), Some(0.8));
    }

    #[test]
    fn test_rationale_flag() {
        let yaml = r#"
judges:
  - { id: a, strategy: text_only, rationale: true, backend: { provider: openai } }
  - { id: b, strategy: text_only, backend: { provider: openai } }
"#;
        let config = LabelingConfig::from_yaml(yaml).unwrap();
        assert!(config.judges[0].rationale);
        assert!(!config.judges[1].rationale);
    }
}
