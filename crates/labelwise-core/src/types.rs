//! Data model shared by the core and runtime crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Binary decision produced by a judge or an ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Label {
    /// `0`: the record needs a reasoning model.
    ReasoningRequired,
    /// `1`: a non-reasoning model is sufficient.
    NonReasoningSufficient,
}

impl Label {
    /// Resolve a soft label with the 0.5 threshold.
    ///
    /// Exactly 0.5 resolves to `ReasoningRequired`: the costlier branch wins ties.
    pub fn from_soft(soft_label: f64) -> Self {
        if soft_label > 0.5 {
            Label::NonReasoningSufficient
        } else {
            Label::ReasoningRequired
        }
    }

    /// The token a judge emits for this label.
    pub fn token(&self) -> &'static str {
        match self {
            Label::ReasoningRequired => "0",
            Label::NonReasoningSufficient => "1",
        }
    }
}

impl From<Label> for u8 {
    fn from(label: Label) -> Self {
        match label {
            Label::ReasoningRequired => 0,
            Label::NonReasoningSufficient => 1,
        }
    }
}

impl TryFrom<u8> for Label {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Label::ReasoningRequired),
            1 => Ok(Label::NonReasoningSufficient),
            other => Err(format!("label must be 0 or 1, got {}", other)),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A prior conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Speaker role ("user", "assistant", ...)
    pub role: String,

    /// Turn text
    pub text: String,
}

impl Turn {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
        }
    }
}

/// Optional context attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordContext {
    /// Prior turns, oldest first
    #[serde(default)]
    pub turns: Vec<Turn>,

    /// Behavioral metrics (e.g. session length, regeneration count)
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

/// One unit of input: a conversation turn to be labeled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable, unique identifier
    pub id: String,

    /// Current user message
    pub text: String,

    /// Prior turns and/or behavioral metrics
    #[serde(default)]
    pub context: Option<RecordContext>,
}

impl Record {
    /// Create a text-only record.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            context: None,
        }
    }

    /// Attach prior turns.
    pub fn with_turns(mut self, turns: Vec<Turn>) -> Self {
        self.context.get_or_insert_with(RecordContext::default).turns = turns;
        self
    }

    /// Attach behavioral metrics.
    pub fn with_metrics(mut self, metrics: BTreeMap<String, f64>) -> Self {
        self.context.get_or_insert_with(RecordContext::default).metrics = metrics;
        self
    }

    /// Prior turns, empty when absent.
    pub fn turns(&self) -> &[Turn] {
        self.context.as_ref().map(|c| c.turns.as_slice()).unwrap_or(&[])
    }

    /// Behavioral metrics, if any were recorded.
    pub fn metrics(&self) -> Option<&BTreeMap<String, f64>> {
        self.context
            .as_ref()
            .map(|c| &c.metrics)
            .filter(|m| !m.is_empty())
    }
}

/// Token accounting reported by a judge backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,

    /// Tokens in the completion
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Total tokens used.
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Raw answer of a judge backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResponse {
    /// Discrete label token, expected to be "0" or "1"
    pub label_token: String,

    /// Log-probabilities keyed by token
    #[serde(default)]
    pub logprobs: Option<BTreeMap<String, f64>>,

    /// Confidence the judge reported for its own label
    #[serde(default)]
    pub self_reported_confidence: Option<f64>,

    /// Token usage for this call
    #[serde(default)]
    pub usage: TokenUsage,
}

impl JudgeResponse {
    /// Response carrying log-probabilities for both label tokens.
    pub fn with_logprobs(label_token: impl Into<String>, logp0: f64, logp1: f64) -> Self {
        let mut logprobs = BTreeMap::new();
        logprobs.insert("0".to_string(), logp0);
        logprobs.insert("1".to_string(), logp1);
        Self {
            label_token: label_token.into(),
            logprobs: Some(logprobs),
            self_reported_confidence: None,
            usage: TokenUsage::default(),
        }
    }

    /// Response carrying only a hard label and a self-reported confidence.
    pub fn with_confidence(label_token: impl Into<String>, confidence: f64) -> Self {
        Self {
            label_token: label_token.into(),
            logprobs: None,
            self_reported_confidence: Some(confidence),
            usage: TokenUsage::default(),
        }
    }
}

/// Outcome of one judge invocation (possibly averaged over several samples).
///
/// Fields are private so the probability invariants established by
/// [`StrategyResult::new`] cannot be broken after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyResult {
    label: Label,
    confidence: f64,
    soft_label: f64,
    source_strategy: String,
    #[serde(rename = "latency_ms", with = "duration_millis")]
    latency: Duration,
    attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rationale: Option<String>,
}

impl StrategyResult {
    /// Build a result. The hard label is derived from `soft_label`;
    /// probabilities are clamped into `[0, 1]`.
    pub fn new(
        soft_label: f64,
        confidence: f64,
        source_strategy: impl Into<String>,
        latency: Duration,
        attempt: u32,
    ) -> Self {
        let soft_label = clamp_unit(soft_label);
        Self {
            label: Label::from_soft(soft_label),
            confidence: clamp_unit(confidence),
            soft_label,
            source_strategy: source_strategy.into(),
            latency,
            attempt,
            rationale: None,
        }
    }

    /// Attach a post-hoc explanation of the label.
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn label(&self) -> Label {
        self.label
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Probability mass on label `1`.
    pub fn soft_label(&self) -> f64 {
        self.soft_label
    }

    /// Identifier of the judge that produced this result.
    pub fn source_strategy(&self) -> &str {
        &self.source_strategy
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Retries consumed (0 when the first call succeeded).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn rationale(&self) -> Option<&str> {
        self.rationale.as_deref()
    }
}

/// A single ballot for the voting engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vote {
    pub label: Label,
    pub confidence: f64,
    pub weight: f64,
}

impl Vote {
    pub fn new(label: Label, confidence: f64, weight: f64) -> Self {
        Self {
            label,
            confidence,
            weight,
        }
    }

    /// Derive a vote from a judge result with a static weight.
    pub fn from_result(result: &StrategyResult, weight: f64) -> Self {
        Self::new(result.label(), result.confidence(), weight)
    }
}

/// Final decision for one record after aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    label: Label,
    soft_label: f64,
    confidence: f64,
    agreement: bool,
    contributing_results: Vec<StrategyResult>,

    /// Every judge called for the record, including ones that produced no
    /// usable result or were escalated past
    #[serde(default)]
    consulted: Vec<String>,
}

impl EnsembleResult {
    /// Terminal result made of a single judge result.
    pub fn single(result: StrategyResult) -> Self {
        Self {
            label: result.label(),
            soft_label: result.soft_label(),
            confidence: result.confidence(),
            agreement: true,
            consulted: vec![result.source_strategy().to_string()],
            contributing_results: vec![result],
        }
    }

    /// Replace the consulted judges when more were called than contributed.
    pub fn with_consulted(mut self, consulted: Vec<String>) -> Self {
        self.consulted = consulted;
        self
    }

    /// Assemble a voted result. Returns `None` when `contributing_results` is empty.
    pub(crate) fn voted(
        label: Label,
        soft_label: f64,
        confidence: f64,
        agreement: bool,
        contributing_results: Vec<StrategyResult>,
    ) -> Option<Self> {
        if contributing_results.is_empty() {
            return None;
        }
        let consulted = contributing_results
            .iter()
            .map(|r| r.source_strategy().to_string())
            .collect();
        Some(Self {
            label,
            soft_label: clamp_unit(soft_label),
            confidence: clamp_unit(confidence),
            agreement,
            contributing_results,
            consulted,
        })
    }

    pub fn label(&self) -> Label {
        self.label
    }

    pub fn soft_label(&self) -> f64 {
        self.soft_label
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// True iff every contributing result produced the same label.
    pub fn agreement(&self) -> bool {
        self.agreement
    }

    /// Results actually consulted, in consultation order.
    pub fn contributing_results(&self) -> &[StrategyResult] {
        &self.contributing_results
    }

    /// Identifiers of the judges that were consulted, in call order.
    pub fn strategies_consulted(&self) -> &[String] {
        &self.consulted
    }

    /// Rationale of the most confident contributing result that agrees
    /// with the final label.
    pub fn rationale(&self) -> Option<&str> {
        self.contributing_results
            .iter()
            .filter(|r| r.label() == self.label && r.rationale().is_some())
            .max_by(|a, b| a.confidence().total_cmp(&b.confidence()))
            .and_then(StrategyResult::rationale)
    }
}

/// How the final decision for a record was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Single,
    Voting,
    Cascade,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Single => write!(f, "single"),
            PolicyKind::Voting => write!(f, "voting"),
            PolicyKind::Cascade => write!(f, "cascade"),
        }
    }
}

/// A labeled record handed to the persistence sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledRecord {
    pub id: String,
    pub hard_label: Label,
    pub soft_label: f64,
    pub confidence: f64,
    pub agreement: bool,
    pub strategies_consulted: Vec<String>,
    pub policy: PolicyKind,

    /// Judge results behind the decision, for cost and accuracy audits
    pub results: Vec<StrategyResult>,

    /// Post-hoc explanation of the final label, when a judge produced one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,

    pub labeled_at: DateTime<Utc>,
}

impl LabeledRecord {
    pub fn new(id: impl Into<String>, ensemble: EnsembleResult, policy: PolicyKind) -> Self {
        Self {
            id: id.into(),
            hard_label: ensemble.label(),
            soft_label: ensemble.soft_label(),
            confidence: ensemble.confidence(),
            agreement: ensemble.agreement(),
            strategies_consulted: ensemble.strategies_consulted().to_vec(),
            policy,
            rationale: ensemble.rationale().map(str::to_string),
            results: ensemble.contributing_results,
            labeled_at: Utc::now(),
        }
    }
}

/// Broad class of a per-record failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// A judge backend rejected the request outright (auth, malformed request)
    Fatal,
    /// Votes could not be combined (empty, degenerate, no judge available)
    Aggregation,
    /// The only configured judge could not produce a result
    Unavailable,
}

/// A record that could not be labeled. Surfaced to the sink, never dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub id: String,
    pub policy: PolicyKind,
    pub failure: FailureClass,
    pub error: String,
    pub strategies_consulted: Vec<String>,
    pub failed_at: DateTime<Utc>,
}

/// Per-record output of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    Labeled(LabeledRecord),
    Failed(FailedRecord),
}

impl RecordOutcome {
    pub fn id(&self) -> &str {
        match self {
            RecordOutcome::Labeled(r) => &r.id,
            RecordOutcome::Failed(r) => &r.id,
        }
    }

    pub fn is_labeled(&self) -> bool {
        matches!(self, RecordOutcome::Labeled(_))
    }

    pub fn labeled(&self) -> Option<&LabeledRecord> {
        match self {
            RecordOutcome::Labeled(r) => Some(r),
            RecordOutcome::Failed(_) => None,
        }
    }

    pub fn failed(&self) -> Option<&FailedRecord> {
        match self {
            RecordOutcome::Labeled(_) => None,
            RecordOutcome::Failed(r) => Some(r),
        }
    }
}

/// Clamp a probability into `[0, 1]`; NaN maps to 0.
pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
