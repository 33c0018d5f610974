//! Runtime orchestrator for labeling record batches.
//!
//! The orchestrator applies one labeling policy to every record:
//! - Single: one judge decides
//! - Voting: judges run concurrently and the voting engine combines them
//! - Cascade: judges escalate in cost order until one is confident
//!
//! Records are labeled concurrently; a record's failure becomes a
//! [`FailedRecord`] and never stops the batch.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use labelwise_core::{
    AggregationError, EnsembleResult, FailedRecord, FailureClass, Label, LabeledRecord,
    LabelingConfig, PolicyKind, Record, RecordOutcome, VotingEngine,
};

use crate::cache::ResponseCache;
use crate::caller::{ConcurrencyLimit, RateLimitedCaller};
use crate::cascade::{CascadeController, CascadeError, CascadeStage};
use crate::judge::{consult_all, Judge, JudgeError, StrategyJudge};
use crate::providers::BackendRegistry;
use crate::resilience::{CircuitBreaker, UsageSnapshot, UsageTracker};
use crate::RuntimeError;

/// How the final label for a record is reached.
pub enum LabelingPolicy {
    Single(Arc<dyn Judge>),
    Voting {
        judges: Vec<Arc<dyn Judge>>,
        engine: VotingEngine,
    },
    Cascade(CascadeController),
}

impl LabelingPolicy {
    pub fn kind(&self) -> PolicyKind {
        match self {
            LabelingPolicy::Single(_) => PolicyKind::Single,
            LabelingPolicy::Voting { .. } => PolicyKind::Voting,
            LabelingPolicy::Cascade(_) => PolicyKind::Cascade,
        }
    }
}

impl fmt::Debug for LabelingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelingPolicy::Single(judge) => f.debug_tuple("Single").field(&judge.id()).finish(),
            LabelingPolicy::Voting { judges, engine } => {
                let ids: Vec<&str> = judges.iter().map(|j| j.id()).collect();
                f.debug_struct("Voting")
                    .field("judges", &ids)
                    .field("engine", engine)
                    .finish()
            }
            LabelingPolicy::Cascade(controller) => {
                f.debug_tuple("Cascade").field(controller).finish()
            }
        }
    }
}

/// Why a record could not be labeled.
struct RecordFailure {
    class: FailureClass,
    error: String,
    consulted: Vec<String>,
}

impl RecordFailure {
    fn new(class: FailureClass, error: impl fmt::Display, consulted: Vec<String>) -> Self {
        Self {
            class,
            error: error.to_string(),
            consulted,
        }
    }

    fn from_judge(error: JudgeError, consulted: Vec<String>) -> Self {
        let class = if error.is_fatal() {
            FailureClass::Fatal
        } else {
            FailureClass::Unavailable
        };
        Self::new(class, error, consulted)
    }
}

impl From<CascadeError> for RecordFailure {
    fn from(error: CascadeError) -> Self {
        let class = match &error {
            CascadeError::Fatal { .. } => FailureClass::Fatal,
            CascadeError::NoJudgeAvailable { .. } | CascadeError::Aggregation { .. } => {
                FailureClass::Aggregation
            }
        };
        let consulted = error.consulted().to_vec();
        Self::new(class, error, consulted)
    }
}

/// Label counts in a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCounts {
    pub reasoning_required: usize,
    pub non_reasoning_sufficient: usize,
}

/// Failed records by class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounts {
    pub fatal: usize,
    pub aggregation: usize,
    pub unavailable: usize,
}

/// Aggregate statistics for a labeling run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub labeled: usize,
    pub failed: FailureCounts,
    pub labels: LabelCounts,

    /// Labeled records whose judges all agreed
    pub agreed: usize,

    /// Sum of ensemble confidences over labeled records
    confidence_sum: f64,

    /// Sum of soft labels over labeled records
    soft_label_sum: f64,

    /// Judge backend instances (`<judge>:<backend>`) halted or open at the
    /// end of the run
    pub unhealthy_backends: Vec<String>,

    pub usage: UsageSnapshot,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchSummary {
    /// Empty summary with the run clock started now.
    pub fn begin() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Account for one outcome.
    pub fn observe(&mut self, outcome: &RecordOutcome) {
        self.total += 1;
        match outcome {
            RecordOutcome::Labeled(record) => {
                self.labeled += 1;
                match record.hard_label {
                    Label::ReasoningRequired => self.labels.reasoning_required += 1,
                    Label::NonReasoningSufficient => self.labels.non_reasoning_sufficient += 1,
                }
                if record.agreement {
                    self.agreed += 1;
                }
                self.confidence_sum += record.confidence;
                self.soft_label_sum += record.soft_label;
            }
            RecordOutcome::Failed(record) => match record.failure {
                FailureClass::Fatal => self.failed.fatal += 1,
                FailureClass::Aggregation => self.failed.aggregation += 1,
                FailureClass::Unavailable => self.failed.unavailable += 1,
            },
        }
    }

    pub fn failed_total(&self) -> usize {
        self.failed.fatal + self.failed.aggregation + self.failed.unavailable
    }

    /// Share of labeled records with unanimous judges.
    pub fn agreement_rate(&self) -> f64 {
        if self.labeled == 0 {
            0.0
        } else {
            self.agreed as f64 / self.labeled as f64
        }
    }

    pub fn mean_confidence(&self) -> f64 {
        if self.labeled == 0 {
            0.0
        } else {
            self.confidence_sum / self.labeled as f64
        }
    }

    /// Mean probability of label `1` over labeled records.
    pub fn mean_soft_label(&self) -> f64 {
        if self.labeled == 0 {
            0.0
        } else {
            self.soft_label_sum / self.labeled as f64
        }
    }

    /// Wall-clock run time, 0 until both ends of the run are known.
    pub fn duration_seconds(&self) -> f64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
            _ => 0.0,
        }
    }

    /// Records processed per second of run time.
    pub fn records_per_second(&self) -> f64 {
        let seconds = self.duration_seconds();
        if seconds > 0.0 {
            self.total as f64 / seconds
        } else {
            0.0
        }
    }
}

/// Outcomes of a batch plus its summary.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub outcomes: Vec<RecordOutcome>,
    pub summary: BatchSummary,
}

/// Labels records under one policy.
pub struct Orchestrator {
    policy: LabelingPolicy,
    record_concurrency: usize,
    usage: Arc<UsageTracker>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl Orchestrator {
    pub fn builder(policy: LabelingPolicy) -> OrchestratorBuilder {
        OrchestratorBuilder::new(policy)
    }

    /// Build the whole pipeline from a configuration.
    ///
    /// Every judge gets its own backend from `registry`; all of them share one
    /// permit pool, retry policy, circuit breaker and usage tracker.
    pub fn from_config(
        config: &LabelingConfig,
        registry: &BackendRegistry,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let limit = ConcurrencyLimit::new(config.concurrency_limit);
        let retry_policy = Arc::new(config.retry_policy.clone());
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let usage = Arc::new(UsageTracker::new());
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(ResponseCache::from_settings(&config.cache)));
        let extractor = config.extractor()?;
        let view_options = config.view_options();

        let mut judges: BTreeMap<&str, Arc<dyn Judge>> = BTreeMap::new();
        for judge_config in &config.judges {
            let backend = registry
                .create(
                    &judge_config.backend.provider,
                    &judge_config.backend.settings_value(),
                )
                .map_err(|source| RuntimeError::Backend {
                    judge: judge_config.id.clone(),
                    source,
                })?;

            let mut caller = RateLimitedCaller::new(
                &judge_config.id,
                backend,
                limit.clone(),
                retry_policy.clone(),
                config.call_timeout,
            )
            .with_breaker(breaker.clone())
            .with_usage(usage.clone());
            if let (Some(cache), 1) = (&cache, judge_config.samples) {
                caller = caller.with_cache(cache.clone());
            }

            let mut judge = StrategyJudge::new(&judge_config.id, judge_config.strategy, caller)
                .with_samples(judge_config.samples as usize)
                .with_view_options(view_options)
                .with_extractor(extractor)
                .with_rationale(judge_config.rationale);
            if let Some(fallback) = judge_config.fallback {
                judge = judge.with_fallback(fallback);
            }

            tracing::debug!(
                judge = %judge_config.id,
                strategy = %judge_config.strategy,
                provider = %judge_config.backend.provider,
                samples = judge_config.samples,
                rationale = judge_config.rationale,
                "Judge configured"
            );
            judges.insert(judge_config.id.as_str(), Arc::new(judge));
        }

        let lookup = |id: &str| -> Result<Arc<dyn Judge>, RuntimeError> {
            judges
                .get(id)
                .cloned()
                .ok_or_else(|| RuntimeError::UnknownJudge(id.to_string()))
        };

        let policy = match config.policy {
            PolicyKind::Single => {
                let first = config
                    .judges
                    .first()
                    .ok_or_else(|| RuntimeError::Invalid("no judges configured".to_string()))?;
                LabelingPolicy::Single(lookup(&first.id)?)
            }
            PolicyKind::Voting => LabelingPolicy::Voting {
                judges: config
                    .judges
                    .iter()
                    .map(|j| lookup(&j.id))
                    .collect::<Result<_, _>>()?,
                engine: config.voting_engine(),
            },
            PolicyKind::Cascade => {
                let stages = config
                    .cascade_steps
                    .iter()
                    .map(|step| Ok(CascadeStage::new(lookup(&step.judge)?, step.threshold)))
                    .collect::<Result<Vec<_>, RuntimeError>>()?;
                // An empty full vote consults every configured judge.
                let full_vote_ids: Vec<&str> = if config.full_vote.is_empty() {
                    config.judges.iter().map(|j| j.id.as_str()).collect()
                } else {
                    config.full_vote.iter().map(String::as_str).collect()
                };
                let full_vote = full_vote_ids
                    .into_iter()
                    .map(lookup)
                    .collect::<Result<Vec<_>, _>>()?;
                LabelingPolicy::Cascade(CascadeController::new(
                    stages,
                    full_vote,
                    config.full_vote_engine(),
                ))
            }
        };

        tracing::info!(
            policy = %policy.kind(),
            judges = config.judges.len(),
            concurrency_limit = config.concurrency_limit,
            record_concurrency = config.effective_record_concurrency(),
            cache = config.cache.enabled,
            "Orchestrator configured"
        );

        Ok(OrchestratorBuilder::new(policy)
            .record_concurrency(config.effective_record_concurrency())
            .usage(usage)
            .breaker(breaker)
            .build())
    }

    pub fn policy(&self) -> &LabelingPolicy {
        &self.policy
    }

    pub fn record_concurrency(&self) -> usize {
        self.record_concurrency
    }

    pub fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }

    /// Label one record. Never fails: problems become a `Failed` outcome.
    pub async fn label(&self, record: &Record) -> RecordOutcome {
        let policy = self.policy.kind();
        match self.resolve(record).await {
            Ok(ensemble) => {
                tracing::debug!(
                    record_id = %record.id,
                    label = %ensemble.label(),
                    confidence = ensemble.confidence(),
                    agreement = ensemble.agreement(),
                    "Record labeled"
                );
                RecordOutcome::Labeled(LabeledRecord::new(&record.id, ensemble, policy))
            }
            Err(failure) => {
                tracing::warn!(
                    record_id = %record.id,
                    failure = ?failure.class,
                    error = %failure.error,
                    "Record failed"
                );
                RecordOutcome::Failed(FailedRecord {
                    id: record.id.clone(),
                    policy,
                    failure: failure.class,
                    error: failure.error,
                    strategies_consulted: failure.consulted,
                    failed_at: Utc::now(),
                })
            }
        }
    }

    async fn resolve(&self, record: &Record) -> Result<EnsembleResult, RecordFailure> {
        match &self.policy {
            LabelingPolicy::Single(judge) => judge
                .classify(record)
                .await
                .map(EnsembleResult::single)
                .map_err(|e| RecordFailure::from_judge(e, vec![judge.id().to_string()])),
            LabelingPolicy::Voting { judges, engine } => {
                let consulted: Vec<String> = judges.iter().map(|j| j.id().to_string()).collect();
                let results = consult_all(judges, record)
                    .await
                    .map_err(|e| RecordFailure::from_judge(e, consulted.clone()))?;
                if results.is_empty() {
                    return Err(RecordFailure::new(
                        FailureClass::Aggregation,
                        AggregationError::NoJudgeAvailable,
                        consulted,
                    ));
                }
                match engine.combine(results) {
                    Ok(ensemble) => Ok(ensemble.with_consulted(consulted)),
                    Err(e) => Err(RecordFailure::new(FailureClass::Aggregation, e, consulted)),
                }
            }
            LabelingPolicy::Cascade(controller) => {
                controller.resolve(record).await.map_err(RecordFailure::from)
            }
        }
    }

    /// Label a stream of records, up to `record_concurrency` at a time.
    ///
    /// Outcomes arrive in completion order, not input order.
    pub fn label_stream<'a, S>(&'a self, records: S) -> impl Stream<Item = RecordOutcome> + 'a
    where
        S: Stream<Item = Record> + 'a,
    {
        records
            .map(move |record| async move { self.label(&record).await })
            .buffer_unordered(self.record_concurrency)
    }

    /// Label every record and summarize the run.
    pub async fn label_batch(&self, records: Vec<Record>) -> BatchReport {
        let total = records.len();
        tracing::info!(records = total, policy = %self.policy.kind(), "Labeling batch");

        let mut summary = BatchSummary::begin();
        let outcomes: Vec<RecordOutcome> = self
            .label_stream(stream::iter(records))
            .inspect(|outcome| summary.observe(outcome))
            .collect()
            .await;

        self.finish(&mut summary);
        tracing::info!(
            labeled = summary.labeled,
            failed = summary.failed_total(),
            agreement_rate = summary.agreement_rate(),
            mean_confidence = summary.mean_confidence(),
            duration_seconds = summary.duration_seconds(),
            records_per_second = summary.records_per_second(),
            "Batch complete"
        );

        BatchReport { outcomes, summary }
    }

    /// Fill in run-wide fields of a summary built with [`BatchSummary::observe`]
    /// and stop its run clock.
    pub fn finish(&self, summary: &mut BatchSummary) {
        summary.finished_at = Some(Utc::now());
        summary.usage = self.usage.snapshot();
        summary.unhealthy_backends = self
            .breaker
            .as_ref()
            .map(|b| b.unhealthy_backends())
            .unwrap_or_default();
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("policy", &self.policy)
            .field("record_concurrency", &self.record_concurrency)
            .finish_non_exhaustive()
    }
}

/// Builder for programmatic orchestrator assembly.
pub struct OrchestratorBuilder {
    policy: LabelingPolicy,
    record_concurrency: usize,
    usage: Option<Arc<UsageTracker>>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl OrchestratorBuilder {
    pub fn new(policy: LabelingPolicy) -> Self {
        Self {
            policy,
            record_concurrency: 8,
            usage: None,
            breaker: None,
        }
    }

    /// Records labeled concurrently; values below 1 are treated as 1.
    pub fn record_concurrency(mut self, n: usize) -> Self {
        self.record_concurrency = n.max(1);
        self
    }

    /// Tracker shared with the judges' callers, reported in summaries.
    pub fn usage(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Breaker shared with the judges' callers, reported in summaries.
    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            policy: self.policy,
            record_concurrency: self.record_concurrency,
            usage: self.usage.unwrap_or_default(),
            breaker: self.breaker,
        }
    }
}
