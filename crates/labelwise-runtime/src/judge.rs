//! Judges: one strategy, one backend, one calibrated result per record.
//!
//! A [`StrategyJudge`] builds its strategy's view of the record, sends it
//! through a [`RateLimitedCaller`] and extracts a soft label from the reply.
//! With `samples > 1` it issues that many independent calls and averages
//! them, using the agreement rate of the runs as the confidence. With
//! rationales enabled, one more request asks the backend to explain the
//! final label; its failure never costs the record its label.

use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

use labelwise_core::{
    Extraction, ExtractionError, Label, MissingFields, PromptView, Record, SoftLabelExtractor,
    StrategyKind, StrategyResult, ViewOptions,
};

use crate::caller::RateLimitedCaller;
use crate::providers::BackendError;
use crate::retry::RetryOutcome;

/// Why a judge produced no result for a record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnavailableReason {
    #[error(transparent)]
    MissingFields(#[from] MissingFields),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: BackendError,
    },

    #[error("backend halted: {0}")]
    BackendHalted(String),

    #[error("unusable response: {0}")]
    Extraction(#[from] ExtractionError),
}

/// Errors from classifying one record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JudgeError {
    /// The judge has no result for this record; other judges may still vote.
    #[error("judge '{judge}' unavailable: {reason}")]
    StrategyUnavailable {
        judge: String,
        reason: UnavailableReason,
    },

    /// The backend refused the request; the record cannot be labeled.
    #[error("judge '{judge}' failed fatally: {error}")]
    Fatal { judge: String, error: BackendError },
}

impl JudgeError {
    pub fn judge(&self) -> &str {
        match self {
            JudgeError::StrategyUnavailable { judge, .. } | JudgeError::Fatal { judge, .. } => judge,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, JudgeError::Fatal { .. })
    }
}

/// Capability shared by every judge: classify one record.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Identifier used for weights, cascade steps and reports.
    fn id(&self) -> &str;

    async fn classify(&self, record: &Record) -> Result<StrategyResult, JudgeError>;
}

/// One sampled call that did not end fatally.
enum Sample {
    Extracted { extraction: Extraction, retries: u32 },
    Unavailable { reason: UnavailableReason, retries: u32 },
}

/// Judge backed by a strategy view and a rate-limited backend caller.
#[derive(Debug)]
pub struct StrategyJudge {
    id: String,
    strategy: StrategyKind,
    fallback: Option<StrategyKind>,
    samples: usize,
    options: ViewOptions,
    extractor: SoftLabelExtractor,
    rationale: bool,
    caller: RateLimitedCaller,
}

impl StrategyJudge {
    pub fn new(id: impl Into<String>, strategy: StrategyKind, caller: RateLimitedCaller) -> Self {
        Self {
            id: id.into(),
            strategy,
            fallback: None,
            samples: 1,
            options: ViewOptions::default(),
            extractor: SoftLabelExtractor::default(),
            rationale: false,
            caller,
        }
    }

    /// Strategy used when the record lacks fields the primary one needs.
    pub fn with_fallback(mut self, fallback: StrategyKind) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Independent calls per record; values below 1 are treated as 1.
    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples.max(1);
        self
    }

    pub fn with_view_options(mut self, options: ViewOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_extractor(mut self, extractor: SoftLabelExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Request an explanation of each label after classifying.
    pub fn with_rationale(mut self, enabled: bool) -> Self {
        self.rationale = enabled;
        self
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    fn unavailable(&self, reason: impl Into<UnavailableReason>) -> JudgeError {
        JudgeError::StrategyUnavailable {
            judge: self.id.clone(),
            reason: reason.into(),
        }
    }

    fn view(&self, record: &Record) -> Result<PromptView, JudgeError> {
        match self.strategy.view(record, &self.options) {
            Ok(view) => Ok(view),
            Err(missing) => match self.fallback {
                Some(fallback) => {
                    tracing::info!(
                        judge = %self.id,
                        record_id = %record.id,
                        strategy = %self.strategy,
                        fallback = %fallback,
                        "Record lacks {:?}, using fallback strategy",
                        missing.missing
                    );
                    fallback
                        .view(record, &self.options)
                        .map_err(|e| self.unavailable(e))
                }
                None => Err(self.unavailable(missing)),
            },
        }
    }

    async fn sample(&self, view: &PromptView) -> Result<Sample, JudgeError> {
        match self.caller.call(view).await {
            RetryOutcome::Success { value, attempts } => {
                let retries = attempts.saturating_sub(1);
                Ok(match self.extractor.extract(&value) {
                    Ok(extraction) => Sample::Extracted { extraction, retries },
                    Err(e) => {
                        tracing::warn!(judge = %self.id, record_id = %view.record_id, error = %e, "Unusable judge response");
                        Sample::Unavailable {
                            reason: e.into(),
                            retries,
                        }
                    }
                })
            }
            RetryOutcome::Exhausted {
                last_error: BackendError::Halted { reason, .. },
                ..
            } => Ok(Sample::Unavailable {
                reason: UnavailableReason::BackendHalted(reason),
                retries: 0,
            }),
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => Ok(Sample::Unavailable {
                reason: UnavailableReason::RetryExhausted {
                    attempts,
                    last_error,
                },
                retries: attempts.saturating_sub(1),
            }),
            RetryOutcome::Fatal { error, .. } => Err(JudgeError::Fatal {
                judge: self.id.clone(),
                error,
            }),
        }
    }
}

#[async_trait]
impl Judge for StrategyJudge {
    fn id(&self) -> &str {
        &self.id
    }

    async fn classify(&self, record: &Record) -> Result<StrategyResult, JudgeError> {
        let started = Instant::now();
        let view = self.view(record)?;

        // A fatal sample drops the sibling futures, cancelling their calls.
        let samples = try_join_all((0..self.samples).map(|_| self.sample(&view))).await?;

        let mut retries = 0;
        let mut extractions = Vec::with_capacity(samples.len());
        let mut first_failure = None;
        for sample in samples {
            match sample {
                Sample::Extracted {
                    extraction,
                    retries: r,
                } => {
                    retries += r;
                    extractions.push(extraction);
                }
                Sample::Unavailable { reason, retries: r } => {
                    retries += r;
                    first_failure.get_or_insert(reason);
                }
            }
        }

        if extractions.is_empty() {
            let reason = first_failure.unwrap_or(UnavailableReason::BackendHalted(
                "no samples produced".to_string(),
            ));
            return Err(self.unavailable(reason));
        }

        let (soft_label, confidence) = if self.samples == 1 {
            (extractions[0].soft_label, extractions[0].confidence)
        } else {
            average_samples(&extractions)
        };

        let mut result =
            StrategyResult::new(soft_label, confidence, &self.id, started.elapsed(), retries);
        if self.rationale {
            match self.caller.explain(&view, result.label()).await {
                Ok(Some(text)) => result = result.with_rationale(text),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(judge = %self.id, record_id = %record.id, error = %e, "Rationale unavailable");
                }
            }
        }

        tracing::debug!(
            judge = %self.id,
            record_id = %record.id,
            label = %result.label(),
            soft_label = result.soft_label(),
            confidence = result.confidence(),
            attempt = result.attempt(),
            "Judge classified record"
        );
        Ok(result)
    }
}

/// Run `judges` concurrently on one record and keep the results that came back.
///
/// Unavailable judges are logged and dropped. The first fatal error drops the
/// remaining futures and is returned.
pub async fn consult_all(
    judges: &[Arc<dyn Judge>],
    record: &Record,
) -> Result<Vec<StrategyResult>, JudgeError> {
    let results = try_join_all(judges.iter().map(|judge| async move {
        match judge.classify(record).await {
            Ok(result) => Ok(Some(result)),
            Err(e @ JudgeError::Fatal { .. }) => Err(e),
            Err(e) => {
                tracing::warn!(judge = %judge.id(), record_id = %record.id, error = %e, "Judge unavailable, dropping its vote");
                Ok(None)
            }
        }
    }))
    .await?;

    Ok(results.into_iter().flatten().collect())
}

/// Mean soft label and the fraction of runs agreeing with the majority
/// hard label (ties go to label 0).
fn average_samples(extractions: &[Extraction]) -> (f64, f64) {
    let n = extractions.len() as f64;
    let soft = extractions.iter().map(|e| e.soft_label).sum::<f64>() / n;

    let ones = extractions
        .iter()
        .filter(|e| e.label == Label::NonReasoningSufficient)
        .count();
    let zeros = extractions.len() - ones;
    let agreeing = if ones > zeros { ones } else { zeros };

    (soft, agreeing as f64 / n)
}
