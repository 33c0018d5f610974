//! Cost-aware escalation across judges.
//!
//! Steps run strictly in order, cheapest first. The first step whose
//! confidence reaches its threshold decides the record alone. When no step
//! is confident enough, the remaining full-vote judges are consulted and
//! everything collected so far is combined by weighted vote.
//!
//! The result's `strategies_consulted` lists every judge called for the
//! record, in call order, including steps that fell below their threshold
//! or produced nothing.

use std::sync::Arc;
use thiserror::Error;

use labelwise_core::{AggregationError, EnsembleResult, Record, StrategyResult, VotingEngine};

use crate::judge::{consult_all, Judge, JudgeError};

/// Errors from resolving one record through the cascade.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CascadeError {
    #[error("no judge produced a result")]
    NoJudgeAvailable { consulted: Vec<String> },

    #[error("full vote failed: {source}")]
    Aggregation {
        source: AggregationError,
        consulted: Vec<String>,
    },

    #[error("{error}")]
    Fatal {
        #[source]
        error: JudgeError,
        consulted: Vec<String>,
    },
}

impl CascadeError {
    /// Judges consulted before the cascade gave up.
    pub fn consulted(&self) -> &[String] {
        match self {
            CascadeError::NoJudgeAvailable { consulted }
            | CascadeError::Aggregation { consulted, .. }
            | CascadeError::Fatal { consulted, .. } => consulted,
        }
    }
}

/// One escalation step.
#[derive(Clone)]
pub struct CascadeStage {
    pub judge: Arc<dyn Judge>,
    pub threshold: f64,
}

impl CascadeStage {
    pub fn new(judge: Arc<dyn Judge>, threshold: f64) -> Self {
        Self { judge, threshold }
    }
}

impl std::fmt::Debug for CascadeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascadeStage")
            .field("judge", &self.judge.id())
            .field("threshold", &self.threshold)
            .finish()
    }
}

pub struct CascadeController {
    stages: Vec<CascadeStage>,
    full_vote: Vec<Arc<dyn Judge>>,
    engine: VotingEngine,
}

impl CascadeController {
    /// `engine` combines the full vote and should be in weighted mode.
    pub fn new(stages: Vec<CascadeStage>, full_vote: Vec<Arc<dyn Judge>>, engine: VotingEngine) -> Self {
        Self {
            stages,
            full_vote,
            engine,
        }
    }

    pub fn stages(&self) -> &[CascadeStage] {
        &self.stages
    }

    pub async fn resolve(&self, record: &Record) -> Result<EnsembleResult, CascadeError> {
        let mut consulted: Vec<String> = Vec::new();
        let mut collected: Vec<StrategyResult> = Vec::new();

        for (step, stage) in self.stages.iter().enumerate() {
            consulted.push(stage.judge.id().to_string());

            match stage.judge.classify(record).await {
                Ok(result) if result.confidence() >= stage.threshold => {
                    tracing::debug!(
                        record_id = %record.id,
                        judge = %stage.judge.id(),
                        step = step + 1,
                        confidence = result.confidence(),
                        threshold = stage.threshold,
                        "Cascade resolved"
                    );
                    return Ok(EnsembleResult::single(result).with_consulted(consulted));
                }
                Ok(result) => {
                    tracing::debug!(
                        record_id = %record.id,
                        judge = %stage.judge.id(),
                        step = step + 1,
                        confidence = result.confidence(),
                        threshold = stage.threshold,
                        "Below threshold, escalating"
                    );
                    collected.push(result);
                }
                Err(error @ JudgeError::Fatal { .. }) => {
                    return Err(CascadeError::Fatal { error, consulted });
                }
                Err(e) => {
                    tracing::warn!(record_id = %record.id, step = step + 1, error = %e, "Cascade step unavailable, escalating");
                }
            }
        }

        let pending: Vec<Arc<dyn Judge>> = self
            .full_vote
            .iter()
            .filter(|judge| !consulted.iter().any(|id| id == judge.id()))
            .cloned()
            .collect();
        consulted.extend(pending.iter().map(|judge| judge.id().to_string()));

        tracing::debug!(record_id = %record.id, extra_judges = pending.len(), "Cascade falling through to full vote");
        match consult_all(&pending, record).await {
            Ok(results) => collected.extend(results),
            Err(error) => return Err(CascadeError::Fatal { error, consulted }),
        }

        if collected.is_empty() {
            return Err(CascadeError::NoJudgeAvailable { consulted });
        }

        match self.engine.combine(collected) {
            Ok(ensemble) => Ok(ensemble.with_consulted(consulted)),
            Err(source) => Err(CascadeError::Aggregation { source, consulted }),
        }
    }
}

impl std::fmt::Debug for CascadeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let full_vote: Vec<&str> = self.full_vote.iter().map(|j| j.id()).collect();
        f.debug_struct("CascadeController")
            .field("stages", &self.stages)
            .field("full_vote", &full_vote)
            .field("engine", &self.engine)
            .finish()
    }
}
