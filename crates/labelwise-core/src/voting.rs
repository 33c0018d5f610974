//! Voting engine: combines several judge results for one record.
//!
//! # Policy (not configurable beyond the mode)
//! - Majority: label `1` only with a strict majority; ties go to `0`.
//! - Weighted: `reasoning_score = Σ w·c·[label = 0] / Σ w·c`; label `0` when the
//!   score reaches 0.5, so an even split also goes to `0`.
//! - Weighted confidence: `|reasoning_score - 0.5| · 2 · (Σ w·c / Σ w)`. The
//!   margin term is 0 on an even split; the support term keeps a unanimous but
//!   unsure panel below a unanimous, fully confident one.
//! - Aggregation failures are errors, never a silent default label.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::{EnsembleResult, Label, StrategyResult, Vote};

/// Errors from combining votes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("Cannot combine an empty vote set")]
    EmptyVoteSet,

    #[error("Degenerate vote set: total weight x confidence is zero")]
    DegenerateVoteSet,

    #[error("No judge produced a result")]
    NoJudgeAvailable,
}

/// How votes are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingMode {
    /// One vote per result, confidences ignored
    Majority,
    /// Static weight times confidence
    #[default]
    Weighted,
    /// Confidence only (every static weight is 1)
    ConfidenceWeighted,
}

/// Static per-judge weights. Judges without an entry weigh 1.0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyWeights(BTreeMap<String, f64>);

impl StrategyWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the weight for a judge.
    pub fn with(mut self, strategy: impl Into<String>, weight: f64) -> Self {
        self.0.insert(strategy.into(), weight);
        self
    }

    /// Weight for a judge id.
    pub fn weight(&self, strategy: &str) -> f64 {
        self.0.get(strategy).copied().unwrap_or(1.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, f64>> for StrategyWeights {
    fn from(map: BTreeMap<String, f64>) -> Self {
        Self(map)
    }
}

/// Label, soft label and confidence computed from a set of votes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoteOutcome {
    pub label: Label,
    /// Probability mass on label `1` implied by the votes
    pub soft_label: f64,
    pub confidence: f64,
    pub agreement: bool,
}

/// Deterministic vote combination.
#[derive(Debug, Clone, Default)]
pub struct VotingEngine {
    mode: VotingMode,
    weights: StrategyWeights,
}

impl VotingEngine {
    pub fn new(mode: VotingMode, weights: StrategyWeights) -> Self {
        Self { mode, weights }
    }

    /// Weighted engine, the mode cascades fall back to.
    pub fn weighted(weights: StrategyWeights) -> Self {
        Self::new(VotingMode::Weighted, weights)
    }

    pub fn mode(&self) -> VotingMode {
        self.mode
    }

    pub fn weights(&self) -> &StrategyWeights {
        &self.weights
    }

    /// Combine raw votes.
    pub fn tally(&self, votes: &[Vote]) -> Result<VoteOutcome, AggregationError> {
        if votes.is_empty() {
            return Err(AggregationError::EmptyVoteSet);
        }
        let agreement = votes.iter().all(|v| v.label == votes[0].label);

        match self.mode {
            VotingMode::Majority => Ok(majority(votes, agreement)),
            VotingMode::Weighted => weighted(
                votes.iter().map(|v| (v.label, v.weight, v.confidence)),
                agreement,
            ),
            VotingMode::ConfidenceWeighted => weighted(
                votes.iter().map(|v| (v.label, 1.0, v.confidence)),
                agreement,
            ),
        }
    }

    /// Combine judge results into an ensemble decision.
    pub fn combine(&self, results: Vec<StrategyResult>) -> Result<EnsembleResult, AggregationError> {
        let votes: Vec<Vote> = results
            .iter()
            .map(|r| Vote::from_result(r, self.weights.weight(r.source_strategy())))
            .collect();

        let outcome = self.tally(&votes)?;

        tracing::debug!(
            mode = ?self.mode,
            votes = votes.len(),
            label = %outcome.label,
            confidence = outcome.confidence,
            agreement = outcome.agreement,
            "Votes combined"
        );

        EnsembleResult::voted(
            outcome.label,
            outcome.soft_label,
            outcome.confidence,
            outcome.agreement,
            results,
        )
        .ok_or(AggregationError::EmptyVoteSet)
    }
}

fn majority(votes: &[Vote], agreement: bool) -> VoteOutcome {
    let total = votes.len() as f64;
    let ones = votes
        .iter()
        .filter(|v| v.label == Label::NonReasoningSufficient)
        .count() as f64;

    let label = if ones > total / 2.0 {
        Label::NonReasoningSufficient
    } else {
        Label::ReasoningRequired
    };
    let winners = match label {
        Label::NonReasoningSufficient => ones,
        Label::ReasoningRequired => total - ones,
    };

    VoteOutcome {
        label,
        soft_label: ones / total,
        confidence: winners / total,
        agreement,
    }
}

/// Ballots are `(label, static weight, confidence)`.
fn weighted(
    ballots: impl Iterator<Item = (Label, f64, f64)>,
    agreement: bool,
) -> Result<VoteOutcome, AggregationError> {
    // Per-label sums are kept apart so an even split yields exactly 0.5.
    let mut reasoning = 0.0;
    let mut non_reasoning = 0.0;
    let mut weight_total = 0.0;
    for (label, weight, confidence) in ballots {
        match label {
            Label::ReasoningRequired => reasoning += weight * confidence,
            Label::NonReasoningSufficient => non_reasoning += weight * confidence,
        }
        weight_total += weight;
    }

    let mass = reasoning + non_reasoning;
    if mass <= 0.0 || !mass.is_finite() {
        return Err(AggregationError::DegenerateVoteSet);
    }

    let reasoning_score = reasoning / mass;
    let soft_label = 1.0 - reasoning_score;
    let margin = (reasoning_score - 0.5).abs() * 2.0;
    // Weight-averaged member confidence; a unanimous vote scores exactly this.
    let support = mass / weight_total;

    Ok(VoteOutcome {
        label: Label::from_soft(soft_label),
        soft_label,
        confidence: (margin * support).clamp(0.0, 1.0),
        agreement,
    })
}
