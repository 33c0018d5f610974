//! Strategies: what a judge sees before classifying.
//!
//! Each strategy builds a [`PromptView`] from a record. Building a view is a
//! pure function; a strategy whose required fields are absent fails fast with
//! [`MissingFields`] instead of guessing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::types::{Record, Turn};

/// Default number of prior turns shown to history-aware strategies.
pub const DEFAULT_HISTORY_TURNS: usize = 6;

/// Record fields a strategy can depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    History,
    Metrics,
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordField::History => write!(f, "history"),
            RecordField::Metrics => write!(f, "metrics"),
        }
    }
}

/// A strategy cannot build its view from this record.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{strategy} requires {missing:?} on record {record_id}")]
pub struct MissingFields {
    pub strategy: StrategyKind,
    pub record_id: String,
    pub missing: Vec<RecordField>,
}

/// Closed set of context policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Current message only
    TextOnly,
    /// Current message plus behavioral metrics
    TextPlusMetrics,
    /// Current message plus prior turns
    TextPlusHistory,
    /// Current message, prior turns and metrics
    FullContext,
}

impl StrategyKind {
    /// All strategies, cheapest view first.
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::TextOnly,
        StrategyKind::TextPlusMetrics,
        StrategyKind::TextPlusHistory,
        StrategyKind::FullContext,
    ];

    /// Record fields this strategy cannot do without.
    pub fn required_fields(&self) -> &'static [RecordField] {
        match self {
            StrategyKind::TextOnly => &[],
            StrategyKind::TextPlusMetrics => &[RecordField::Metrics],
            StrategyKind::TextPlusHistory => &[RecordField::History],
            StrategyKind::FullContext => &[RecordField::History, RecordField::Metrics],
        }
    }

    /// Build the view a judge sees for `record`.
    pub fn view(&self, record: &Record, options: &ViewOptions) -> Result<PromptView, MissingFields> {
        let missing: Vec<RecordField> = self
            .required_fields()
            .iter()
            .copied()
            .filter(|field| match field {
                RecordField::History => record.turns().is_empty(),
                RecordField::Metrics => record.metrics().is_none(),
            })
            .collect();

        if !missing.is_empty() {
            return Err(MissingFields {
                strategy: *self,
                record_id: record.id.clone(),
                missing,
            });
        }

        let wants = |field: RecordField| self.required_fields().contains(&field);

        let history = if wants(RecordField::History) {
            let turns = record.turns();
            let start = turns.len().saturating_sub(options.history_turns);
            Some(turns[start..].to_vec())
        } else {
            None
        };

        let metrics = if wants(RecordField::Metrics) {
            record.metrics().cloned()
        } else {
            None
        };

        Ok(PromptView {
            strategy: *self,
            record_id: record.id.clone(),
            text: record.text.clone(),
            history,
            metrics,
        })
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::TextOnly => "text_only",
            StrategyKind::TextPlusMetrics => "text_plus_metrics",
            StrategyKind::TextPlusHistory => "text_plus_history",
            StrategyKind::FullContext => "full_context",
        };
        f.write_str(name)
    }
}

/// Knobs for view construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewOptions {
    /// Most recent prior turns kept for history-aware strategies
    pub history_turns: usize,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            history_turns: DEFAULT_HISTORY_TURNS,
        }
    }
}

/// What a judge backend is asked to classify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptView {
    pub strategy: StrategyKind,
    pub record_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<Turn>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, f64>>,
}

impl PromptView {
    /// Stable key for response caching. Excludes the record id so identical
    /// content from different records shares an entry.
    pub fn cache_key(&self) -> String {
        let mut key = format!("{}\u{1f}{}", self.strategy, self.text);
        if let Some(history) = &self.history {
            for turn in history {
                key.push('\u{1f}');
                key.push_str(&turn.role);
                key.push(':');
                key.push_str(&turn.text);
            }
        }
        if let Some(metrics) = &self.metrics {
            for (name, value) in metrics {
                key.push('\u{1f}');
                key.push_str(&format!("{}={}", name, value));
            }
        }
        key
    }
}
