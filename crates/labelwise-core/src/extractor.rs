//! Soft label extraction.
//!
//! Turns a raw [`JudgeResponse`] into a calibrated `(label, soft_label, confidence)`
//! triple. Log-probabilities for the two label tokens are preferred; a
//! self-reported confidence is the fallback signal.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::types::{JudgeResponse, Label};

/// Soft labels are kept strictly inside (0, 1) so `logit` stays finite.
const SOFT_LABEL_EPSILON: f64 = 1e-9;

lazy_static! {
    /// A bare label token, optionally wrapped in quotes, brackets or punctuation.
    static ref LABEL_TOKEN: Regex = Regex::new(r#"^[\s"'`\[\(]*(?P<label>[01])[\s"'`\]\)\.,;:]*$"#)
        .expect("label token regex is valid");
}

/// Errors from soft label extraction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("Malformed judge response: {0}")]
    MalformedResponse(String),

    #[error("Judge response carries neither label log-probabilities nor a confidence")]
    MissingConfidence,
}

/// Parse a label token such as `"1"`, `" 0\n"` or `"[1]"`.
pub fn parse_label_token(token: &str) -> Option<Label> {
    let caps = LABEL_TOKEN.captures(token)?;
    match &caps["label"] {
        "0" => Some(Label::ReasoningRequired),
        "1" => Some(Label::NonReasoningSufficient),
        _ => None,
    }
}

/// Temperature used to soften or sharpen soft labels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Temperature(f64);

impl Temperature {
    /// Create a temperature. Must be finite and strictly positive.
    pub fn new(value: f64) -> Result<Self, ConfigError> {
        if !value.is_finite() || value <= 0.0 {
            return Err(ConfigError::InvalidConfiguration(format!(
                "temperature must be > 0, got {}",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Rescale a soft label: `sigmoid(logit(p) / T)`.
    pub fn apply(&self, soft_label: f64) -> f64 {
        if self.0 == 1.0 {
            return soft_label;
        }
        let p = soft_label.clamp(SOFT_LABEL_EPSILON, 1.0 - SOFT_LABEL_EPSILON);
        sigmoid(logit(p) / self.0)
    }
}

impl Default for Temperature {
    fn default() -> Self {
        Self(1.0)
    }
}

impl TryFrom<f64> for Temperature {
    type Error = ConfigError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Temperature> for f64 {
    fn from(t: Temperature) -> Self {
        t.0
    }
}

/// Calibrated reading of one judge response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extraction {
    pub label: Label,
    /// Probability mass on label `1`
    pub soft_label: f64,
    /// Probability mass on the chosen label
    pub confidence: f64,
}

impl Extraction {
    fn from_soft(soft_label: f64) -> Self {
        let label = Label::from_soft(soft_label);
        Self {
            label,
            soft_label,
            confidence: soft_label.max(1.0 - soft_label),
        }
    }
}

/// Converts judge responses into calibrated soft labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftLabelExtractor {
    temperature: Temperature,
}

impl SoftLabelExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extractor that post-processes every soft label with `temperature`.
    pub fn with_temperature(temperature: Temperature) -> Self {
        Self { temperature }
    }

    pub fn temperature(&self) -> Temperature {
        self.temperature
    }

    /// Extract `(label, soft_label, confidence)` from a judge response.
    pub fn extract(&self, response: &JudgeResponse) -> Result<Extraction, ExtractionError> {
        let raw = raw_soft_label(response)?;
        Ok(Extraction::from_soft(self.temperature.apply(raw)))
    }
}

/// Soft label before temperature scaling.
fn raw_soft_label(response: &JudgeResponse) -> Result<f64, ExtractionError> {
    let (logp0, logp1) = match &response.logprobs {
        Some(logprobs) => (label_logprob(logprobs, "0")?, label_logprob(logprobs, "1")?),
        None => (None, None),
    };

    match (logp0, logp1) {
        (Some(logp0), Some(logp1)) => Ok(two_way_softmax(logp0, logp1)),
        (Some(logp), None) => soft_from_confidence(Label::ReasoningRequired, logp.exp()),
        (None, Some(logp)) => soft_from_confidence(Label::NonReasoningSufficient, logp.exp()),
        (None, None) => {
            let confidence = response
                .self_reported_confidence
                .ok_or(ExtractionError::MissingConfidence)?;
            let label = parse_label_token(&response.label_token).ok_or_else(|| {
                ExtractionError::MalformedResponse(format!(
                    "unrecognized label token {:?}",
                    response.label_token
                ))
            })?;
            soft_from_confidence(label, confidence)
        }
    }
}

/// Look up a label token's log-probability, tolerating whitespace around keys.
fn label_logprob(
    logprobs: &std::collections::BTreeMap<String, f64>,
    token: &str,
) -> Result<Option<f64>, ExtractionError> {
    let found = logprobs
        .get(token)
        .or_else(|| {
            logprobs
                .iter()
                .find(|(key, _)| key.trim() == token)
                .map(|(_, value)| value)
        })
        .copied();

    match found {
        Some(logp) if logp.is_nan() || logp > 0.0 => Err(ExtractionError::MalformedResponse(
            format!("invalid log-probability {} for token {:?}", logp, token),
        )),
        other => Ok(other),
    }
}

fn soft_from_confidence(label: Label, confidence: f64) -> Result<f64, ExtractionError> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(ExtractionError::MalformedResponse(format!(
            "confidence {} outside [0, 1]",
            confidence
        )));
    }
    let soft = match label {
        Label::NonReasoningSufficient => confidence,
        Label::ReasoningRequired => 1.0 - confidence,
    };
    Ok(soft.clamp(SOFT_LABEL_EPSILON, 1.0 - SOFT_LABEL_EPSILON))
}

/// `exp(lp1) / (exp(lp0) + exp(lp1))`, evaluated without overflow.
fn two_way_softmax(logp0: f64, logp1: f64) -> f64 {
    let soft = if logp0 == f64::NEG_INFINITY && logp1 == f64::NEG_INFINITY {
        0.5
    } else {
        sigmoid(logp1 - logp0)
    };
    soft.clamp(SOFT_LABEL_EPSILON, 1.0 - SOFT_LABEL_EPSILON)
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}
