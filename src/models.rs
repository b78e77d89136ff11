use crate::{DlnError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;

/// One labelled record from a batch. `metadata` carries task-specific fields
/// (e.g. answer options) consumed by the prompt templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Example {
    pub input: String,
    pub gold: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Example {
    #[tracing::instrument(skip_all)]
    pub fn new(input: impl Into<String>, gold: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            gold: gold.into(),
            metadata: serde_json::json!({}),
        }
    }

    /// Answer options rendered into `{options}` placeholders, if the task
    /// carries any.
    pub fn options(&self) -> Option<&str> {
        self.metadata.get("options").and_then(|v| v.as_str())
    }
}

/// Ordered set of label prototypes. A class-constrained forward pass may only
/// output one of these; they are also the negative pool for contrastive
/// scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputClasses {
    protos: Vec<String>,
}

impl OutputClasses {
    #[tracing::instrument(skip_all)]
    pub fn new(protos: Vec<String>) -> Result<Self> {
        if protos.is_empty() {
            return Err(DlnError::InvalidArgument(
                "output classes must be non-empty".to_string(),
            ));
        }
        for p in &protos {
            if p.trim().is_empty() {
                return Err(DlnError::InvalidArgument(
                    "output class prototype must be non-empty".to_string(),
                ));
            }
        }
        Ok(Self { protos })
    }

    pub fn protos(&self) -> &[String] {
        &self.protos
    }

    pub fn len(&self) -> usize {
        self.protos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protos.is_empty()
    }

    /// Index of the prototype matching `label` after trimming, if any.
    pub fn position(&self, label: &str) -> Option<usize> {
        let needle = label.trim();
        self.protos.iter().position(|p| p.trim() == needle)
    }
}

/// One posterior draw for one example: the sampled rationale text and its
/// log-probability under the approximate posterior. The prior log-probability
/// is scored separately. Ephemeral, scoped to one forward pass.
#[derive(Debug, Clone)]
pub struct HiddenSample {
    pub text: String,
    pub log_q: f64,
}

/// Provenance of a proposed replacement prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// The layer's pre-step weight, always in the pool so a step can no-op.
    Current,
    /// Freshly proposed by the prompt sampler.
    Sampled,
    /// Retrieved from the historical memory pool.
    Memory,
}

/// A proposed replacement prompt awaiting scoring/acceptance. Ephemeral,
/// scoped to one optimization step.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub text: String,
    pub source: CandidateSource,
}

impl Candidate {
    pub fn current(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: CandidateSource::Current,
        }
    }
}

/// Aggregated evidence lower bound for a batch with its two additive
/// components: the hidden-layer term and the class-layer term.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ElboEstimate {
    pub value: f64,
    pub elbo1: f64,
    pub elbo2: f64,
}

/// Outcome of one candidate's ranking pass, kept for the result log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub layer: u8,
    pub text: String,
    pub source: CandidateSource,
    pub score: Option<f64>,
    pub divergence: Option<f64>,
    pub accepted: bool,
}

/// What one optimization step produced. The caller decides whether to apply
/// the returned weights (they may equal the pre-step weights).
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub elbo: ElboEstimate,
    pub weight1: String,
    pub weight2: String,
    pub loss: f64,
    pub candidates: Vec<CandidateRecord>,
    /// Examples excluded from the batch ELBO because every hidden sample
    /// failed. Surfaced for observability, never an error.
    pub excluded_examples: usize,
}

/// Per-iteration record handed to the metrics sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub weights: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
    pub candidates: Vec<CandidateRecord>,
}

/// Final report of a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOutcome {
    pub run_id: Ulid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub best_weight1: String,
    pub best_weight2: String,
    pub best_dev_acc: f64,
    pub test_acc: Option<f64>,
    pub train_cost: u64,
    pub test_cost: u64,
    pub iterations_run: usize,
    pub cancelled: bool,
}

impl TrainOutcome {
    #[tracing::instrument(skip_all)]
    pub fn new() -> Self {
        Self {
            run_id: Ulid::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            best_weight1: String::new(),
            best_weight2: String::new(),
            best_dev_acc: 0.0,
            test_acc: None,
            train_cost: 0,
            test_cost: 0,
            iterations_run: 0,
            cancelled: false,
        }
    }

    #[tracing::instrument(skip_all)]
    pub fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

impl Default for TrainOutcome {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject NaN/inf before they poison a running average or a ranking.
#[tracing::instrument(skip_all)]
pub fn require_finite(value: f64) -> Result<f64> {
    if !value.is_finite() {
        return Err(DlnError::Unexpected(format!(
            "non-finite value produced: {value}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_classes_reject_empty() {
        assert!(OutputClasses::new(vec![]).is_err());
        assert!(OutputClasses::new(vec!["yes".into(), " ".into()]).is_err());
    }

    #[test]
    fn output_classes_position_trims() {
        let c = OutputClasses::new(vec!["positive".into(), "negative".into()]).unwrap();
        assert_eq!(c.position(" negative "), Some(1));
        assert_eq!(c.position("neutral"), None);
    }

    #[test]
    fn require_finite_rejects_nan() {
        assert!(require_finite(f64::NAN).is_err());
        assert!(require_finite(0.5).is_ok());
    }
}
