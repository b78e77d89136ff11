use crate::{DlnError, Result};

/// Normalize a raw model prediction before comparison: first line only,
/// surrounding punctuation stripped, lowercased.
#[tracing::instrument(skip_all)]
pub fn postprocess_prediction(raw: &str) -> String {
    let first_line = raw.trim().lines().next().unwrap_or("");
    first_line
        .trim()
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LossKind {
    /// 0.0 when the postprocessed prediction equals the gold label, else 1.0.
    ExactMatch,
    /// 0.0 when the postprocessed prediction contains the gold label.
    Contains,
}

/// A named per-example loss in [0, 1]. Selected by configuration string; an
/// unknown name fails at construction.
#[derive(Debug, Clone)]
pub struct Loss {
    name: &'static str,
    kind: LossKind,
}

impl Loss {
    #[tracing::instrument(skip_all)]
    pub fn from_name(name: &str) -> Result<Self> {
        let (name, kind) = match name {
            "exact_match_loss" => ("exact_match_loss", LossKind::ExactMatch),
            "contains_loss" => ("contains_loss", LossKind::Contains),
            other => {
                return Err(DlnError::InvalidConfig(format!(
                    "unknown loss function: {other}; available: {:?}",
                    Self::available()
                )))
            }
        };
        Ok(Self { name, kind })
    }

    pub fn available() -> &'static [&'static str] {
        &["exact_match_loss", "contains_loss"]
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Loss for one (prediction, gold) pair.
    pub fn one(&self, prediction: &str, gold: &str) -> f64 {
        let pred = postprocess_prediction(prediction);
        let gold = postprocess_prediction(gold);
        let hit = match self.kind {
            LossKind::ExactMatch => pred == gold,
            LossKind::Contains => pred.contains(&gold),
        };
        if hit {
            0.0
        } else {
            1.0
        }
    }

    /// Per-example losses for a batch; lengths must agree.
    #[tracing::instrument(skip_all)]
    pub fn per_example(&self, predictions: &[String], golds: &[String]) -> Result<Vec<f64>> {
        if predictions.len() != golds.len() {
            return Err(DlnError::InvalidArgument(format!(
                "predictions/golds length mismatch: {} vs {}",
                predictions.len(),
                golds.len()
            )));
        }
        Ok(predictions
            .iter()
            .zip(golds)
            .map(|(p, g)| self.one(p, g))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postprocess_strips_and_lowercases() {
        assert_eq!(postprocess_prediction("  Positive.\nbecause..."), "positive");
        assert_eq!(postprocess_prediction("\"(Yes)\""), "yes");
    }

    #[test]
    fn exact_match_loss_values() {
        let loss = Loss::from_name("exact_match_loss").unwrap();
        assert_eq!(loss.one("Positive.", "positive"), 0.0);
        assert_eq!(loss.one("negative", "positive"), 1.0);
    }

    #[test]
    fn contains_loss_values() {
        let loss = Loss::from_name("contains_loss").unwrap();
        assert_eq!(loss.one("the answer is yes", "yes"), 0.0);
        assert_eq!(loss.one("the answer is no", "yes"), 1.0);
    }

    #[test]
    fn unknown_name_is_config_error() {
        assert!(matches!(
            Loss::from_name("squared_error"),
            Err(DlnError::InvalidConfig(_))
        ));
    }

    #[test]
    fn batch_accuracy_arithmetic() {
        let loss = Loss::from_name("exact_match_loss").unwrap();
        let preds = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let golds = vec!["a".to_string(), "x".to_string(), "c".to_string()];
        let losses = loss.per_example(&preds, &golds).unwrap();
        assert_eq!(losses, vec![0.0, 1.0, 0.0]);
        let acc = 1.0 - losses.iter().sum::<f64>() / losses.len() as f64;
        assert!((acc - 2.0 / 3.0).abs() < 1e-9);
    }
}
