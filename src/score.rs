use crate::models::OutputClasses;
use crate::operator::Operator;
use crate::{DlnError, Result};
use std::sync::Arc;

/// Log-probability scoring against the forward generation path.
///
/// The atomic primitive behind every ELBO term and every candidate-ranking
/// score. Per-item operator failures are reported as `None` with a warning,
/// never as a fatal error; the caller excludes them from averages.
pub struct LogProbsScore {
    operator: Arc<dyn Operator>,
}

impl LogProbsScore {
    #[tracing::instrument(skip_all)]
    pub fn new(operator: Arc<dyn Operator>) -> Self {
        Self { operator }
    }

    pub fn operator(&self) -> &Arc<dyn Operator> {
        &self.operator
    }

    /// `log p(target | context)` for each pair, batched.
    #[tracing::instrument(skip_all)]
    pub async fn score_targets(
        &self,
        contexts: &[String],
        targets: &[String],
    ) -> Result<Vec<Option<f64>>> {
        if contexts.len() != targets.len() {
            return Err(DlnError::InvalidArgument(format!(
                "contexts/targets length mismatch: {} vs {}",
                contexts.len(),
                targets.len()
            )));
        }
        let pairs: Vec<(String, String)> = contexts
            .iter()
            .cloned()
            .zip(targets.iter().cloned())
            .collect();
        let results = self.operator.score_batch(&pairs).await;
        Ok(results
            .into_iter()
            .map(|r| match r {
                Ok(logp) if logp.is_finite() => Some(logp),
                Ok(logp) => {
                    tracing::warn!(logp, "non-finite log-probability, treating as missing");
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "score call failed, treating as missing");
                    None
                }
            })
            .collect())
    }

    /// Per-context log-probability of every class prototype. An example whose
    /// class scores are not all usable comes back as `None` (a partial row
    /// cannot be normalized).
    #[tracing::instrument(skip_all)]
    pub async fn score_classes(
        &self,
        contexts: &[String],
        classes: &OutputClasses,
    ) -> Result<Vec<Option<Vec<f64>>>> {
        let k = classes.len();
        let mut flat_contexts = Vec::with_capacity(contexts.len() * k);
        let mut flat_targets = Vec::with_capacity(contexts.len() * k);
        for ctx in contexts {
            for proto in classes.protos() {
                flat_contexts.push(ctx.clone());
                flat_targets.push(proto.clone());
            }
        }
        let flat = self.score_targets(&flat_contexts, &flat_targets).await?;

        let mut out = Vec::with_capacity(contexts.len());
        for row in flat.chunks(k) {
            let full: Option<Vec<f64>> = row.iter().copied().collect();
            out.push(full);
        }
        Ok(out)
    }

    /// Contrastive ("NCE-style") score of the gold class: its log-probability
    /// normalized over the class vocabulary. Used when the forward pass is
    /// class-constrained.
    pub fn contrastive(gold_idx: usize, class_logps: &[f64]) -> f64 {
        class_logps[gold_idx] - log_sum_exp(class_logps)
    }
}

/// Numerically stable `log(sum(exp(xs)))`.
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{Completion, CostTracker, SamplingParams};
    use async_trait::async_trait;

    struct FixedScores {
        cost: CostTracker,
    }

    #[async_trait]
    impl Operator for FixedScores {
        async fn invoke(&self, _prompt: &str, _params: &SamplingParams) -> Result<Completion> {
            Ok(Completion::text("unused"))
        }

        async fn score(&self, _context: &str, target: &str) -> Result<f64> {
            self.cost.add(1);
            match target {
                "fail" => Err(DlnError::Llm("timeout".to_string())),
                "a" => Ok(-1.0),
                "b" => Ok(-2.0),
                _ => Ok(-3.0),
            }
        }

        fn cost(&self) -> &CostTracker {
            &self.cost
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn scorer() -> LogProbsScore {
        LogProbsScore::new(Arc::new(FixedScores {
            cost: CostTracker::new(),
        }))
    }

    #[tokio::test]
    async fn failed_scores_become_missing() {
        let s = scorer();
        let contexts = vec!["c".to_string(); 2];
        let targets = vec!["a".to_string(), "fail".to_string()];
        let out = s.score_targets(&contexts, &targets).await.unwrap();
        assert_eq!(out, vec![Some(-1.0), None]);
    }

    #[tokio::test]
    async fn class_row_with_failure_is_dropped_whole() {
        let s = scorer();
        let classes = OutputClasses::new(vec!["a".to_string(), "fail".to_string()]).unwrap();
        let out = s
            .score_classes(&["c".to_string()], &classes)
            .await
            .unwrap();
        assert_eq!(out, vec![None]);
    }

    #[tokio::test]
    async fn contrastive_normalizes_over_classes() {
        let s = scorer();
        let classes = OutputClasses::new(vec!["a".to_string(), "b".to_string()]).unwrap();
        let rows = s
            .score_classes(&["c".to_string()], &classes)
            .await
            .unwrap();
        let row = rows[0].as_ref().unwrap();
        let score = LogProbsScore::contrastive(0, row);
        // log p(a) - logsumexp([-1, -2]) must be a valid log-probability.
        assert!(score < 0.0);
        let norm: f64 = row
            .iter()
            .map(|l| (l - log_sum_exp(row)).exp())
            .sum();
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[test]
    fn log_sum_exp_handles_extremes() {
        assert!((log_sum_exp(&[0.0, 0.0]) - std::f64::consts::LN_2).abs() < 1e-12);
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY]), f64::NEG_INFINITY);
    }
}
