/// Estimates how far a candidate prompt diverges from the current one.
///
/// The exact approximation is heuristic, so it sits behind a trait: the
/// shipped default proxies divergence by the drop in scored log-probability
/// on the same ranking examples, but a true KL estimate could slot in.
pub trait DivergenceEstimator: Send + Sync {
    /// Divergence given both prompts' mean scores on the same held-out
    /// examples. Must be >= 0 and finite for finite inputs.
    fn estimate(&self, current_score: f64, candidate_score: f64) -> f64;

    fn name(&self) -> &'static str;
}

/// Score-drop proxy: a candidate that scores no worse than the current weight
/// has zero estimated divergence.
#[derive(Debug, Default)]
pub struct ScoreDropDivergence;

impl DivergenceEstimator for ScoreDropDivergence {
    fn estimate(&self, current_score: f64, candidate_score: f64) -> f64 {
        (current_score - candidate_score).max(0.0)
    }

    fn name(&self) -> &'static str {
        "score_drop"
    }
}
