use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Improving,
    Plateaued,
}

/// What one validation point did to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// New best dev score; patience reset.
    NewBest,
    /// No improvement; patience incremented.
    Waited { patience: u32 },
    /// Patience reached tolerance; the caller must restore the returned
    /// weights. Patience is reset.
    RolledBack { weight1: String, weight2: String },
}

/// Patience/best-score state machine controlling rollback.
///
/// Mutated only by the validation step; persists across iterations.
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    best_weight1: String,
    best_weight2: String,
    best_score: f64,
    patience: u32,
    tolerance: i32,
    state: TrackerState,
}

impl CheckpointTracker {
    /// `tolerance < 0` disables rollback entirely.
    #[tracing::instrument(skip_all, fields(tolerance))]
    pub fn new(initial_weight1: &str, initial_weight2: &str, tolerance: i32) -> Self {
        Self {
            best_weight1: initial_weight1.to_string(),
            best_weight2: initial_weight2.to_string(),
            best_score: 0.0,
            patience: 0,
            tolerance,
            state: TrackerState::Improving,
        }
    }

    pub fn best_weights(&self) -> (&str, &str) {
        (&self.best_weight1, &self.best_weight2)
    }

    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    pub fn patience(&self) -> u32 {
        self.patience
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// Fold one validation result into the tracker.
    #[tracing::instrument(skip_all, fields(score))]
    pub fn observe(&mut self, score: f64, weight1: &str, weight2: &str) -> Validation {
        if score > self.best_score {
            self.best_score = score;
            self.best_weight1 = weight1.to_string();
            self.best_weight2 = weight2.to_string();
            self.patience = 0;
            self.state = TrackerState::Improving;
            return Validation::NewBest;
        }

        self.patience += 1;
        self.state = TrackerState::Plateaued;
        if self.tolerance >= 0 && self.patience >= self.tolerance as u32 {
            self.patience = 0;
            self.state = TrackerState::Improving;
            return Validation::RolledBack {
                weight1: self.best_weight1.clone(),
                weight2: self.best_weight2.clone(),
            };
        }
        Validation::Waited {
            patience: self.patience,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patience_rollback_restores_best_weights() {
        let mut t = CheckpointTracker::new("init1", "init2", 2);

        assert_eq!(t.observe(0.5, "w1-a", "w2-a"), Validation::NewBest);
        assert_eq!(t.state(), TrackerState::Improving);

        assert_eq!(t.observe(0.4, "w1-b", "w2-b"), Validation::Waited { patience: 1 });
        assert_eq!(t.state(), TrackerState::Plateaued);

        match t.observe(0.3, "w1-c", "w2-c") {
            Validation::RolledBack { weight1, weight2 } => {
                assert_eq!(weight1, "w1-a");
                assert_eq!(weight2, "w2-a");
            }
            other => panic!("expected rollback, got {other:?}"),
        }
        assert_eq!(t.patience(), 0);
        assert_eq!(t.state(), TrackerState::Improving);
        assert_eq!(t.best_weights(), ("w1-a", "w2-a"));
    }

    #[test]
    fn negative_tolerance_never_rolls_back() {
        let mut t = CheckpointTracker::new("i1", "i2", -1);
        t.observe(0.5, "a", "a");
        for i in 1..10u32 {
            assert_eq!(t.observe(0.1, "b", "b"), Validation::Waited { patience: i });
        }
    }

    #[test]
    fn new_best_resets_patience() {
        let mut t = CheckpointTracker::new("i1", "i2", 3);
        t.observe(0.5, "a", "a");
        t.observe(0.4, "b", "b");
        assert_eq!(t.patience(), 1);
        t.observe(0.6, "c", "c");
        assert_eq!(t.patience(), 0);
        assert_eq!(t.best_weights(), ("c", "c"));
    }

    #[test]
    fn equal_score_is_not_an_improvement() {
        let mut t = CheckpointTracker::new("i1", "i2", -1);
        t.observe(0.5, "a", "a");
        assert_eq!(t.observe(0.5, "b", "b"), Validation::Waited { patience: 1 });
        assert_eq!(t.best_weights(), ("a", "a"));
    }
}
