use serde::{Deserialize, Serialize};

/// A historically good prompt pair and the dev score that earned its slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub weight1: String,
    pub weight2: String,
    pub score: f64,
}

/// Bounded store of the best-performing prompt pairs, sorted by score
/// descending. Pure value store; the only side effect is its own list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptMemory {
    capacity: usize,
    entries: Vec<MemoryEntry>,
}

impl PromptMemory {
    #[tracing::instrument(skip_all)]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Insert if the pool has room or `score` beats the current minimum;
    /// otherwise a no-op. A pair already present keeps its higher score.
    #[tracing::instrument(skip_all, fields(score))]
    pub fn add(&mut self, weight1: &str, weight2: &str, score: f64) {
        if self.capacity == 0 || !score.is_finite() {
            return;
        }
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.weight1 == weight1 && e.weight2 == weight2)
        {
            if score > existing.score {
                existing.score = score;
            }
        } else {
            if self.entries.len() >= self.capacity {
                let min = self
                    .entries
                    .last()
                    .map(|e| e.score)
                    .unwrap_or(f64::NEG_INFINITY);
                if score <= min {
                    return;
                }
                self.entries.pop();
            }
            self.entries.push(MemoryEntry {
                weight1: weight1.to_string(),
                weight2: weight2.to_string(),
                score,
            });
        }
        self.entries.sort_by(|a, b| b.score.total_cmp(&a.score));
    }

    /// Entries sorted by score descending, at most `capacity` of them.
    pub fn top(&self) -> &[MemoryEntry] {
        &self.entries
    }
}
