use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Generation parameters for one operator call.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub max_tokens: usize,
    pub stop: Option<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 256,
            stop: None,
        }
    }
}

/// Output of one generation call. Token log-probabilities are optional; not
/// every backend reports them.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub token_logprobs: Option<Vec<f64>>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            token_logprobs: None,
        }
    }
}

/// Running total of consumed units (tokens or calls), readable at any time.
///
/// The counter only ever grows; scoped accounting takes snapshots instead of
/// resetting it, so nested or overlapping spans each see only the calls issued
/// within their own span.
#[derive(Debug, Default)]
pub struct CostTracker {
    units: AtomicU64,
}

impl CostTracker {
    #[tracing::instrument(skip_all)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, units: u64) {
        self.units.fetch_add(units, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.units.load(Ordering::Relaxed)
    }

    /// Open an isolated cost scope starting at the current total.
    pub fn scope(&self) -> CostScope<'_> {
        CostScope {
            tracker: self,
            start: self.total(),
        }
    }
}

/// Captures the cost delta across a defined span without mutating the global
/// counter.
#[derive(Debug)]
pub struct CostScope<'a> {
    tracker: &'a CostTracker,
    start: u64,
}

impl CostScope<'_> {
    pub fn delta(&self) -> u64 {
        self.tracker.total().saturating_sub(self.start)
    }
}

/// Executes prompts against a generative text backend.
///
/// The optimizer issues per-example calls concurrently through the batched
/// defaults; failures are reported per item so a single bad call never sinks a
/// whole batch. Retry policy belongs to the implementation, not here.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Generate a completion for `prompt`.
    async fn invoke(&self, prompt: &str, params: &SamplingParams) -> Result<Completion>;

    /// Log-probability the backend assigns to producing exactly `target`
    /// after `context`.
    async fn score(&self, context: &str, target: &str) -> Result<f64>;

    /// Running cost counter for this operator.
    fn cost(&self) -> &CostTracker;

    fn name(&self) -> &'static str;

    /// Concurrent fan-out over `prompts`; one result per prompt, in order.
    async fn invoke_batch(
        &self,
        prompts: &[String],
        params: &SamplingParams,
    ) -> Vec<Result<Completion>> {
        futures_util::future::join_all(prompts.iter().map(|p| self.invoke(p, params))).await
    }

    /// Concurrent fan-out over (context, target) pairs.
    async fn score_batch(&self, pairs: &[(String, String)]) -> Vec<Result<f64>> {
        futures_util::future::join_all(pairs.iter().map(|(c, t)| self.score(c, t))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_see_only_their_own_span() {
        let tracker = CostTracker::new();
        tracker.add(10);

        let outer = tracker.scope();
        tracker.add(5);
        let inner = tracker.scope();
        tracker.add(3);

        assert_eq!(inner.delta(), 3);
        assert_eq!(outer.delta(), 8);
        assert_eq!(tracker.total(), 18);
    }

    #[test]
    fn scope_of_untouched_tracker_is_zero() {
        let tracker = CostTracker::new();
        let scope = tracker.scope();
        assert_eq!(scope.delta(), 0);
    }
}
