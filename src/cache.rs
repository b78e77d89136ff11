use crate::{DlnError, Result};
use std::collections::HashMap;
use std::future::Future;

/// Memoizes validation results keyed by the exact prompt pair.
///
/// Weights are immutable once cached, so a repeated key must return the
/// previously computed value without re-invoking the operator: at most one
/// evaluation per distinct pair for the lifetime of the run. A failed or
/// cancelled compute leaves no entry behind.
#[derive(Debug, Default)]
pub struct ValidationCache {
    map: HashMap<(String, String), f64>,
    hits: u64,
    misses: u64,
}

impl ValidationCache {
    #[tracing::instrument(skip_all)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, weight1: &str, weight2: &str) -> Option<f64> {
        let v = self
            .map
            .get(&(weight1.to_string(), weight2.to_string()))
            .copied();
        if v.is_some() {
            self.hits += 1;
        }
        v
    }

    /// Record a freshly computed accuracy. An existing key with a different
    /// value means the idempotence invariant was broken somewhere upstream;
    /// that is fatal.
    #[tracing::instrument(skip_all)]
    pub fn insert(&mut self, weight1: &str, weight2: &str, accuracy: f64) -> Result<()> {
        let key = (weight1.to_string(), weight2.to_string());
        if let Some(&existing) = self.map.get(&key) {
            if (existing - accuracy).abs() > f64::EPSILON {
                return Err(DlnError::Unexpected(format!(
                    "validation cache inconsistency: key evaluated to {existing} then {accuracy}"
                )));
            }
            return Ok(());
        }
        self.misses += 1;
        self.map.insert(key, accuracy);
        Ok(())
    }

    /// Return the cached accuracy for the pair, computing it at most once.
    #[tracing::instrument(skip_all)]
    pub async fn get_or_compute<F, Fut>(
        &mut self,
        weight1: &str,
        weight2: &str,
        compute: F,
    ) -> Result<f64>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<f64>>,
    {
        if let Some(v) = self.get(weight1, weight2) {
            tracing::debug!("validation cache hit, skipping evaluation");
            return Ok(v);
        }
        let accuracy = compute().await?;
        self.insert(weight1, weight2, accuracy)?;
        Ok(accuracy)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn computes_each_pair_at_most_once() {
        let calls = AtomicU64::new(0);
        let mut cache = ValidationCache::new();

        let first = cache
            .get_or_compute("w1", "w2", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(0.75)
            })
            .await
            .unwrap();
        let second = cache
            .get_or_compute("w1", "w2", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(0.0)
            })
            .await
            .unwrap();

        assert_eq!(first, 0.75);
        assert_eq!(second, 0.75);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.hits(), 1);
    }

    #[tokio::test]
    async fn distinct_pairs_compute_separately() {
        let mut cache = ValidationCache::new();
        cache
            .get_or_compute("a", "b", || async { Ok(0.1) })
            .await
            .unwrap();
        cache
            .get_or_compute("b", "a", || async { Ok(0.2) })
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn failed_compute_leaves_no_entry() {
        let mut cache = ValidationCache::new();
        let r = cache
            .get_or_compute("w1", "w2", || async {
                Err(DlnError::Cancelled)
            })
            .await;
        assert!(r.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn inconsistent_insert_is_fatal() {
        let mut cache = ValidationCache::new();
        cache.insert("w1", "w2", 0.5).unwrap();
        assert!(matches!(
            cache.insert("w1", "w2", 0.9),
            Err(DlnError::Unexpected(_))
        ));
    }
}
