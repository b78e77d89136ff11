use crate::models::{Example, OutputClasses};
use crate::{DlnError, Result};
use rand::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Dev,
    Test,
}

/// Dataset collaborator contract. Storage formats live behind this trait; the
/// optimizer only draws batches and iterates splits.
pub trait DataSource: Send {
    fn name(&self) -> &str;

    /// Task instruction, used as the class layer's initial weight when none
    /// is configured.
    fn instruction(&self) -> &str;

    fn output_classes(&self) -> Option<&OutputClasses>;

    fn size(&self, split: Split) -> usize;

    /// Draw a batch: sequential from the split pointer, random, or balanced
    /// across gold classes.
    fn get_batch(
        &mut self,
        split: Split,
        size: usize,
        random_sample: bool,
        balance: bool,
    ) -> Result<Vec<Example>>;

    /// Next sequential batch, or `None` once the split is exhausted. Used
    /// with [`DataSource::reset_pointer`] to iterate a split.
    fn next_batch(&mut self, split: Split, batch_size: usize) -> Option<Vec<Example>>;

    fn reset_pointer(&mut self, split: Split);
}

/// In-memory [`DataSource`] with seeded sampling.
pub struct InMemoryDataset {
    name: String,
    instruction: String,
    classes: Option<OutputClasses>,
    splits: HashMap<Split, Vec<Example>>,
    pointers: HashMap<Split, usize>,
    rng: StdRng,
}

impl InMemoryDataset {
    #[tracing::instrument(skip_all, fields(name))]
    pub fn new(
        name: impl Into<String>,
        instruction: impl Into<String>,
        classes: Option<OutputClasses>,
        train: Vec<Example>,
        dev: Vec<Example>,
        test: Vec<Example>,
        seed: u64,
    ) -> Result<Self> {
        if train.is_empty() {
            return Err(DlnError::InvalidArgument(
                "train split must contain at least one example".to_string(),
            ));
        }
        let mut splits = HashMap::new();
        splits.insert(Split::Train, train);
        splits.insert(Split::Dev, dev);
        splits.insert(Split::Test, test);
        Ok(Self {
            name: name.into(),
            instruction: instruction.into(),
            classes,
            splits,
            pointers: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    fn examples(&self, split: Split) -> &[Example] {
        self.splits.get(&split).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl DataSource for InMemoryDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn instruction(&self) -> &str {
        &self.instruction
    }

    fn output_classes(&self) -> Option<&OutputClasses> {
        self.classes.as_ref()
    }

    fn size(&self, split: Split) -> usize {
        self.examples(split).len()
    }

    #[tracing::instrument(skip_all, fields(size, random_sample, balance))]
    fn get_batch(
        &mut self,
        split: Split,
        size: usize,
        random_sample: bool,
        balance: bool,
    ) -> Result<Vec<Example>> {
        let pool = self.splits.get(&split).cloned().unwrap_or_default();
        if pool.is_empty() {
            return Err(DlnError::InvalidArgument(
                "cannot draw a batch from an empty split".to_string(),
            ));
        }

        if balance {
            // Round-robin over per-class buckets, each bucket shuffled.
            let mut buckets: HashMap<String, Vec<Example>> = HashMap::new();
            for ex in pool {
                buckets.entry(ex.gold.trim().to_string()).or_default().push(ex);
            }
            let mut keys: Vec<String> = buckets.keys().cloned().collect();
            keys.sort();
            for bucket in buckets.values_mut() {
                bucket.shuffle(&mut self.rng);
            }
            let mut out = Vec::with_capacity(size);
            let mut round = 0usize;
            while out.len() < size {
                let mut drew_any = false;
                for key in &keys {
                    if out.len() >= size {
                        break;
                    }
                    if let Some(ex) = buckets.get(key).and_then(|b| b.get(round)) {
                        out.push(ex.clone());
                        drew_any = true;
                    }
                }
                if !drew_any {
                    break;
                }
                round += 1;
            }
            return Ok(out);
        }

        if random_sample {
            let n = size.min(pool.len());
            return Ok(pool
                .choose_multiple(&mut self.rng, n)
                .cloned()
                .collect());
        }

        let pointer = self.pointers.entry(split).or_insert(0);
        let start = *pointer;
        let end = (start + size).min(pool.len());
        *pointer = end;
        Ok(pool[start..end].to_vec())
    }

    fn next_batch(&mut self, split: Split, batch_size: usize) -> Option<Vec<Example>> {
        let pool_len = self.examples(split).len();
        let pointer = self.pointers.entry(split).or_insert(0);
        if *pointer >= pool_len {
            return None;
        }
        let start = *pointer;
        let end = (start + batch_size).min(pool_len);
        *pointer = end;
        Some(self.splits[&split][start..end].to_vec())
    }

    fn reset_pointer(&mut self, split: Split) {
        self.pointers.insert(split, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> InMemoryDataset {
        let train: Vec<Example> = (0..6)
            .map(|i| {
                Example::new(
                    format!("example {i}"),
                    if i % 3 == 0 { "rare" } else { "common" },
                )
            })
            .collect();
        let dev = train[..4].to_vec();
        InMemoryDataset::new(
            "toy",
            "Classify the example.",
            None,
            train,
            dev,
            vec![],
            7,
        )
        .unwrap()
    }

    #[test]
    fn iteration_covers_split_and_resets() {
        let mut ds = dataset();
        let mut seen = 0;
        while let Some(batch) = ds.next_batch(Split::Dev, 3) {
            seen += batch.len();
        }
        assert_eq!(seen, 4);
        assert!(ds.next_batch(Split::Dev, 3).is_none());
        ds.reset_pointer(Split::Dev);
        assert_eq!(ds.next_batch(Split::Dev, 3).unwrap().len(), 3);
    }

    #[test]
    fn balanced_batch_round_robins_classes() {
        let mut ds = dataset();
        let batch = ds.get_batch(Split::Train, 4, true, true).unwrap();
        let rare = batch.iter().filter(|e| e.gold == "rare").count();
        // 2 of 6 train examples are "rare"; a balanced batch of 4 carries 2.
        assert_eq!(rare, 2);
    }

    #[test]
    fn random_sampling_is_seed_deterministic() {
        let mut a = dataset();
        let mut b = dataset();
        let ba = a.get_batch(Split::Train, 3, true, false).unwrap();
        let bb = b.get_batch(Split::Train, 3, true, false).unwrap();
        let ia: Vec<&str> = ba.iter().map(|e| e.input.as_str()).collect();
        let ib: Vec<&str> = bb.iter().map(|e| e.input.as_str()).collect();
        assert_eq!(ia, ib);
    }

    #[test]
    fn empty_split_batch_is_an_error() {
        let mut ds = dataset();
        assert!(ds.get_batch(Split::Test, 2, false, false).is_err());
    }
}
