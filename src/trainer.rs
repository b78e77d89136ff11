use crate::cache::ValidationCache;
use crate::checkpoint::{CheckpointTracker, Validation};
use crate::dataset::{DataSource, Split};
use crate::model::VIModel;
use crate::models::{StepRecord, TrainOutcome};
use crate::report::MetricsSink;
use crate::{DlnError, Result};
use std::collections::{BTreeMap, HashMap};
use tokio_util::sync::CancellationToken;

/// Weight on the previous running average when folding in a new point.
const EMA_KEEP: f64 = 0.2;
const EMA_BLEND: f64 = 0.8;

/// Mutable per-run training state, explicit rather than scattered across the
/// loop: running averages of the batch metrics, seeded by the first point.
#[derive(Debug, Clone, Default)]
pub struct TrainContext {
    pub elbo_avg: f64,
    pub loss_avg: f64,
    pub acc_avg: f64,
    seen: bool,
}

impl TrainContext {
    pub fn update(&mut self, elbo: f64, loss: f64) {
        let acc = 1.0 - loss;
        if !self.seen {
            self.elbo_avg = elbo;
            self.loss_avg = loss;
            self.acc_avg = acc;
            self.seen = true;
            return;
        }
        self.elbo_avg = EMA_KEEP * self.elbo_avg + EMA_BLEND * elbo;
        self.loss_avg = EMA_KEEP * self.loss_avg + EMA_BLEND * loss;
        self.acc_avg = EMA_KEEP * self.acc_avg + EMA_BLEND * acc;
    }
}

/// Drives the optimization loop: batches, validation and checkpointing,
/// penalty decay, and the final test evaluation.
///
/// The trainer owns the model plus all loop-lifetime state (validation cache,
/// checkpoint tracker, running averages). Datasets and metrics sinks stay
/// borrowed collaborators.
pub struct Trainer {
    model: VIModel,
    cache: ValidationCache,
    tracker: CheckpointTracker,
    context: TrainContext,
    cancel: CancellationToken,
}

impl Trainer {
    #[tracing::instrument(skip_all)]
    pub fn new(model: VIModel) -> Self {
        let (w1, w2) = model.weights();
        let tracker = CheckpointTracker::new(&w1, &w2, model.config().tolerance);
        Self {
            model,
            cache: ValidationCache::new(),
            tracker,
            context: TrainContext::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Cooperative cancellation: checked at iteration and evaluation-batch
    /// boundaries, so a cancelled run stops cleanly between operator calls.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn model(&self) -> &VIModel {
        &self.model
    }

    pub fn context(&self) -> &TrainContext {
        &self.context
    }

    pub fn cache(&self) -> &ValidationCache {
        &self.cache
    }

    pub fn tracker(&self) -> &CheckpointTracker {
        &self.tracker
    }

    /// Run the full training loop. Returns the best weights found, their dev
    /// accuracy, the test accuracy under those weights, and cost totals with
    /// the test evaluation accounted separately from training.
    #[tracing::instrument(skip_all, fields(dataset = data.name()))]
    pub async fn train(
        &mut self,
        data: &mut dyn DataSource,
        sink: &mut dyn MetricsSink,
    ) -> Result<TrainOutcome> {
        let cfg = self.model.config().clone();
        let operator = self.model.operator().clone();
        let mut outcome = TrainOutcome::new();
        let penalty0 = self.model.logp_penalty();
        let has_dev = data.size(Split::Dev) > 0;
        let cost_at_start = operator.cost().total();

        for step in 0..cfg.iters {
            if self.cancel.is_cancelled() {
                tracing::info!(step, "training cancelled");
                outcome.cancelled = true;
                break;
            }

            let validate_now =
                (step == 0 && cfg.do_first_eval) || (step > 0 && step % cfg.val_freq == 0);
            if validate_now && has_dev {
                self.validate(step, data, sink).await?;
            }

            if cfg.decay_logp_penalty && cfg.iters > 1 {
                let remaining = (cfg.iters - step) as f64 / cfg.iters as f64;
                self.model.set_logp_penalty(penalty0 * remaining);
            }

            let batch =
                data.get_batch(Split::Train, cfg.batch_size, true, cfg.balance_batch)?;
            let out = self.model.step(&batch, cfg.fwd_temp).await?;
            self.model.set_weights(&out.weight1, &out.weight2);
            self.context.update(out.elbo.value, out.loss);

            let mut metrics: BTreeMap<String, f64> = BTreeMap::new();
            metrics.insert("elbo".to_string(), out.elbo.value);
            metrics.insert("elbo1".to_string(), out.elbo.elbo1);
            metrics.insert("elbo2".to_string(), out.elbo.elbo2);
            metrics.insert("train_loss".to_string(), out.loss);
            metrics.insert("train_acc".to_string(), 1.0 - out.loss);
            metrics.insert("elbo_avg".to_string(), self.context.elbo_avg);
            metrics.insert("loss_avg".to_string(), self.context.loss_avg);
            metrics.insert("logp_penalty".to_string(), self.model.logp_penalty());
            metrics.insert(
                "excluded_examples".to_string(),
                out.excluded_examples as f64,
            );
            for (name, value) in &metrics {
                sink.log_metric(step, name, *value);
            }
            sink.write_step(&StepRecord {
                step,
                weights: vec![out.weight1.clone(), out.weight2.clone()],
                metrics,
                candidates: out.candidates,
            })?;

            outcome.iterations_run += 1;
            tracing::info!(
                step,
                elbo = out.elbo.value,
                loss = out.loss,
                elbo_avg = self.context.elbo_avg,
                "training step complete"
            );
        }

        // One last validation point so the final weights can become the best.
        if !outcome.cancelled && has_dev {
            self.validate(cfg.iters, data, sink).await?;
        }

        // Reload the best checkpoint before reporting or testing.
        if has_dev {
            let (b1, b2) = self.tracker.best_weights();
            let (b1, b2) = (b1.to_string(), b2.to_string());
            self.model.set_weights(&b1, &b2);
            outcome.best_weight1 = b1;
            outcome.best_weight2 = b2;
            outcome.best_dev_acc = self.tracker.best_score();
        } else {
            let (w1, w2) = self.model.weights();
            outcome.best_weight1 = w1;
            outcome.best_weight2 = w2;
        }
        outcome.train_cost = operator.cost().total().saturating_sub(cost_at_start);

        if !outcome.cancelled && data.size(Split::Test) > 0 {
            let test_scope = operator.cost().scope();
            let test_acc = self.eval_split(data, Split::Test, cfg.eval_batch_size).await?;
            outcome.test_acc = Some(test_acc);
            outcome.test_cost = test_scope.delta();
            tracing::info!(test_acc, test_cost = outcome.test_cost, "test evaluation complete");
        }

        Ok(outcome.finish())
    }

    /// Evaluate the current weights on dev, at most once per distinct weight
    /// pair, and fold the result into the checkpoint tracker.
    #[tracing::instrument(skip_all, fields(step))]
    async fn validate(
        &mut self,
        step: usize,
        data: &mut dyn DataSource,
        sink: &mut dyn MetricsSink,
    ) -> Result<()> {
        let cfg = self.model.config();
        let eval_batch_size = cfg.eval_batch_size;
        let (w1, w2) = self.model.weights();

        let dev_acc = match self.cache.get(&w1, &w2) {
            Some(v) => {
                tracing::debug!(step, "validation cache hit");
                v
            }
            None => {
                let v = self.eval_split(data, Split::Dev, eval_batch_size).await?;
                self.cache.insert(&w1, &w2, v)?;
                v
            }
        };
        sink.log_metric(step, "dev_acc", dev_acc);

        match self.tracker.observe(dev_acc, &w1, &w2) {
            Validation::NewBest => {
                tracing::info!(step, dev_acc, "new best weights");
                self.model.add_to_memory(&w1, &w2, dev_acc);
            }
            Validation::Waited { patience } => {
                tracing::debug!(step, dev_acc, patience, "no improvement");
            }
            Validation::RolledBack { weight1, weight2 } => {
                tracing::info!(step, "patience exhausted, restoring best weights");
                self.model.set_weights(&weight1, &weight2);
            }
        }
        Ok(())
    }

    /// Accuracy of the current weights over a whole split, iterated in
    /// evaluation-sized batches.
    #[tracing::instrument(skip_all, fields(?split))]
    async fn eval_split(
        &self,
        data: &mut dyn DataSource,
        split: Split,
        batch_size: usize,
    ) -> Result<f64> {
        data.reset_pointer(split);
        let mut correct = 0.0;
        let mut total = 0usize;
        let mut per_class: HashMap<String, (u64, u64)> = HashMap::new();

        while let Some(batch) = data.next_batch(split, batch_size) {
            if self.cancel.is_cancelled() {
                return Err(DlnError::Cancelled);
            }
            let eval = self.model.evaluate(&batch, 0.0).await?;
            for (loss, ex) in eval.losses.iter().zip(&batch) {
                let Some(loss) = loss else { continue };
                correct += 1.0 - loss;
                total += 1;
                let slot = per_class.entry(ex.gold.clone()).or_insert((0, 0));
                slot.1 += 1;
                if *loss > 0.0 {
                    slot.0 += 1;
                }
            }
        }
        if total == 0 {
            return Err(DlnError::Unexpected(format!(
                "no usable predictions while evaluating {split:?} split"
            )));
        }
        tracing::debug!(?split, ?per_class, "per-class error counts (wrong, total)");
        Ok(correct / total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VIConfig;
    use crate::dataset::InMemoryDataset;
    use crate::models::{Example, OutputClasses};
    use crate::operator::{Completion, CostTracker, Operator, SamplingParams};
    use crate::report::{NullSink, ResultLogWriter};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Deterministic backend: "no" always outscores "yes", so predictions and
    /// accuracies are fixed by the gold distribution.
    struct Backend {
        cost: CostTracker,
    }

    #[async_trait]
    impl Operator for Backend {
        async fn invoke(&self, prompt: &str, _params: &SamplingParams) -> Result<Completion> {
            self.cost.add(1);
            if prompt.contains("correct answer is") {
                return Ok(Completion::text("the evidence points one way"));
            }
            if prompt.contains("improved instruction") {
                return Ok(Completion::text("Weigh the evidence, then answer."));
            }
            Ok(Completion::text("a brief rationale"))
        }

        async fn score(&self, _context: &str, target: &str) -> Result<f64> {
            self.cost.add(1);
            Ok(-(target.len() as f64) / 10.0 - 0.5)
        }

        fn cost(&self) -> &CostTracker {
            &self.cost
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn classes() -> OutputClasses {
        OutputClasses::new(vec!["yes".to_string(), "no".to_string()]).unwrap()
    }

    fn dataset() -> InMemoryDataset {
        let examples: Vec<Example> = (0..8)
            .map(|i| {
                Example::new(
                    format!("statement {i}"),
                    if i % 2 == 0 { "no" } else { "yes" },
                )
            })
            .collect();
        InMemoryDataset::new(
            "toy",
            "Answer yes or no.",
            Some(classes()),
            examples.clone(),
            examples[..4].to_vec(),
            examples[4..].to_vec(),
            11,
        )
        .unwrap()
    }

    fn cfg() -> VIConfig {
        VIConfig {
            iters: 2,
            batch_size: 4,
            eval_batch_size: 2,
            val_freq: 1,
            do_first_eval: true,
            num_h_samples: 1,
            num_p_samples: 1,
            use_memory: 2,
            ..Default::default()
        }
    }

    fn trainer_with(cfg: VIConfig, backend: Arc<Backend>) -> Trainer {
        let model = VIModel::new(
            cfg,
            backend.clone(),
            backend,
            Some(classes()),
            "Think about the statement.",
            "Answer yes or no.",
        )
        .unwrap();
        Trainer::new(model)
    }

    #[tokio::test]
    async fn full_run_reports_weights_accuracy_and_cost() {
        let backend = Arc::new(Backend {
            cost: CostTracker::new(),
        });
        let mut trainer = trainer_with(cfg(), backend.clone());
        let mut data = dataset();
        let mut sink = ResultLogWriter::new("toy", None);

        let outcome = trainer.train(&mut data, &mut sink).await.unwrap();

        assert_eq!(outcome.iterations_run, 2);
        assert!(!outcome.cancelled);
        // "no" always wins the class ranking; half the dev golds are "no".
        assert!((outcome.best_dev_acc - 0.5).abs() < 1e-9);
        assert_eq!(outcome.test_acc, Some(0.5));
        assert!(!outcome.best_weight2.is_empty());
        assert!(outcome.train_cost > 0);
        assert!(outcome.test_cost > 0);
        // Test cost is isolated from training cost, and together they account
        // for every call the backend saw.
        assert_eq!(
            outcome.train_cost + outcome.test_cost,
            backend.cost().total()
        );
        assert_eq!(sink.steps().len(), 2);
        // The model ends on the best checkpoint.
        let (w1, w2) = trainer.model().weights();
        assert_eq!(w1, outcome.best_weight1);
        assert_eq!(w2, outcome.best_weight2);
    }

    #[tokio::test]
    async fn frozen_weights_validate_through_the_cache() {
        let backend = Arc::new(Backend {
            cost: CostTracker::new(),
        });
        let config = VIConfig {
            iters: 3,
            train_p1: false,
            train_p2: false,
            ..cfg()
        };
        let mut trainer = trainer_with(config, backend);
        let mut data = dataset();
        let mut sink = NullSink;

        trainer.train(&mut data, &mut sink).await.unwrap();

        // Validations at steps 0, 1, 2 and the final point all see the same
        // weight pair: one dev evaluation, three cache hits.
        assert_eq!(trainer.cache().len(), 1);
        assert_eq!(trainer.cache().hits(), 3);
    }

    #[tokio::test]
    async fn new_best_seeds_the_prompt_memory() {
        let backend = Arc::new(Backend {
            cost: CostTracker::new(),
        });
        let mut trainer = trainer_with(cfg(), backend);
        let mut data = dataset();
        let mut sink = NullSink;

        trainer.train(&mut data, &mut sink).await.unwrap();
        assert!(!trainer.model().memory().top().is_empty());
    }

    #[tokio::test]
    async fn cancellation_before_start_is_graceful() {
        let backend = Arc::new(Backend {
            cost: CostTracker::new(),
        });
        let token = CancellationToken::new();
        token.cancel();
        let mut trainer = trainer_with(cfg(), backend).with_cancellation(token);
        let mut data = dataset();
        let mut sink = NullSink;

        let outcome = trainer.train(&mut data, &mut sink).await.unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.iterations_run, 0);
        assert_eq!(outcome.test_acc, None);
        assert_eq!(outcome.test_cost, 0);
    }

    #[tokio::test]
    async fn penalty_decays_toward_zero() {
        let backend = Arc::new(Backend {
            cost: CostTracker::new(),
        });
        let config = VIConfig {
            logp_penalty: 1.0,
            decay_logp_penalty: true,
            ..cfg()
        };
        let mut trainer = trainer_with(config, backend);
        let mut data = dataset();
        let mut sink = NullSink;

        trainer.train(&mut data, &mut sink).await.unwrap();
        // Two iterations: the last step ran with half the initial penalty.
        assert!((trainer.model().logp_penalty() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn running_averages_blend_new_points() {
        let mut ctx = TrainContext::default();
        ctx.update(1.0, 0.5);
        assert_eq!(ctx.elbo_avg, 1.0);
        assert_eq!(ctx.loss_avg, 0.5);
        ctx.update(2.0, 0.0);
        assert!((ctx.elbo_avg - 1.8).abs() < 1e-12);
        assert!((ctx.loss_avg - 0.1).abs() < 1e-12);
        assert!((ctx.acc_avg - 0.9).abs() < 1e-12);
    }
}
