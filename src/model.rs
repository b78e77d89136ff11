use crate::config::VIConfig;
use crate::layer::Layer;
use crate::loss::Loss;
use crate::memory::PromptMemory;
use crate::models::{
    require_finite, Candidate, CandidateRecord, CandidateSource, ElboEstimate, Example,
    OutputClasses, StepOutcome,
};
use crate::operator::Operator;
use crate::sampler::{PosteriorSampler, PromptSampler, ProposalExample};
use crate::score::LogProbsScore;
use crate::template::{self, PromptTemplate};
use crate::trust::{DivergenceEstimator, ScoreDropDivergence};
use crate::{DlnError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Forward evaluation of one batch under a fixed weight pair.
#[derive(Debug, Clone)]
pub struct BatchEval {
    pub accuracy: f64,
    /// Per-example loss; `None` where the forward pass yielded no usable
    /// prediction.
    pub losses: Vec<Option<f64>>,
    pub predictions: Vec<Option<String>>,
    /// Examples without a usable prediction, for observability.
    pub excluded: usize,
}

/// The two-layer latent-variable model and its optimizer.
///
/// Each step is an explicit propose -> score -> select pipeline: posterior
/// samples approximate the latent rationale, log-probability feedback forms
/// an importance-weighted ELBO, and candidate prompts for each layer are
/// ranked by the likelihood term and gated by a trust region. The step never
/// applies weights itself; the caller decides.
pub struct VIModel {
    cfg: VIConfig,
    layer1: Option<Layer>,
    layer2: Layer,
    t_hidden: PromptTemplate,
    t_class: PromptTemplate,
    posterior: PosteriorSampler,
    prompt_sampler1: PromptSampler,
    prompt_sampler2: PromptSampler,
    score: LogProbsScore,
    loss: Loss,
    output_classes: Option<OutputClasses>,
    memory: PromptMemory,
    divergence: Arc<dyn DivergenceEstimator>,
    logp_penalty: f64,
    excluded_total: u64,
}

impl VIModel {
    /// Build the model from validated configuration. Fails fast on any
    /// configuration error, before any operator cost is incurred.
    #[tracing::instrument(skip_all)]
    pub fn new(
        cfg: VIConfig,
        forward_operator: Arc<dyn Operator>,
        backward_operator: Arc<dyn Operator>,
        output_classes: Option<OutputClasses>,
        init_p1: &str,
        init_p2: &str,
    ) -> Result<Self> {
        cfg.validate()?;
        if cfg.forward_use_classes && output_classes.is_none() {
            return Err(DlnError::InvalidConfig(
                "forward_use_classes requires output classes".to_string(),
            ));
        }
        let loss = Loss::from_name(&cfg.loss_function)?;
        let t_hidden = template::lookup(&cfg.p_hidden)?;
        let t_class = template::lookup(&cfg.p_class)?;
        let t_q_hidden = template::lookup(&cfg.q_hidden)?;
        let t_q_prompt = template::lookup(&cfg.q_prompt)?;

        let layer1 = cfg.two_layers.then(|| {
            Layer::new(
                "hidden",
                init_p1,
                t_hidden.clone(),
                forward_operator.clone(),
            )
        });
        let layer2 = Layer::new("class", init_p2, t_class.clone(), forward_operator.clone());
        let memory = PromptMemory::new(cfg.use_memory);
        let logp_penalty = cfg.logp_penalty;

        Ok(Self {
            cfg,
            layer1,
            layer2,
            t_hidden,
            t_class,
            posterior: PosteriorSampler::new(backward_operator.clone(), t_q_hidden),
            prompt_sampler1: PromptSampler::new(backward_operator.clone(), t_q_prompt.clone()),
            prompt_sampler2: PromptSampler::new(backward_operator, t_q_prompt),
            score: LogProbsScore::new(forward_operator),
            loss,
            output_classes,
            memory,
            divergence: Arc::new(ScoreDropDivergence),
            logp_penalty,
            excluded_total: 0,
        })
    }

    /// Swap in a different trust-region divergence estimator.
    pub fn with_divergence(mut self, divergence: Arc<dyn DivergenceEstimator>) -> Self {
        self.divergence = divergence;
        self
    }

    pub fn config(&self) -> &VIConfig {
        &self.cfg
    }

    /// The forward operator, whose cost counter covers generation and
    /// scoring.
    pub fn operator(&self) -> &Arc<dyn Operator> {
        self.score.operator()
    }

    pub fn loss_fn(&self) -> &Loss {
        &self.loss
    }

    /// Current weight pair; the hidden weight is empty in single-layer mode.
    pub fn weights(&self) -> (String, String) {
        (
            self.layer1
                .as_ref()
                .map(|l| l.weight().to_string())
                .unwrap_or_default(),
            self.layer2.weight().to_string(),
        )
    }

    /// Replace the layer weights. In single-layer mode `weight1` is ignored.
    #[tracing::instrument(skip_all)]
    pub fn set_weights(&mut self, weight1: &str, weight2: &str) {
        if let Some(l1) = &mut self.layer1 {
            l1.set_weight(weight1.to_string());
        }
        self.layer2.set_weight(weight2.to_string());
    }

    /// Exploration-bonus magnitude; the trainer decays this over the run.
    pub fn set_logp_penalty(&mut self, penalty: f64) {
        self.logp_penalty = penalty;
    }

    pub fn logp_penalty(&self) -> f64 {
        self.logp_penalty
    }

    pub fn memory(&self) -> &PromptMemory {
        &self.memory
    }

    #[tracing::instrument(skip_all, fields(score))]
    pub fn add_to_memory(&mut self, weight1: &str, weight2: &str, score: f64) {
        self.memory.add(weight1, weight2, score);
    }

    /// Cumulative count of examples dropped from batch ELBOs.
    pub fn excluded_total(&self) -> u64 {
        self.excluded_total
    }

    fn classes(&self) -> Result<&OutputClasses> {
        self.output_classes.as_ref().ok_or_else(|| {
            DlnError::Unexpected("class-constrained scoring without output classes".to_string())
        })
    }

    /// Hidden-layer forward context: input only, never the gold label.
    fn hidden_ctx(&self, weight: &str, example: &Example) -> String {
        self.t_hidden.render(&[
            ("prompt", weight),
            ("input", &example.input),
            ("options", example.options().unwrap_or("")),
        ])
    }

    fn class_ctx(&self, weight: &str, example: &Example, hidden: &str) -> String {
        self.t_class.render(&[
            ("prompt", weight),
            ("input", &example.input),
            ("hidden", hidden),
            ("options", example.options().unwrap_or("")),
        ])
    }

    /// Class-layer likelihood term for each (context, gold) pair:
    /// class-contrastive when the output space is constrained, raw target
    /// log-probability otherwise. Unscaled; `None` where scoring failed.
    async fn class_terms(
        &self,
        contexts: &[String],
        golds: &[String],
    ) -> Result<Vec<Option<f64>>> {
        if self.cfg.forward_use_classes {
            let classes = self.classes()?;
            let rows = self.score.score_classes(contexts, classes).await?;
            let mut out = Vec::with_capacity(rows.len());
            for (row, gold) in rows.iter().zip(golds) {
                let gold_idx = classes.position(gold).ok_or_else(|| {
                    DlnError::InvalidArgument(format!(
                        "gold label not in output classes: {gold}"
                    ))
                })?;
                out.push(row.as_ref().map(|r| LogProbsScore::contrastive(gold_idx, r)));
            }
            Ok(out)
        } else {
            self.score.score_targets(contexts, golds).await
        }
    }

    /// Forward pass under an explicit weight pair. One prediction per
    /// example; `None` where generation or scoring failed.
    #[tracing::instrument(skip_all, fields(n = examples.len()))]
    pub async fn forward_with(
        &self,
        weight1: &str,
        weight2: &str,
        examples: &[Example],
        temperature: f64,
    ) -> Result<Vec<Option<String>>> {
        let n = examples.len();
        let fwd_params = self.cfg.fwd_params(temperature);

        let hiddens: Vec<Option<String>> = if let Some(l1) = &self.layer1 {
            let ctxs: Vec<String> = examples
                .iter()
                .map(|ex| self.hidden_ctx(weight1, ex))
                .collect();
            l1.forward(&ctxs, &fwd_params)
                .await
                .into_iter()
                .enumerate()
                .map(|(i, r)| match r {
                    Ok(text) if !text.is_empty() => Some(text),
                    Ok(_) => {
                        tracing::warn!(example = i, "empty forward hidden state");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(example = i, error = %e, "forward hidden generation failed");
                        None
                    }
                })
                .collect()
        } else {
            vec![Some(String::new()); n]
        };

        let usable: Vec<usize> = (0..n).filter(|&i| hiddens[i].is_some()).collect();
        let ctxs: Vec<String> = usable
            .iter()
            .map(|&i| self.class_ctx(weight2, &examples[i], hiddens[i].as_deref().unwrap_or("")))
            .collect();

        let mut predictions: Vec<Option<String>> = vec![None; n];
        if self.cfg.forward_use_classes {
            let classes = self.classes()?;
            let rows = self.score.score_classes(&ctxs, classes).await?;
            for (&i, row) in usable.iter().zip(rows) {
                predictions[i] = row.and_then(|r| {
                    r.iter()
                        .enumerate()
                        .max_by(|a, b| a.1.total_cmp(b.1))
                        .map(|(k, _)| classes.protos()[k].clone())
                });
            }
        } else {
            let outputs = self.layer2.forward(&ctxs, &fwd_params).await;
            for (&i, out) in usable.iter().zip(outputs) {
                match out {
                    Ok(text) => predictions[i] = Some(text),
                    Err(e) => {
                        tracing::warn!(example = i, error = %e, "class generation failed");
                    }
                }
            }
        }
        Ok(predictions)
    }

    /// Forward pass + per-example losses under an explicit weight pair.
    #[tracing::instrument(skip_all)]
    pub async fn evaluate_with(
        &self,
        weight1: &str,
        weight2: &str,
        examples: &[Example],
        temperature: f64,
    ) -> Result<BatchEval> {
        let predictions = self
            .forward_with(weight1, weight2, examples, temperature)
            .await?;
        let mut losses: Vec<Option<f64>> = Vec::with_capacity(examples.len());
        let mut sum = 0.0;
        let mut usable = 0usize;
        for (pred, ex) in predictions.iter().zip(examples) {
            match pred {
                Some(p) => {
                    let l = self.loss.one(p, &ex.gold);
                    sum += l;
                    usable += 1;
                    losses.push(Some(l));
                }
                None => losses.push(None),
            }
        }
        if usable == 0 {
            return Err(DlnError::Unexpected(
                "no usable predictions in batch".to_string(),
            ));
        }
        let excluded = examples.len() - usable;
        Ok(BatchEval {
            accuracy: 1.0 - sum / usable as f64,
            losses,
            predictions,
            excluded,
        })
    }

    /// Forward pass + losses under the current weights.
    pub async fn evaluate(&self, examples: &[Example], temperature: f64) -> Result<BatchEval> {
        let (w1, w2) = self.weights();
        self.evaluate_with(&w1, &w2, examples, temperature).await
    }

    /// One optimization step over a batch. Returns the batch ELBO with its
    /// per-layer breakdown, the selected weights (possibly unchanged), and
    /// the batch loss under those weights.
    #[tracing::instrument(skip_all, fields(n = examples.len(), temperature))]
    pub async fn step(&mut self, examples: &[Example], temperature: f64) -> Result<StepOutcome> {
        if examples.is_empty() {
            return Err(DlnError::InvalidArgument(
                "step requires a non-empty batch".to_string(),
            ));
        }
        if self.layer1.is_some() {
            self.step_two_layer(examples, temperature).await
        } else {
            self.step_single_layer(examples, temperature).await
        }
    }

    async fn step_two_layer(
        &mut self,
        examples: &[Example],
        temperature: f64,
    ) -> Result<StepOutcome> {
        let (w1, w2) = self.weights();
        let n = examples.len();
        let beta = if self.cfg.posterior_sharpening_include_prior {
            1.0
        } else {
            0.0
        };

        // Posterior draws, conditioned on the gold label.
        let hidden_sets = self
            .posterior
            .sample(
                &w1,
                examples,
                self.cfg.num_h_samples,
                &self.cfg.bwd_params(),
                self.cfg.use_h_argmax,
            )
            .await?;

        // Score every draw under the input-only prior and under the class
        // layer, batched across the whole batch.
        let mut owner: Vec<(usize, usize)> = Vec::new();
        let mut prior_ctxs: Vec<String> = Vec::new();
        let mut prior_tgts: Vec<String> = Vec::new();
        let mut class_ctxs: Vec<String> = Vec::new();
        let mut class_golds: Vec<String> = Vec::new();
        for (i, samples) in hidden_sets.iter().enumerate() {
            for (j, h) in samples.iter().enumerate() {
                owner.push((i, j));
                prior_ctxs.push(self.hidden_ctx(&w1, &examples[i]));
                prior_tgts.push(h.text.clone());
                class_ctxs.push(self.class_ctx(&w2, &examples[i], &h.text));
                class_golds.push(examples[i].gold.clone());
            }
        }
        let priors = self.score.score_targets(&prior_ctxs, &prior_tgts).await?;
        let class_terms = self.class_terms(&class_ctxs, &class_golds).await?;
        let per_hidden_loss = self.per_hidden_losses(&class_ctxs, &class_golds).await?;

        // Batch predictions and losses under the current weights; used for
        // the exploration penalty fallback and the proposal meta-prompts.
        let eval = self
            .evaluate_with(&w1, &w2, examples, temperature)
            .await?;

        // Importance-weighted ELBO per example; unusable draws are excluded
        // from the average, fully failed examples from the batch.
        let mut per_ex_elbo1: Vec<f64> = Vec::new();
        let mut per_ex_elbo2: Vec<f64> = Vec::new();
        let mut best_hidden: Vec<Option<String>> = vec![None; n];
        let mut usable_texts: Vec<String> = Vec::new();
        let mut excluded = 0usize;

        for i in 0..n {
            let mut t1s: Vec<f64> = Vec::new();
            let mut t2s: Vec<f64> = Vec::new();
            let mut best: Option<(f64, &str)> = None;
            for (k, &(ex_idx, j)) in owner.iter().enumerate() {
                if ex_idx != i {
                    continue;
                }
                let (Some(prior), Some(class)) = (priors[k], class_terms[k]) else {
                    continue;
                };
                let h = &hidden_sets[i][j];
                let class_term = class / self.cfg.posterior_temp;
                let mut hidden_term = beta * prior - h.log_q;
                let failing = per_hidden_loss[k]
                    .or(eval.losses[i])
                    .map(|l| l > 0.0)
                    .unwrap_or(false);
                if failing && self.logp_penalty > 0.0 {
                    hidden_term -= self.logp_penalty;
                }
                t1s.push(hidden_term);
                t2s.push(class_term);
                usable_texts.push(h.text.clone());
                let weight = hidden_term + class_term;
                if best.map(|(b, _)| weight > b).unwrap_or(true) {
                    best = Some((weight, &h.text));
                }
            }
            if t1s.is_empty() {
                excluded += 1;
                tracing::warn!(example = i, "all hidden samples failed, example excluded");
                continue;
            }
            per_ex_elbo1.push(mean(&t1s));
            per_ex_elbo2.push(mean(&t2s));
            best_hidden[i] = best.map(|(_, text)| text.to_string());
        }
        self.excluded_total += excluded as u64;

        if per_ex_elbo1.is_empty() {
            return Err(DlnError::Unexpected(
                "every example in the batch lost all hidden samples".to_string(),
            ));
        }
        let elbo1 = require_finite(mean(&per_ex_elbo1))?;
        let elbo2 = require_finite(mean(&per_ex_elbo2))?;
        let mut elbo = elbo1 + elbo2;
        if self.cfg.posterior_sharpening_use_mi_regularization {
            elbo -= marginal_entropy(&usable_texts);
        }
        let elbo = require_finite(elbo)?;

        let usable_idx: Vec<usize> = (0..n).filter(|&i| best_hidden[i].is_some()).collect();
        let ranking_idx: Vec<usize> =
            if self.cfg.held_out_prompt_ranking && usable_idx.len() >= 2 {
                usable_idx[usable_idx.len() / 2..].to_vec()
            } else {
                usable_idx.clone()
            };

        let mut records: Vec<CandidateRecord> = Vec::new();

        // Class-layer update.
        let new_w2 = if self.cfg.train_p2 {
            let shown: Vec<ProposalExample> = usable_idx
                .iter()
                .map(|&i| ProposalExample {
                    input: self.class_ctx("", &examples[i], best_hidden[i].as_deref().unwrap_or("")),
                    target: examples[i].gold.clone(),
                    loss: eval.losses[i].unwrap_or(1.0),
                })
                .collect();
            let mut pool = vec![Candidate::current(&w2)];
            pool.extend(
                self.prompt_sampler2
                    .propose(&w2, &shown, self.cfg.num_p_samples, &self.cfg.proposal_params(2))
                    .await?,
            );
            self.extend_from_memory(&mut pool, 2);
            let (selected, recs) = self
                .select_from_pool(2, pool, examples, &best_hidden, &ranking_idx)
                .await?;
            records.extend(recs);
            selected
        } else {
            w2.clone()
        };

        // Hidden-layer update, possibly over several propose/select rounds.
        let mut new_w1 = w1.clone();
        if self.cfg.train_p1 {
            for _ in 0..self.cfg.num_p1_steps {
                let shown: Vec<ProposalExample> = usable_idx
                    .iter()
                    .map(|&i| ProposalExample {
                        input: examples[i].input.clone(),
                        target: best_hidden[i].clone().unwrap_or_default(),
                        loss: eval.losses[i].unwrap_or(1.0),
                    })
                    .collect();
                let mut pool = vec![Candidate::current(&new_w1)];
                pool.extend(
                    self.prompt_sampler1
                        .propose(
                            &new_w1,
                            &shown,
                            self.cfg.num_p_samples,
                            &self.cfg.proposal_params(1),
                        )
                        .await?,
                );
                self.extend_from_memory(&mut pool, 1);
                let (selected, recs) = self
                    .select_from_pool(1, pool, examples, &best_hidden, &ranking_idx)
                    .await?;
                records.extend(recs);
                if selected == new_w1 {
                    break;
                }
                new_w1 = selected;
            }
        }

        // Report the loss under the selected weights.
        let loss = if new_w1 != w1 || new_w2 != w2 {
            match self
                .evaluate_with(&new_w1, &new_w2, examples, temperature)
                .await
            {
                Ok(e) => 1.0 - e.accuracy,
                Err(e) => {
                    tracing::warn!(error = %e, "post-selection evaluation failed, reporting pre-step loss");
                    1.0 - eval.accuracy
                }
            }
        } else {
            1.0 - eval.accuracy
        };

        Ok(StepOutcome {
            elbo: ElboEstimate {
                value: elbo,
                elbo1,
                elbo2,
            },
            weight1: new_w1,
            weight2: new_w2,
            loss,
            candidates: records,
            excluded_examples: excluded,
        })
    }

    async fn step_single_layer(
        &mut self,
        examples: &[Example],
        temperature: f64,
    ) -> Result<StepOutcome> {
        let (_, w2) = self.weights();
        let n = examples.len();

        let ctxs: Vec<String> = examples
            .iter()
            .map(|ex| self.class_ctx(&w2, ex, ""))
            .collect();
        let golds: Vec<String> = examples.iter().map(|ex| ex.gold.clone()).collect();
        let terms = self.class_terms(&ctxs, &golds).await?;

        let usable: Vec<f64> = terms
            .iter()
            .flatten()
            .map(|t| t / self.cfg.posterior_temp)
            .collect();
        let excluded = n - usable.len();
        self.excluded_total += excluded as u64;
        if usable.is_empty() {
            return Err(DlnError::Unexpected(
                "no scorable examples in batch".to_string(),
            ));
        }
        let elbo2 = require_finite(mean(&usable))?;
        let elbo1 = 0.0;

        let eval = self.evaluate_with("", &w2, examples, temperature).await?;

        let best_hidden: Vec<Option<String>> = terms
            .iter()
            .map(|t| t.map(|_| String::new()))
            .collect();
        let usable_idx: Vec<usize> = (0..n).filter(|&i| best_hidden[i].is_some()).collect();
        let ranking_idx: Vec<usize> =
            if self.cfg.held_out_prompt_ranking && usable_idx.len() >= 2 {
                usable_idx[usable_idx.len() / 2..].to_vec()
            } else {
                usable_idx.clone()
            };

        let mut records: Vec<CandidateRecord> = Vec::new();
        let new_w2 = if self.cfg.train_p2 {
            let shown: Vec<ProposalExample> = usable_idx
                .iter()
                .map(|&i| ProposalExample {
                    input: examples[i].input.clone(),
                    target: examples[i].gold.clone(),
                    loss: eval.losses[i].unwrap_or(1.0),
                })
                .collect();
            let mut pool = vec![Candidate::current(&w2)];
            pool.extend(
                self.prompt_sampler2
                    .propose(&w2, &shown, self.cfg.num_p_samples, &self.cfg.proposal_params(2))
                    .await?,
            );
            self.extend_from_memory(&mut pool, 2);
            let (selected, recs) = self
                .select_from_pool(2, pool, examples, &best_hidden, &ranking_idx)
                .await?;
            records.extend(recs);
            selected
        } else {
            w2.clone()
        };

        let loss = if new_w2 != w2 {
            match self.evaluate_with("", &new_w2, examples, temperature).await {
                Ok(e) => 1.0 - e.accuracy,
                Err(e) => {
                    tracing::warn!(error = %e, "post-selection evaluation failed, reporting pre-step loss");
                    1.0 - eval.accuracy
                }
            }
        } else {
            1.0 - eval.accuracy
        };

        Ok(StepOutcome {
            elbo: ElboEstimate {
                value: elbo1 + elbo2,
                elbo1,
                elbo2,
            },
            weight1: String::new(),
            weight2: new_w2,
            loss,
            candidates: records,
            excluded_examples: excluded,
        })
    }

    /// Per-draw prediction losses, available only in class-constrained mode.
    async fn per_hidden_losses(
        &self,
        class_ctxs: &[String],
        golds: &[String],
    ) -> Result<Vec<Option<f64>>> {
        if !self.cfg.forward_use_classes {
            return Ok(vec![None; class_ctxs.len()]);
        }
        let classes = self.classes()?;
        let rows = self.score.score_classes(class_ctxs, classes).await?;
        Ok(rows
            .into_iter()
            .zip(golds)
            .map(|(row, gold)| {
                row.and_then(|r| {
                    r.iter()
                        .enumerate()
                        .max_by(|a, b| a.1.total_cmp(b.1))
                        .map(|(k, _)| self.loss.one(&classes.protos()[k], gold))
                })
            })
            .collect())
    }

    /// Memory entries join the pool as a historical fallback that cannot be
    /// sampled away.
    fn extend_from_memory(&self, pool: &mut Vec<Candidate>, layer: u8) {
        if !self.memory.is_enabled() {
            return;
        }
        for entry in self.memory.top() {
            let text = if layer == 1 {
                &entry.weight1
            } else {
                &entry.weight2
            };
            if text.is_empty() || pool.iter().any(|c| &c.text == text) {
                continue;
            }
            pool.push(Candidate {
                text: text.clone(),
                source: CandidateSource::Memory,
            });
        }
    }

    async fn candidate_score(
        &self,
        layer: u8,
        weight: &str,
        examples: &[Example],
        best_hidden: &[Option<String>],
        idxs: &[usize],
    ) -> Result<Option<f64>> {
        let scores: Vec<Option<f64>> = if layer == 1 {
            let ctxs: Vec<String> = idxs
                .iter()
                .map(|&i| self.hidden_ctx(weight, &examples[i]))
                .collect();
            let tgts: Vec<String> = idxs
                .iter()
                .map(|&i| best_hidden[i].clone().unwrap_or_default())
                .collect();
            self.score.score_targets(&ctxs, &tgts).await?
        } else {
            let ctxs: Vec<String> = idxs
                .iter()
                .map(|&i| {
                    self.class_ctx(weight, &examples[i], best_hidden[i].as_deref().unwrap_or(""))
                })
                .collect();
            let golds: Vec<String> = idxs.iter().map(|&i| examples[i].gold.clone()).collect();
            self.class_terms(&ctxs, &golds).await?
        };
        let usable: Vec<f64> = scores.into_iter().flatten().collect();
        if usable.is_empty() {
            Ok(None)
        } else {
            Ok(Some(mean(&usable)))
        }
    }

    /// Rank a candidate pool and pick the winner. The current weight is
    /// always in the pool; ties keep it (no spurious churn), trust-region
    /// gating rejects candidates whose estimated divergence exceeds the
    /// threshold, and an unrankable pool leaves the weight unchanged.
    async fn select_from_pool(
        &self,
        layer: u8,
        pool: Vec<Candidate>,
        examples: &[Example],
        best_hidden: &[Option<String>],
        ranking_idx: &[usize],
    ) -> Result<(String, Vec<CandidateRecord>)> {
        let mut scored: Vec<(Candidate, Option<f64>)> = Vec::with_capacity(pool.len());
        for candidate in pool {
            let s = self
                .candidate_score(layer, &candidate.text, examples, best_hidden, ranking_idx)
                .await?;
            scored.push((candidate, s));
        }

        let current_score = scored
            .iter()
            .find(|(c, _)| c.source == CandidateSource::Current)
            .and_then(|(_, s)| *s);

        let mut best_idx = 0usize;
        let mut best_score = current_score;
        let mut divergences: Vec<Option<f64>> = vec![None; scored.len()];
        for (k, (candidate, score)) in scored.iter().enumerate() {
            if candidate.source == CandidateSource::Current {
                continue;
            }
            let Some(score) = *score else { continue };
            let Some(current) = current_score else {
                // Current weight unrankable: keep it rather than risk a
                // blind swap.
                continue;
            };
            let div = self.divergence.estimate(current, score);
            divergences[k] = Some(div);
            if self.cfg.trust_factor > 0.0 && div > self.cfg.trust_factor {
                tracing::debug!(layer, div, "candidate rejected by trust region");
                continue;
            }
            if best_score.map(|b| score > b).unwrap_or(false) {
                best_idx = k;
                best_score = Some(score);
            }
        }

        let records: Vec<CandidateRecord> = scored
            .iter()
            .enumerate()
            .map(|(k, (candidate, score))| CandidateRecord {
                layer,
                text: candidate.text.clone(),
                source: candidate.source,
                score: *score,
                divergence: divergences[k],
                accepted: k == best_idx,
            })
            .collect();

        Ok((scored[best_idx].0.text.clone(), records))
    }
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Entropy of the empirical marginal over hidden texts across the batch.
fn marginal_entropy(texts: &[String]) -> f64 {
    if texts.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in texts {
        *counts.entry(t.as_str()).or_insert(0) += 1;
    }
    let n = texts.len() as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.ln()
        })
        .sum()
}
