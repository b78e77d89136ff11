use crate::operator::SamplingParams;
use crate::{loss, template, DlnError, Result};
use serde::{Deserialize, Serialize};

/// Full configuration surface of the variational training loop.
///
/// Validation is fail-fast at construction time, before any operator cost is
/// incurred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VIConfig {
    /// Candidate replacement prompts proposed per layer per step.
    pub num_p_samples: usize,
    /// Posterior draws per example per step.
    pub num_h_samples: usize,
    /// Two-layer mode (hidden + class). Single-layer mode drops the hidden
    /// layer entirely.
    pub two_layers: bool,
    /// Return the single highest-probability posterior sample instead of a
    /// stochastic draw.
    pub use_h_argmax: bool,
    /// Trust-region gating threshold; 0 disables gating.
    pub trust_factor: f64,
    /// Consecutive non-improving validations before rolling back to the best
    /// checkpoint. Negative disables rollback.
    pub tolerance: i32,
    /// Capacity of the historical prompt-pair memory; 0 disables it.
    pub use_memory: usize,
    /// Rank candidate prompts on a held-out split of the batch instead of the
    /// full batch.
    pub held_out_prompt_ranking: bool,
    /// Update the hidden layer's prompt. When false the weight is never
    /// replaced.
    pub train_p1: bool,
    /// Update the class layer's prompt.
    pub train_p2: bool,
    /// Exploration bonus subtracted from hidden samples whose associated loss
    /// was nonzero.
    pub logp_penalty: f64,
    /// Decay `logp_penalty` linearly, reaching zero at the last iteration.
    pub decay_logp_penalty: bool,
    /// Include the prior term (beta = 1) in the posterior-sharpened ELBO.
    pub posterior_sharpening_include_prior: bool,
    /// Subtract the marginal entropy of the hidden samples across the batch.
    pub posterior_sharpening_use_mi_regularization: bool,
    /// Scales the class-layer log-probability term: <1 sharpens, >1 flattens.
    pub posterior_temp: f64,
    /// Constrain the forward pass to the task's output classes and score
    /// contrastively against them.
    pub forward_use_classes: bool,
    /// Propose-and-select rounds for the hidden layer per training step.
    pub num_p1_steps: usize,

    /// Forward generation temperature.
    pub fwd_temp: f64,
    /// Backward (posterior / proposal) generation temperature.
    pub bwd_temp: f64,
    pub fwd_max_tokens: usize,
    pub bwd_max_tokens: usize,
    /// Max tokens when proposing hidden-layer prompts.
    pub p1_max_tokens: usize,
    /// Max tokens when proposing class-layer prompts.
    pub p2_max_tokens: usize,

    /// Named template for the hidden layer's forward pass.
    pub p_hidden: String,
    /// Named template for the class layer's forward pass.
    pub p_class: String,
    /// Named template for posterior (label-conditioned) sampling.
    pub q_hidden: String,
    /// Named meta-prompt template for prompt proposals.
    pub q_prompt: String,

    /// Scoring mode for output predictions.
    pub output_scoring_function: String,
    /// Scoring mode for hidden states.
    pub hidden_scoring_function: String,
    /// Named loss function; see [`loss::Loss::available`].
    pub loss_function: String,

    /// Training iterations (the loop runs one extra validation point).
    pub iters: usize,
    pub batch_size: usize,
    pub eval_batch_size: usize,
    /// Validate every this many iterations.
    pub val_freq: usize,
    /// Also validate at iteration 0, before any update.
    pub do_first_eval: bool,
    /// Balance training batches across gold classes.
    pub balance_batch: bool,
    /// Initial hidden-layer prompt; empty by default.
    pub init_p1: String,
    /// Initial class-layer prompt; the dataset's instruction when empty.
    pub init_p2: String,
    /// RNG seed for batch sampling.
    pub seed: u64,
}

impl Default for VIConfig {
    fn default() -> Self {
        Self {
            num_p_samples: 5,
            num_h_samples: 3,
            two_layers: true,
            use_h_argmax: false,
            trust_factor: 0.0,
            tolerance: -1,
            use_memory: 0,
            held_out_prompt_ranking: false,
            train_p1: true,
            train_p2: true,
            logp_penalty: 0.0,
            decay_logp_penalty: true,
            posterior_sharpening_include_prior: true,
            posterior_sharpening_use_mi_regularization: false,
            posterior_temp: 1.0,
            forward_use_classes: true,
            num_p1_steps: 1,
            fwd_temp: 0.0,
            bwd_temp: 0.7,
            fwd_max_tokens: 256,
            bwd_max_tokens: 512,
            p1_max_tokens: 256,
            p2_max_tokens: 20,
            p_hidden: "suffix_forward".to_string(),
            p_class: "classify_forward".to_string(),
            q_hidden: "suffix_backward".to_string(),
            q_prompt: "instruction_proposal".to_string(),
            output_scoring_function: "logprobs".to_string(),
            hidden_scoring_function: "logprobs".to_string(),
            loss_function: "exact_match_loss".to_string(),
            iters: 20,
            batch_size: 20,
            eval_batch_size: 20,
            val_freq: 2,
            do_first_eval: false,
            balance_batch: false,
            init_p1: String::new(),
            init_p2: String::new(),
            seed: 42,
        }
    }
}

impl VIConfig {
    #[tracing::instrument(skip_all)]
    pub fn validate(&self) -> Result<()> {
        if self.num_p_samples == 0 {
            return Err(DlnError::InvalidConfig(
                "num_p_samples must be > 0".to_string(),
            ));
        }
        if self.num_h_samples == 0 {
            return Err(DlnError::InvalidConfig(
                "num_h_samples must be > 0".to_string(),
            ));
        }
        if self.num_p1_steps == 0 {
            return Err(DlnError::InvalidConfig(
                "num_p1_steps must be > 0".to_string(),
            ));
        }
        if !self.posterior_temp.is_finite() || self.posterior_temp <= 0.0 {
            return Err(DlnError::InvalidConfig(
                "posterior_temp must be finite and > 0".to_string(),
            ));
        }
        if !self.trust_factor.is_finite() || self.trust_factor < 0.0 {
            return Err(DlnError::InvalidConfig(
                "trust_factor must be finite and >= 0".to_string(),
            ));
        }
        if !self.logp_penalty.is_finite() || self.logp_penalty < 0.0 {
            return Err(DlnError::InvalidConfig(
                "logp_penalty must be finite and >= 0".to_string(),
            ));
        }
        if self.batch_size == 0 || self.eval_batch_size == 0 {
            return Err(DlnError::InvalidConfig(
                "batch sizes must be > 0".to_string(),
            ));
        }
        if self.val_freq == 0 {
            return Err(DlnError::InvalidConfig("val_freq must be > 0".to_string()));
        }
        for mode in [&self.output_scoring_function, &self.hidden_scoring_function] {
            if mode != "logprobs" {
                return Err(DlnError::InvalidConfig(format!(
                    "unsupported scoring function: {mode}"
                )));
            }
        }
        loss::Loss::from_name(&self.loss_function)?;
        for name in [&self.p_hidden, &self.p_class, &self.q_hidden, &self.q_prompt] {
            template::lookup(name)?;
        }
        if !self.two_layers && self.train_p1 {
            return Err(DlnError::InvalidConfig(
                "train_p1 requires two_layers".to_string(),
            ));
        }
        Ok(())
    }

    /// Initial weight pair; the class layer falls back to the dataset's task
    /// instruction when `init_p2` is not set.
    pub fn initial_weights(&self, instruction: &str) -> (String, String) {
        let p2 = if self.init_p2.is_empty() {
            instruction.to_string()
        } else {
            self.init_p2.clone()
        };
        (self.init_p1.clone(), p2)
    }

    /// Forward generation parameters; `temperature` overrides `fwd_temp` when
    /// finite and non-negative.
    pub fn fwd_params(&self, temperature: f64) -> SamplingParams {
        SamplingParams {
            temperature: if temperature.is_finite() && temperature >= 0.0 {
                temperature
            } else {
                self.fwd_temp
            },
            max_tokens: self.fwd_max_tokens,
            stop: Some("\n\n".to_string()),
        }
    }

    /// Backward generation parameters used for posterior sampling.
    pub fn bwd_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.bwd_temp,
            max_tokens: self.bwd_max_tokens,
            stop: None,
        }
    }

    /// Backward parameters for proposing a replacement prompt for `layer`.
    pub fn proposal_params(&self, layer: u8) -> SamplingParams {
        SamplingParams {
            temperature: self.bwd_temp,
            max_tokens: if layer == 1 {
                self.p1_max_tokens
            } else {
                self.p2_max_tokens
            },
            stop: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(VIConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_samples() {
        let cfg = VIConfig {
            num_h_samples: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(DlnError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_unknown_loss_before_any_cost() {
        let cfg = VIConfig {
            loss_function: "no_such_loss".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_scoring_mode() {
        let cfg = VIConfig {
            output_scoring_function: "accuracy".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_template() {
        let cfg = VIConfig {
            q_prompt: "no_such_template".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn class_weight_falls_back_to_instruction() {
        let cfg = VIConfig::default();
        let (p1, p2) = cfg.initial_weights("Answer the question.");
        assert_eq!(p1, "");
        assert_eq!(p2, "Answer the question.");

        let cfg = VIConfig {
            init_p2: "Classify it.".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.initial_weights("ignored").1, "Classify it.");
    }

    #[test]
    fn single_layer_cannot_train_p1() {
        let cfg = VIConfig {
            two_layers: false,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = VIConfig {
            two_layers: false,
            train_p1: false,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
