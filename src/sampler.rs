use crate::models::{Candidate, CandidateSource, Example, HiddenSample};
use crate::operator::{Operator, SamplingParams};
use crate::template::PromptTemplate;
use crate::Result;
use std::sync::Arc;

/// Draws candidate hidden-state samples conditioned on the input *and* the
/// gold label (the backward direction), so the draws approximate the
/// posterior over the rationale rather than the input-only prior.
pub struct PosteriorSampler {
    operator: Arc<dyn Operator>,
    template: PromptTemplate,
}

impl PosteriorSampler {
    #[tracing::instrument(skip_all)]
    pub fn new(operator: Arc<dyn Operator>, template: PromptTemplate) -> Self {
        Self { operator, template }
    }

    /// The label-conditioned sampling context for one example.
    pub fn context(&self, weight: &str, example: &Example) -> String {
        self.template.render(&[
            ("prompt", weight),
            ("input", &example.input),
            ("options", example.options().unwrap_or("")),
            ("gold", &example.gold),
        ])
    }

    /// Draw `num_samples` posterior samples per example, each carrying its
    /// log-probability under the posterior. In argmax mode only the single
    /// highest-probability sample is kept (deterministic, for evaluation).
    ///
    /// Failed or empty generations are skipped with a warning; an example may
    /// come back with fewer samples than requested, or none.
    #[tracing::instrument(skip_all, fields(n = examples.len(), num_samples))]
    pub async fn sample(
        &self,
        weight: &str,
        examples: &[Example],
        num_samples: usize,
        params: &SamplingParams,
        argmax: bool,
    ) -> Result<Vec<Vec<HiddenSample>>> {
        let contexts: Vec<String> = examples
            .iter()
            .map(|ex| self.context(weight, ex))
            .collect();

        let mut flat = Vec::with_capacity(examples.len() * num_samples);
        for ctx in &contexts {
            for _ in 0..num_samples {
                flat.push(ctx.clone());
            }
        }
        let completions = self.operator.invoke_batch(&flat, params).await;

        // Score each surviving draw under the posterior to get log q(h|x,y).
        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut owner: Vec<usize> = Vec::new();
        for (flat_idx, completion) in completions.into_iter().enumerate() {
            let example_idx = flat_idx / num_samples;
            match completion {
                Ok(c) => {
                    let text = c.text.trim().to_string();
                    if text.is_empty() {
                        tracing::warn!(example_idx, "empty hidden sample skipped");
                        continue;
                    }
                    pairs.push((contexts[example_idx].clone(), text));
                    owner.push(example_idx);
                }
                Err(e) => {
                    tracing::warn!(example_idx, error = %e, "hidden sample generation failed");
                }
            }
        }
        let log_qs = self.operator.score_batch(&pairs).await;

        let mut out: Vec<Vec<HiddenSample>> = vec![Vec::new(); examples.len()];
        for (((_, text), example_idx), log_q) in pairs.into_iter().zip(owner).zip(log_qs) {
            match log_q {
                Ok(log_q) if log_q.is_finite() => {
                    out[example_idx].push(HiddenSample { text, log_q });
                }
                Ok(log_q) => {
                    tracing::warn!(example_idx, log_q, "non-finite posterior log-prob skipped");
                }
                Err(e) => {
                    tracing::warn!(example_idx, error = %e, "posterior scoring failed");
                }
            }
        }

        if argmax {
            for samples in &mut out {
                if let Some(best) = samples
                    .iter()
                    .max_by(|a, b| a.log_q.total_cmp(&b.log_q))
                    .cloned()
                {
                    *samples = vec![best];
                }
            }
        }
        Ok(out)
    }
}

/// One example shown to the prompt-proposal meta-prompt, with the target the
/// layer should have produced and whether it did.
#[derive(Debug, Clone)]
pub struct ProposalExample {
    pub input: String,
    pub target: String,
    pub loss: f64,
}

/// Proposes candidate replacement prompts for a layer by invoking the
/// backward generation path with a meta-prompt summarizing failure modes.
///
/// Proposals are stochastic: the same weight and batch may yield different
/// candidates across calls.
pub struct PromptSampler {
    operator: Arc<dyn Operator>,
    template: PromptTemplate,
}

/// Examples shown in one meta-prompt; failures first, truncated past this.
const MAX_SHOWN_EXAMPLES: usize = 10;

impl PromptSampler {
    #[tracing::instrument(skip_all)]
    pub fn new(operator: Arc<dyn Operator>, template: PromptTemplate) -> Self {
        Self { operator, template }
    }

    fn meta_prompt(&self, current: &str, shown: &[ProposalExample]) -> String {
        let mut ordered: Vec<&ProposalExample> = shown.iter().collect();
        ordered.sort_by(|a, b| b.loss.total_cmp(&a.loss));
        ordered.truncate(MAX_SHOWN_EXAMPLES);

        let mut block = String::new();
        for ex in ordered {
            block.push_str(&format!(
                "Input: {}\nExpected: {}\nResult: {}\n\n",
                ex.input,
                ex.target,
                if ex.loss > 0.0 { "wrong" } else { "correct" }
            ));
        }
        self.template
            .render(&[("prompt", current), ("examples", &block)])
    }

    /// Propose up to `num_samples` candidates. Empty proposals and proposals
    /// identical to the current weight are degenerate and dropped; the result
    /// may be shorter than requested, or empty.
    #[tracing::instrument(skip_all, fields(num_samples))]
    pub async fn propose(
        &self,
        current: &str,
        shown: &[ProposalExample],
        num_samples: usize,
        params: &SamplingParams,
    ) -> Result<Vec<Candidate>> {
        let meta = self.meta_prompt(current, shown);
        let prompts = vec![meta; num_samples];
        let completions = self.operator.invoke_batch(&prompts, params).await;

        let mut out = Vec::with_capacity(num_samples);
        for completion in completions {
            match completion {
                Ok(c) => {
                    let text = c.text.trim().to_string();
                    if text.is_empty() || text == current {
                        tracing::debug!("degenerate prompt candidate dropped");
                        continue;
                    }
                    out.push(Candidate {
                        text,
                        source: CandidateSource::Sampled,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "prompt proposal failed, treating as missing");
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{Completion, CostTracker};
    use crate::template;
    use crate::DlnError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        cost: CostTracker,
        outputs: Mutex<Vec<Result<String>>>,
        seen_prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(outputs: Vec<Result<String>>) -> Self {
            Self {
                cost: CostTracker::new(),
                outputs: Mutex::new(outputs),
                seen_prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Operator for Scripted {
        async fn invoke(&self, prompt: &str, _params: &SamplingParams) -> Result<Completion> {
            self.seen_prompts.lock().unwrap().push(prompt.to_string());
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.is_empty() {
                return Ok(Completion::text("fallback"));
            }
            outputs.remove(0).map(Completion::text)
        }

        async fn score(&self, _context: &str, target: &str) -> Result<f64> {
            Ok(-(target.len() as f64))
        }

        fn cost(&self) -> &CostTracker {
            &self.cost
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn example() -> Example {
        Example::new("the movie was tedious", "negative")
    }

    #[tokio::test]
    async fn posterior_context_is_label_conditioned() {
        let op = Arc::new(Scripted::new(vec![Ok("because it drags".to_string())]));
        let sampler = PosteriorSampler::new(op.clone(), template::lookup("suffix_backward").unwrap());
        let out = sampler
            .sample("Think step by step.", &[example()], 1, &SamplingParams::default(), false)
            .await
            .unwrap();
        assert_eq!(out[0].len(), 1);
        let seen = op.seen_prompts.lock().unwrap();
        assert!(seen[0].contains("negative"), "gold label must condition the draw");
    }

    #[tokio::test]
    async fn failed_and_empty_draws_are_skipped() {
        let op = Arc::new(Scripted::new(vec![
            Ok("a rationale".to_string()),
            Err(DlnError::Llm("timeout".to_string())),
            Ok("   ".to_string()),
        ]));
        let sampler = PosteriorSampler::new(op, template::lookup("suffix_backward").unwrap());
        let out = sampler
            .sample("p", &[example()], 3, &SamplingParams::default(), false)
            .await
            .unwrap();
        assert_eq!(out[0].len(), 1);
        assert_eq!(out[0][0].text, "a rationale");
    }

    #[tokio::test]
    async fn argmax_keeps_single_most_probable_sample() {
        // score() returns -len, so the shortest text has the highest log q.
        let op = Arc::new(Scripted::new(vec![
            Ok("a much longer rationale".to_string()),
            Ok("short".to_string()),
        ]));
        let sampler = PosteriorSampler::new(op, template::lookup("suffix_backward").unwrap());
        let out = sampler
            .sample("p", &[example()], 2, &SamplingParams::default(), true)
            .await
            .unwrap();
        assert_eq!(out[0].len(), 1);
        assert_eq!(out[0][0].text, "short");
    }

    #[tokio::test]
    async fn degenerate_candidates_are_dropped() {
        let op = Arc::new(Scripted::new(vec![
            Ok("A better instruction.".to_string()),
            Ok("".to_string()),
            Ok("current prompt".to_string()),
        ]));
        let sampler = PromptSampler::new(op, template::lookup("instruction_proposal").unwrap());
        let shown = vec![ProposalExample {
            input: "x".to_string(),
            target: "y".to_string(),
            loss: 1.0,
        }];
        let out = sampler
            .propose("current prompt", &shown, 3, &SamplingParams::default())
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "A better instruction.");
        assert_eq!(out[0].source, CandidateSource::Sampled);
    }

    #[tokio::test]
    async fn meta_prompt_summarizes_failures_first() {
        let op = Arc::new(Scripted::new(vec![Ok("new".to_string())]));
        let sampler = PromptSampler::new(op.clone(), template::lookup("instruction_proposal").unwrap());
        let shown = vec![
            ProposalExample {
                input: "good one".to_string(),
                target: "a".to_string(),
                loss: 0.0,
            },
            ProposalExample {
                input: "bad one".to_string(),
                target: "b".to_string(),
                loss: 1.0,
            },
        ];
        sampler
            .propose("current", &shown, 1, &SamplingParams::default())
            .await
            .unwrap();
        let seen = op.seen_prompts.lock().unwrap();
        let wrong = seen[0].find("bad one").unwrap();
        let right = seen[0].find("good one").unwrap();
        assert!(wrong < right);
        assert!(seen[0].contains("Result: wrong"));
    }
}
