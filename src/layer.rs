use crate::operator::{Operator, SamplingParams};
use crate::template::PromptTemplate;
use crate::Result;
use std::sync::Arc;

/// One layer of the network: a prompt string ("weight") plus the template
/// that substitutes it around an input. The weight is immutable once set and
/// replaced whole on each accepted update, never mutated in place.
pub struct Layer {
    id: &'static str,
    weight: String,
    template: PromptTemplate,
    operator: Arc<dyn Operator>,
}

impl Layer {
    #[tracing::instrument(skip_all)]
    pub fn new(
        id: &'static str,
        weight: impl Into<String>,
        template: PromptTemplate,
        operator: Arc<dyn Operator>,
    ) -> Self {
        Self {
            id,
            weight: weight.into(),
            template,
            operator,
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn weight(&self) -> &str {
        &self.weight
    }

    #[tracing::instrument(skip_all, fields(layer = self.id))]
    pub fn set_weight(&mut self, weight: String) {
        self.weight = weight;
    }

    /// Render this layer's prompt context for one example with the current
    /// weight.
    pub fn context(&self, vars: &[(&str, &str)]) -> String {
        self.context_with(&self.weight, vars)
    }

    /// Render with a substitute weight (candidate ranking path).
    pub fn context_with(&self, weight: &str, vars: &[(&str, &str)]) -> String {
        let mut all: Vec<(&str, &str)> = Vec::with_capacity(vars.len() + 1);
        all.push(("prompt", weight));
        all.extend_from_slice(vars);
        self.template.render(&all)
    }

    /// Forward the rendered contexts through the operator. One result per
    /// context, in order; failures propagate per item for the caller to treat
    /// as missing. Side effect: the operator's cost counter advances.
    #[tracing::instrument(skip_all, fields(layer = self.id, n = contexts.len()))]
    pub async fn forward(
        &self,
        contexts: &[String],
        params: &SamplingParams,
    ) -> Vec<Result<String>> {
        self.operator
            .invoke_batch(contexts, params)
            .await
            .into_iter()
            .map(|r| r.map(|c| c.text.trim().to_string()))
            .collect()
    }
}
