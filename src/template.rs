use crate::{DlnError, Result};

/// A prompt template with `{name}` placeholders.
///
/// Rendering substitutes every provided variable; placeholders without a
/// variable are left in place, and an absent `{options}` block collapses to
/// nothing so option-free tasks do not carry an empty section.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    #[tracing::instrument(skip_all)]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    #[tracing::instrument(skip_all)]
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut out = self.text.clone();
        for (key, value) in vars {
            out = out.replace(&format!("{{{key}}}"), value);
        }
        // Collapse any leftover options block.
        out = out.replace("\n\nOptions:\n{options}", "");
        out = out.replace("{options}", "");
        collapse_blank_runs(out.trim().to_string())
    }
}

fn collapse_blank_runs(s: String) -> String {
    let mut out = String::with_capacity(s.len());
    let mut blank_run = 0usize;
    for line in s.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    out
}

/// Hidden-layer forward pass: rationale from the input alone.
const SUFFIX_FORWARD: &str = "{input}\n\nOptions:\n{options}\n\n{prompt}";

/// Class-layer forward pass over the input and the rationale.
const CLASSIFY_FORWARD: &str =
    "{input}\n\n{hidden}\n\nOptions:\n{options}\n\n{prompt}\nAnswer:";

/// Class-layer residual variant: falls back to the raw input when the hidden
/// layer produced nothing usable.
const CLASSIFY_RESIDUAL: &str = "{input}\n\nOptions:\n{options}\n\n{prompt}\nAnswer:";

/// Posterior sampling: conditioned on the gold answer, unlike the forward
/// prior. This asymmetry is what makes it a better proposal than the prior.
const SUFFIX_BACKWARD: &str = "{input}\n\nOptions:\n{options}\n\n{prompt}\n\n\
The correct answer is: {gold}\n\n\
Write the reasoning that leads to this answer. Do not mention the answer was given.";

/// Meta-prompt for proposing a replacement instruction from observed failures.
const INSTRUCTION_PROPOSAL: &str = "A language model was given the instruction below and \
produced the outputs shown.\n\n\
Instruction: {prompt}\n\n\
{examples}\n\
Write an improved instruction that fixes the wrong outputs while keeping the correct ones. \
Output only the new instruction.";

#[tracing::instrument(skip_all)]
pub fn lookup(name: &str) -> Result<PromptTemplate> {
    let text = match name {
        "suffix_forward" => SUFFIX_FORWARD,
        "classify_forward" => CLASSIFY_FORWARD,
        "classify_residual" => CLASSIFY_RESIDUAL,
        "suffix_backward" => SUFFIX_BACKWARD,
        "instruction_proposal" => INSTRUCTION_PROPOSAL,
        other => {
            return Err(DlnError::InvalidConfig(format!(
                "unknown prompt template: {other}"
            )))
        }
    };
    Ok(PromptTemplate::new(text))
}

pub fn available() -> &'static [&'static str] {
    &[
        "suffix_forward",
        "classify_forward",
        "classify_residual",
        "suffix_backward",
        "instruction_proposal",
    ]
}
