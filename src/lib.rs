//! dln_vi: two-layer deep language network trained with variational inference.
//!
//! The "parameters" are natural-language prompt strings: a hidden layer
//! proposes an intermediate rationale, a class layer maps the rationale to a
//! final label, and both prompts are refined each iteration from
//! log-probability feedback. Text generation, datasets, and metrics storage
//! are collaborators behind narrow traits; this crate is the optimizer.

#![forbid(unsafe_code)]

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod layer;
pub mod loss;
pub mod memory;
pub mod model;
pub mod models;
pub mod operator;
pub mod report;
pub mod sampler;
pub mod score;
pub mod template;
pub mod trainer;
pub mod trust;

pub type Result<T> = std::result::Result<T, DlnError>;

#[derive(thiserror::Error, Debug)]
pub enum DlnError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

pub use cache::ValidationCache;
pub use checkpoint::{CheckpointTracker, TrackerState, Validation};
pub use config::VIConfig;
pub use dataset::{DataSource, InMemoryDataset, Split};
pub use layer::Layer;
pub use loss::{postprocess_prediction, Loss};
pub use memory::{MemoryEntry, PromptMemory};
pub use model::{BatchEval, VIModel};
pub use models::{
    Candidate, CandidateRecord, CandidateSource, ElboEstimate, Example, HiddenSample,
    OutputClasses, StepOutcome, StepRecord, TrainOutcome,
};
pub use operator::{Completion, CostScope, CostTracker, Operator, SamplingParams};
pub use report::{MetricsSink, NullSink, ResultLogWriter};
pub use sampler::{PosteriorSampler, PromptSampler};
pub use score::LogProbsScore;
pub use template::PromptTemplate;
pub use trainer::{TrainContext, Trainer};
pub use trust::{DivergenceEstimator, ScoreDropDivergence};
