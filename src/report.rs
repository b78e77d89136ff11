use crate::models::StepRecord;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use ulid::Ulid;

/// Result/metrics sink contract. The optimizer hands over weights, scalar
/// metrics, and candidate provenance per iteration; persistence format is the
/// collaborator's business.
pub trait MetricsSink: Send {
    fn log_metric(&mut self, step: usize, name: &str, value: f64);

    fn write_step(&mut self, record: &StepRecord) -> Result<()>;
}

/// Sink that drops everything. Useful in tests and cost-only runs.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn log_metric(&mut self, _step: usize, _name: &str, _value: f64) {}

    fn write_step(&mut self, _record: &StepRecord) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetricPoint {
    step: usize,
    name: String,
    value: f64,
}

/// Accumulated result log of one run, serializable to JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultLog {
    pub run_id: Ulid,
    pub dataset: String,
    pub created_at: DateTime<Utc>,
    metrics: Vec<MetricPoint>,
    steps: Vec<StepRecord>,
}

/// [`MetricsSink`] that accumulates records in memory and writes one JSON
/// file on save.
#[derive(Debug)]
pub struct ResultLogWriter {
    log: ResultLog,
    path: Option<PathBuf>,
}

impl ResultLogWriter {
    #[tracing::instrument(skip_all, fields(dataset))]
    pub fn new(dataset: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self {
            log: ResultLog {
                run_id: Ulid::new(),
                dataset: dataset.into(),
                created_at: Utc::now(),
                metrics: Vec::new(),
                steps: Vec::new(),
            },
            path,
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.log)?)
    }

    /// Write the accumulated log to the configured path, if any.
    #[tracing::instrument(skip_all)]
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.log.steps
    }
}

impl MetricsSink for ResultLogWriter {
    fn log_metric(&mut self, step: usize, name: &str, value: f64) {
        self.log.metrics.push(MetricPoint {
            step,
            name: name.to_string(),
            value,
        });
    }

    fn write_step(&mut self, record: &StepRecord) -> Result<()> {
        self.log.steps.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CandidateRecord, CandidateSource};
    use std::collections::BTreeMap;

    fn record() -> StepRecord {
        let mut metrics = BTreeMap::new();
        metrics.insert("elbo".to_string(), -1.25);
        StepRecord {
            step: 3,
            weights: vec!["w1".to_string(), "w2".to_string()],
            metrics,
            candidates: vec![CandidateRecord {
                layer: 2,
                text: "new prompt".to_string(),
                source: CandidateSource::Sampled,
                score: Some(-0.5),
                divergence: Some(0.0),
                accepted: true,
            }],
        }
    }

    #[test]
    fn accumulates_steps_and_metrics() {
        let mut w = ResultLogWriter::new("subj", None);
        w.log_metric(3, "dev_acc", 0.8);
        w.write_step(&record()).unwrap();
        assert_eq!(w.steps().len(), 1);
        let json = w.to_json_pretty().unwrap();
        assert!(json.contains("dev_acc"));
        assert!(json.contains("new prompt"));
    }

    #[test]
    fn saves_json_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result_data.json");
        let mut w = ResultLogWriter::new("subj", Some(path.clone()));
        w.write_step(&record()).unwrap();
        w.save().unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["dataset"], "subj");
    }
}
