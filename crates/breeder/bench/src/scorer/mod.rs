//! Per-sample scorers.
//!
//! Every scorer maps `(sample, model_output)` to a value in `[0, 1]`.
//! Outputs that begin with `Error:` come from failed candidate runs and score
//! zero without consulting the scorer.

mod choice;
mod grid;
mod judge;
pub mod math;
mod trace;

pub use choice::MultiChoiceScorer;
pub use grid::{parse_grid, percentage_match, GridScorer};
pub use judge::{JudgeMode, LlmJudgeScorer};
pub use math::{match_latex, MathScorer};
pub use trace::{trace_score, TraceScorer};

use crate::dataset::Sample;
use crate::BenchResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of scoring one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub name: String,
    pub value: f64,
    pub explanation: Option<String>,
}

impl Score {
    /// `value` is clamped to `[0, 1]`.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: value.clamp(0.0, 1.0),
            explanation: None,
        }
    }

    pub fn explained(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }
}

/// Grades one answer against its sample.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn score(&self, sample: &Sample, output: &str) -> BenchResult<Score>;
}

/// Whether `output` is the recorded answer of a failed candidate run.
pub fn is_failed_answer(output: &str) -> bool {
    output.trim_start().starts_with("Error:")
}
