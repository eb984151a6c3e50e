//! Runs candidates over benchmark samples and aggregates their scores.

use crate::registry::Benchmark;
use crate::scorer::{is_failed_answer, Scorer};
use crate::stats::{bootstrap_ci_blocking, mean, BootstrapConfig};
use crate::dataset::Sample;
use breeder_gateway::Gateway;
use breeder_runtime::{CandidateExecutor, CandidateProgram, TaskInput, DEFAULT_TASK_TIMEOUT};
use breeder_types::{ConfidenceInterval, SystemId};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How samples are run and aggregated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Samples of one system run concurrently.
    pub concurrency: usize,
    #[serde(with = "secs")]
    pub task_timeout: Duration,
    pub bootstrap: BootstrapConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            bootstrap: BootstrapConfig::default(),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Samples of one benchmark to score a system on.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub benchmark: Benchmark,
    pub samples: Vec<Sample>,
}

impl TaskSpec {
    /// Samples are scored in the order given.
    pub fn new(benchmark: Benchmark, samples: Vec<Sample>) -> Self {
        Self { benchmark, samples }
    }
}

/// Aggregate of one system on one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub accuracy: f64,
    /// `None` when fewer than two samples succeeded.
    pub ci: Option<ConfidenceInterval>,
    pub sample_size: usize,
    /// Samples whose candidate run or scorer failed.
    pub failures: usize,
}

impl TaskReport {
    pub fn ci_lower(&self) -> Option<f64> {
        self.ci.map(|ci| ci.lower)
    }

    pub fn ci_upper(&self) -> Option<f64> {
        self.ci.map(|ci| ci.upper)
    }

    /// Bootstrap median; `None` with the interval.
    pub fn median(&self) -> Option<f64> {
        self.ci.map(|ci| ci.median)
    }
}

/// `system → task name → report`.
pub type EvaluationReport = BTreeMap<SystemId, BTreeMap<String, TaskReport>>;

struct SampleOutcome {
    value: f64,
    failed: bool,
}

/// Runs candidate programs over benchmark samples and scores their answers.
///
/// A failed run or a scorer error counts as a zero for that sample.
pub struct Harness {
    executor: Arc<dyn CandidateExecutor>,
    gateway: Gateway,
    judge_model: String,
    config: HarnessConfig,
}

impl Harness {
    /// `judge_model` backs the scorers that ask a model to grade answers.
    pub fn new(
        executor: Arc<dyn CandidateExecutor>,
        gateway: Gateway,
        judge_model: impl Into<String>,
        config: HarnessConfig,
    ) -> Self {
        Self {
            executor,
            gateway,
            judge_model: judge_model.into(),
            config,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Score every program on every task. Programs run one after another;
    /// samples of a program run concurrently.
    pub async fn evaluate(&self, programs: &[CandidateProgram], tasks: &[TaskSpec]) -> EvaluationReport {
        let mut report = EvaluationReport::new();
        for program in programs {
            let mut per_task = BTreeMap::new();
            for task in tasks {
                let outcome = self.run_task(program, task.benchmark, &task.samples).await;
                per_task.insert(task.benchmark.name().to_string(), outcome);
            }
            report.insert(program.system_id, per_task);
        }
        report
    }

    /// Score one program on one benchmark's samples.
    pub async fn run_task(
        &self,
        program: &CandidateProgram,
        benchmark: Benchmark,
        samples: &[Sample],
    ) -> TaskReport {
        let scorer = benchmark.scorer(&self.gateway, &self.judge_model);
        let outcomes: Vec<SampleOutcome> = stream::iter(samples)
            .map(|sample| self.run_sample(program, benchmark, scorer.as_ref(), sample))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let failures = outcomes.iter().filter(|o| o.failed).count();
        let scores: Vec<f64> = outcomes.into_iter().map(|o| o.value).collect();
        let accuracy = mean(&scores);
        let sample_size = scores.len();
        // Fewer than two successful samples leave the scores missing.
        let ci = if sample_size - failures < 2 {
            None
        } else {
            bootstrap_ci_blocking(scores, self.config.bootstrap.clone()).await
        };
        debug!(
            system_id = %program.system_id,
            benchmark = %benchmark,
            accuracy,
            failures,
            "task scored"
        );
        TaskReport {
            accuracy,
            ci,
            sample_size,
            failures,
        }
    }

    async fn run_sample(
        &self,
        program: &CandidateProgram,
        benchmark: Benchmark,
        scorer: &dyn Scorer,
        sample: &Sample,
    ) -> SampleOutcome {
        let input = TaskInput::new(benchmark.prompt(sample), benchmark.answer_format());
        let answer = match self
            .executor
            .run(program, &input, self.config.task_timeout)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                debug!(system_id = %program.system_id, sample = %sample.id, error = %e, "candidate failed on sample");
                e.as_answer()
            }
        };
        if is_failed_answer(&answer) {
            return SampleOutcome {
                value: 0.0,
                failed: true,
            };
        }
        match scorer.score(sample, &answer).await {
            Ok(score) => SampleOutcome {
                value: score.value,
                failed: false,
            },
            Err(e) => {
                warn!(
                    system_id = %program.system_id,
                    sample = %sample.id,
                    scorer = scorer.name(),
                    error = %e,
                    "scorer failed, counting sample as zero"
                );
                SampleOutcome {
                    value: 0.0,
                    failed: true,
                }
            }
        }
    }
}
