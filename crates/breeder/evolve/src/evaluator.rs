//! Scores systems on their benchmarks and writes the confidence triples back.

use crate::EvolveResult;
use breeder_bench::{Harness, Objective, TaskSpec};
use breeder_runtime::CandidateProgram;
use breeder_store::EntityStore;
use breeder_types::{ConfidenceInterval, System, SystemStatus, SystemUpdate};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};

/// Scores of one system over one set of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fitness {
    pub capability: Option<ConfidenceInterval>,
    pub safety: Option<ConfidenceInterval>,
    pub truth: Option<ConfidenceInterval>,
    /// Samples scored on the capability task.
    pub sample_size: usize,
    pub confidence_level: f64,
    /// Plain accuracy per task name.
    pub accuracy: BTreeMap<String, f64>,
}

/// Scores systems through the harness and stores their fitness.
pub struct Evaluator {
    store: Arc<dyn EntityStore>,
    harness: Arc<Harness>,
    workers: usize,
}

impl Evaluator {
    /// `workers` bounds how many systems are scored at once.
    pub fn new(store: Arc<dyn EntityStore>, harness: Arc<Harness>, workers: usize) -> Self {
        Self {
            store,
            harness,
            workers: workers.max(1),
        }
    }

    /// Run `system` on every task and route each interval to its objective.
    pub async fn score(&self, system: &System, tasks: &[TaskSpec]) -> Fitness {
        let program = CandidateProgram::from(system);
        let mut fitness = Fitness {
            capability: None,
            safety: None,
            truth: None,
            sample_size: 0,
            confidence_level: self.harness.config().bootstrap.confidence,
            accuracy: BTreeMap::new(),
        };
        for task in tasks {
            let report = self
                .harness
                .run_task(&program, task.benchmark, &task.samples)
                .await;
            fitness
                .accuracy
                .insert(task.benchmark.name().to_string(), report.accuracy);
            match task.benchmark.objective() {
                Objective::Capability => {
                    fitness.capability = report.ci;
                    fitness.sample_size = report.sample_size;
                }
                Objective::Safety => fitness.safety = report.ci,
                Objective::Truth => fitness.truth = report.ci,
            }
        }
        fitness
    }

    /// Score `system` and record the result as its fitness.
    ///
    /// Re-validation overwrites earlier intervals. Drafts become `validated`;
    /// seeds keep their status.
    pub async fn validate(&self, system: &System, tasks: &[TaskSpec]) -> EvolveResult<System> {
        let fitness = self.score(system, tasks).await;
        if fitness.capability.is_none() {
            warn!(system_id = %system.id, "fewer than two scored samples, capability is missing");
        }
        let mut update = SystemUpdate::new()
            .fitness(fitness.capability, fitness.safety, fitness.truth)
            .sampling(fitness.sample_size as u32, fitness.confidence_level)
            .property("accuracy", json!(fitness.accuracy));
        if system.status != SystemStatus::Seed {
            update = update.status(SystemStatus::Validated);
        }
        let validated = self.store.update_system(system.id, update).await?;
        info!(
            system_id = %validated.id,
            name = %validated.name,
            capability = %display_ci(validated.capability_ci),
            "system validated"
        );
        Ok(validated)
    }

    /// Validate `systems` with at most `workers` in flight. Failures are
    /// logged and dropped.
    pub async fn validate_all(&self, systems: Vec<System>, tasks: &[TaskSpec]) -> Vec<System> {
        stream::iter(systems)
            .map(|system| {
                let span = info_span!("validate", system_id = %system.id);
                async move {
                    match self.validate(&system, tasks).await {
                        Ok(validated) => Some(validated),
                        Err(e) => {
                            warn!(system_id = %system.id, error = %e, "validation failed");
                            None
                        }
                    }
                }
                .instrument(span)
            })
            .buffer_unordered(self.workers)
            .filter_map(futures::future::ready)
            .collect()
            .await
    }

    /// Score `systems` without touching their fitness; the result is kept
    /// under the `test_fitness` property.
    pub async fn score_all(
        &self,
        systems: Vec<System>,
        tasks: &[TaskSpec],
    ) -> Vec<(System, Fitness)> {
        stream::iter(systems)
            .map(|system| {
                let span = info_span!("validate", system_id = %system.id, split = "test");
                async move {
                    let fitness = self.score(&system, tasks).await;
                    let update = SystemUpdate::new().property("test_fitness", json!(fitness));
                    let system = match self.store.update_system(system.id, update).await {
                        Ok(updated) => updated,
                        Err(e) => {
                            warn!(system_id = %system.id, error = %e, "could not record test scores");
                            system
                        }
                    };
                    (system, fitness)
                }
                .instrument(span)
            })
            .buffer_unordered(self.workers)
            .collect()
            .await
    }
}

pub(crate) fn display_ci(ci: Option<ConfidenceInterval>) -> String {
    ci.map(|ci| ci.to_string())
        .unwrap_or_else(|| "missing".to_string())
}
