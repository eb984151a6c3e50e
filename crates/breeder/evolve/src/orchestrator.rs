//! The generational loop.
//!
//! A run bootstraps a population from the seed archive (or resumes an existing
//! one), then repeats generate, embed, cluster, illuminate and validate for the
//! configured number of generations. The clustering pass that follows
//! bootstrap is generation 1. Finally the best systems are re-scored on the
//! test split and written to the results directory.

use crate::cluster::{ClusterSnapshot, Clusterer};
use crate::config::DiscoveryConfig;
use crate::descriptor::Descriptor;
use crate::evaluator::{display_ci, Evaluator, Fitness};
use crate::generator::{Generator, GeneratorSettings};
use crate::illuminator::Illuminator;
use crate::results::{ResultRecord, ResultsWriter};
use crate::seeds::SEEDS;
use crate::selector::{select, SelectionMode};
use crate::{EvolveError, EvolveResult};
use breeder_bench::{Benchmark, Dataset, Harness, LoadOptions, Split, TaskSpec};
use breeder_gateway::Gateway;
use breeder_runtime::CandidateExecutor;
use breeder_store::{retry_on_conflict, EntityStore};
use breeder_types::{capability_order, Population, PopulationId, System, SystemStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub population_id: PopulationId,
    pub benchmark: Benchmark,
    /// Generations recorded for the population, bootstrap included.
    pub generations: u32,
    /// Final test-split scores, best first.
    pub finalists: Vec<(System, Fitness)>,
    pub results_dir: PathBuf,
}

/// Counts of one pass through the pipeline stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub embedded: usize,
    pub illuminated: usize,
    pub admitted: usize,
    pub validated: usize,
}

/// Drives a discovery run over one population.
pub struct Orchestrator {
    store: Arc<dyn EntityStore>,
    gateway: Gateway,
    executor: Arc<dyn CandidateExecutor>,
    datasets: HashMap<Benchmark, Arc<dyn Dataset>>,
    config: DiscoveryConfig,
}

impl Orchestrator {
    /// An orchestrator with no datasets. Register one per benchmark the run
    /// needs with [`Orchestrator::with_dataset`].
    pub fn new(
        store: Arc<dyn EntityStore>,
        gateway: Gateway,
        executor: Arc<dyn CandidateExecutor>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            executor,
            datasets: HashMap::new(),
            config,
        }
    }

    /// Serve `benchmark` samples from `dataset`.
    pub fn with_dataset(mut self, benchmark: Benchmark, dataset: Arc<dyn Dataset>) -> Self {
        self.datasets.insert(benchmark, dataset);
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Create the population and its seeds, or load the one being resumed.
    pub async fn bootstrap(&self) -> EvolveResult<(Population, Benchmark)> {
        let run = &self.config.run;
        if let Some(id) = run.population_id()? {
            let population = self
                .store
                .get_population(id)
                .await?
                .ok_or_else(|| EvolveError::Config(format!("unknown population {id}")))?;
            let benchmark: Benchmark = population.benchmark.parse()?;
            info!(population_id = %id, benchmark = benchmark.name(), "resuming population");
            return Ok((population, benchmark));
        }

        let benchmark = run.benchmark()?;
        let population = self
            .store
            .create_population(benchmark.name(), run.safety)
            .await?;
        for seed in &SEEDS {
            let new = seed.to_new_system(population.id);
            retry_on_conflict("append seed", || self.store.append_system(new.clone())).await?;
        }
        info!(
            population_id = %population.id,
            benchmark = benchmark.name(),
            seeds = SEEDS.len(),
            "population created"
        );
        Ok((population, benchmark))
    }

    /// Capability task, plus safety and truth tasks when enabled, drawn from
    /// `split`.
    pub fn tasks(&self, benchmark: Benchmark, safety: bool, split: Split) -> EvolveResult<Vec<TaskSpec>> {
        let run = &self.config.run;
        let options = LoadOptions::new(split)
            .shuffled(run.random_seed)
            .limit(run.n_evals);
        let mut benchmarks = vec![benchmark];
        if safety {
            benchmarks.extend([Benchmark::SaladData, Benchmark::TruthfulQa]);
        }
        let mut tasks = Vec::with_capacity(benchmarks.len());
        for benchmark in benchmarks {
            let dataset = self.datasets.get(&benchmark).ok_or_else(|| {
                EvolveError::Config(format!("no dataset for {}", benchmark.name()))
            })?;
            let samples = benchmark.load(dataset.as_ref(), &options, &self.config.data.filter)?;
            if samples.is_empty() {
                return Err(EvolveError::Config(format!(
                    "{} has no {} samples",
                    benchmark.name(),
                    split.as_str()
                )));
            }
            tasks.push(TaskSpec::new(benchmark, samples));
        }
        Ok(tasks)
    }

    /// Run the configured generations and the final validation.
    pub async fn run(&self) -> EvolveResult<RunSummary> {
        let started_at = Utc::now();
        let run = &self.config.run;
        let (population, benchmark) = self.bootstrap().await?;
        let safety = population.safety;
        let tasks = self.tasks(benchmark, safety, Split::Validation)?;
        let probe = tasks
            .first()
            .and_then(|task| task.samples.first())
            .cloned()
            .ok_or_else(|| EvolveError::Config("no probe sample".into()))?;

        let harness = Arc::new(Harness::new(
            self.executor.clone(),
            self.gateway.clone(),
            run.model.clone(),
            run.harness(),
        ));
        let stages = Stages {
            store: self.store.as_ref(),
            descriptor: Descriptor::new(
                self.gateway.clone(),
                self.config.gateway.embedding_dimensions,
                self.config.gateway.embedding_concurrency,
            ),
            clusterer: Clusterer::new(self.config.clustering.clone()),
            illuminator: Illuminator::new(self.gateway.clone(), run.model.clone(), benchmark),
            evaluator: Evaluator::new(self.store.clone(), harness, run.workers),
            workers: run.workers,
        };
        let mut settings = GeneratorSettings::from(run);
        settings.safety = safety;
        let generator = Generator::new(
            self.store.clone(),
            self.gateway.clone(),
            self.executor.clone(),
            benchmark,
            probe,
            settings,
            run.random_seed,
        );
        let mode = SelectionMode::from_flag(run.pareto);

        // Carry systems an interrupted run left mid-pipeline.
        let pending = has_pending(&self.store.list_systems(population.id).await?);
        let mut snapshot = match self.store.latest_generation(population.id).await? {
            Some(generation) if !pending => {
                ClusterSnapshot::load(self.store.as_ref(), generation).await?
            }
            _ => {
                let (snapshot, counts) = stages.advance(population.id, &tasks).await?;
                info!(?counts, generation = snapshot.generation.number, "pending systems settled");
                snapshot
            }
        };

        let done = snapshot.generation.number.saturating_sub(1);
        let remaining = run.n_generation.saturating_sub(done);
        for step in 1..=remaining {
            let number = done + step;
            let span = info_span!("generation", number);
            snapshot = async {
                let systems = self.store.list_systems(population.id).await?;
                let elites = select(mode, &systems, &snapshot, run.elite_top_k);
                let archive: Vec<System> =
                    systems.into_iter().filter(|s| s.is_selectable()).collect();
                let drafts = generator
                    .generate_many(population.id, &elites, &archive, run.n_mutations, run.workers)
                    .await;
                let (next, counts) = stages.advance(population.id, &tasks).await?;
                let best = self
                    .store
                    .list_systems(population.id)
                    .await?
                    .into_iter()
                    .filter(|s| s.is_selectable())
                    .min_by(capability_order);
                println!(
                    "generation {number}/{}: {} drafts, {} admitted, {} validated, {} clusters, best {}",
                    run.n_generation,
                    drafts.len(),
                    counts.admitted,
                    counts.validated,
                    next.clusters.len(),
                    best.map(|s| format!("{} {}", s.name, display_ci(s.capability_ci)))
                        .unwrap_or_else(|| "none".to_string()),
                );
                Ok::<_, EvolveError>(next)
            }
            .instrument(span)
            .await
            .map_err(|e| {
                error!(generation = number, error = %e, "generation aborted, rerun with --population_id to resume");
                e
            })?;
        }

        let writer = ResultsWriter::new(&self.config.results.dir, started_at);
        let finalists = self
            .finalize(&stages.evaluator, &population, benchmark, &snapshot, &writer)
            .await?;
        Ok(RunSummary {
            population_id: population.id,
            benchmark,
            generations: snapshot.generation.number,
            finalists,
            results_dir: writer.dir().to_path_buf(),
        })
    }

    /// Re-score the final elites on the test split and write their records.
    async fn finalize(
        &self,
        evaluator: &Evaluator,
        population: &Population,
        benchmark: Benchmark,
        snapshot: &ClusterSnapshot,
        writer: &ResultsWriter,
    ) -> EvolveResult<Vec<(System, Fitness)>> {
        let safety = population.safety;
        let mode = SelectionMode::from_flag(self.config.run.pareto);
        let systems = self.store.list_systems(population.id).await?;
        let mut top = select(mode, &systems, snapshot, self.config.run.elite_top_k);
        top.truncate(self.config.results.final_top);
        let tasks = self.tasks(benchmark, safety, Split::Test)?;
        let mut scored = evaluator.score_all(top, &tasks).await;
        scored.sort_by(|a, b| capability_order(&a.0, &b.0));

        for (system, fitness) in &scored {
            if let Err(e) = writer.append(&ResultRecord::new(system, fitness)).await {
                warn!(system_id = %system.id, error = %e, "could not write result");
            }
            let mut line = format!("{}: capability {}", system.name, display_ci(fitness.capability));
            if safety {
                line.push_str(&format!(
                    ", safety {}, truth {}",
                    display_ci(fitness.safety),
                    display_ci(fitness.truth)
                ));
            }
            println!("{line}");
        }
        info!(finalists = scored.len(), dir = %writer.dir().display(), "run finished");
        Ok(scored)
    }
}

fn has_pending(systems: &[System]) -> bool {
    systems
        .iter()
        .any(|s| s.status.is_pending() || needs_validation(s) || needs_embedding(s))
}

fn needs_embedding(system: &System) -> bool {
    system.status == SystemStatus::Draft
        || (system.status == SystemStatus::Seed && system.descriptor.is_none())
}

fn needs_validation(system: &System) -> bool {
    system.status == SystemStatus::Admitted
        || (system.status == SystemStatus::Seed && system.sample_size.is_none())
}

/// The per-generation pipeline after generation.
struct Stages<'a> {
    store: &'a dyn EntityStore,
    descriptor: Descriptor,
    clusterer: Clusterer,
    illuminator: Illuminator,
    evaluator: Evaluator,
    workers: usize,
}

impl Stages<'_> {
    /// Move every pending system of the population through embed, cluster,
    /// illuminate and validate, recording a new generation.
    async fn advance(
        &self,
        population_id: PopulationId,
        tasks: &[TaskSpec],
    ) -> EvolveResult<(ClusterSnapshot, StageCounts)> {
        let mut counts = StageCounts::default();

        let to_embed: Vec<System> = self
            .store
            .list_systems(population_id)
            .await?
            .into_iter()
            .filter(needs_embedding)
            .collect();
        counts.embedded = self.descriptor.batch(self.store, to_embed).await.len();

        let snapshot = self.clusterer.cluster(self.store, population_id).await?;

        let to_illuminate: Vec<System> = self
            .store
            .list_systems(population_id)
            .await?
            .into_iter()
            .filter(|s| s.status == SystemStatus::Clustered)
            .collect();
        counts.illuminated = to_illuminate.len();
        counts.admitted = self
            .illuminator
            .filter(self.store, to_illuminate, self.workers)
            .await
            .len();

        let to_validate: Vec<System> = self
            .store
            .list_systems(population_id)
            .await?
            .into_iter()
            .filter(needs_validation)
            .collect();
        counts.validated = self.evaluator.validate_all(to_validate, tasks).await.len();
        Ok((snapshot, counts))
    }
}
