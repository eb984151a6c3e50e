//! Breeder - quality-diversity discovery of multi-agent LLM programs
//!
//! A single command that bootstraps a population from the seed archive, or
//! resumes one by id, and runs the configured number of generations.
//! Settings come from defaults, then `--config`, then `BREEDER_*` environment
//! variables, then the flags below.

use anyhow::{bail, Context};
use breeder_bench::{Benchmark, JsonlDataset};
use breeder_evolve::{DiscoveryConfig, Orchestrator, RunSummary};
use breeder_gateway::{EmbeddingTransport, Gateway, HashEmbeddingTransport, OpenAiTransport};
use breeder_runtime::PythonExecutor;
use breeder_store::{EntityStore, InMemoryStore, InteractionStore, SqliteStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "breeder")]
#[command(about = "Evolve multi-agent LLM programs against a benchmark", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "BREEDER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_parser = parse_benchmark)]
    benchmark: Option<Benchmark>,

    /// Resume this population
    #[arg(long = "population_id")]
    population_id: Option<String>,

    #[arg(long = "n_generation")]
    n_generation: Option<u32>,

    /// Generation steps per generation
    #[arg(long = "n_mutations")]
    n_mutations: Option<usize>,

    /// Samples per task when scoring a system
    #[arg(long = "n_evals")]
    n_evals: Option<usize>,

    /// Revisions allowed when the debug probe fails
    #[arg(long = "debug_max")]
    debug_max: Option<u32>,

    #[arg(long)]
    model: Option<String>,

    /// Also score safety and truthfulness
    #[arg(long)]
    safety: bool,

    /// Select parents from the capability/safety Pareto front
    #[arg(long)]
    pareto: bool,

    #[arg(long = "random_seed")]
    random_seed: Option<u64>,

    /// Per-sample deadline in seconds
    #[arg(long = "task_timeout")]
    task_timeout: Option<u64>,

    /// Systems generated or validated concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Directory holding `<benchmark>.jsonl` files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// SQLite database; in-memory when omitted
    #[arg(long)]
    db: Option<PathBuf>,

    /// Embed descriptors locally instead of through the provider
    #[arg(long)]
    offline_embeddings: bool,

    /// Log level
    #[arg(long, env = "BREEDER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "BREEDER_LOG_JSON")]
    log_json: bool,
}

fn parse_benchmark(value: &str) -> Result<Benchmark, String> {
    value.parse::<Benchmark>().map_err(|e| {
        let names: Vec<&str> = Benchmark::ALL.iter().map(|b| b.name()).collect();
        format!("{e} (expected one of {})", names.join(", "))
    })
}

impl Cli {
    /// Flags win over file and environment settings.
    fn apply(&self, config: &mut DiscoveryConfig) {
        let run = &mut config.run;
        if let Some(benchmark) = self.benchmark {
            run.benchmark = benchmark.name().to_string();
        }
        if let Some(id) = &self.population_id {
            run.population_id = Some(id.clone());
        }
        if let Some(n) = self.n_generation {
            run.n_generation = n;
        }
        if let Some(n) = self.n_mutations {
            run.n_mutations = n;
        }
        if let Some(n) = self.n_evals {
            run.n_evals = n;
        }
        if let Some(n) = self.debug_max {
            run.debug_max = n;
        }
        if let Some(model) = &self.model {
            run.model = model.clone();
        }
        run.safety |= self.safety;
        run.pareto |= self.pareto;
        if let Some(seed) = self.random_seed {
            run.random_seed = seed;
        }
        if let Some(secs) = self.task_timeout {
            run.task_timeout_secs = secs;
        }
        if let Some(workers) = self.workers {
            run.workers = workers;
        }
        if let Some(dir) = &self.data_dir {
            config.data.data_dir = dir.clone();
        }
        if let Some(dir) = &self.results_dir {
            config.results.dir = dir.clone();
        }
        if let Some(db) = &self.db {
            config.store.db = Some(db.clone());
        }
        config.gateway.offline_embeddings |= self.offline_embeddings;
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        config.logging.json |= self.log_json;
    }
}

fn init_tracing(config: &DiscoveryConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    // Progress goes to stdout, logs to stderr.
    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn launch<S>(store: Arc<S>, config: DiscoveryConfig) -> anyhow::Result<RunSummary>
where
    S: EntityStore + 'static,
{
    let entities: Arc<dyn EntityStore> = store.clone();
    let interactions: Arc<dyn InteractionStore> = store;

    let provider = Arc::new(
        OpenAiTransport::from_env(config.gateway.openai.clone())
            .context("failed to configure the model provider")?,
    );
    let embedder: Arc<dyn EmbeddingTransport> = if config.gateway.offline_embeddings {
        Arc::new(HashEmbeddingTransport::new())
    } else {
        provider.clone()
    };
    let gateway = Gateway::new(provider, embedder, config.gateway.retry.clone());

    let interpreter = config.run.interpreter.clone();
    if !PythonExecutor::interpreter_available(&interpreter).await {
        bail!("python interpreter {} is not available", interpreter.display());
    }
    let executor = Arc::new(PythonExecutor::new(
        interpreter,
        interactions,
        gateway.clone(),
        config.run.model.clone(),
    ));

    let data_dir = config.data.data_dir.clone();
    let orchestrator = Benchmark::ALL.iter().fold(
        Orchestrator::new(entities, gateway, executor, config),
        |orchestrator, benchmark| {
            orchestrator.with_dataset(
                *benchmark,
                Arc::new(JsonlDataset::new(&data_dir, benchmark.name())),
            )
        },
    );
    Ok(orchestrator.run().await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DiscoveryConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    init_tracing(&config);

    info!(
        benchmark = %config.run.benchmark,
        generations = config.run.n_generation,
        mutations = config.run.n_mutations,
        "starting breeder"
    );

    let summary = match config.store.db.clone() {
        Some(path) => {
            let store = SqliteStore::connect(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            launch(Arc::new(store), config).await?
        }
        None => launch(Arc::new(InMemoryStore::new()), config).await?,
    };

    println!(
        "population {} finished after {} generations; results in {}",
        summary.population_id,
        summary.generations,
        summary.results_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_flags_override_the_config() {
        let cli = Cli::try_parse_from([
            "breeder",
            "--benchmark",
            "clrs_text",
            "--population_id",
            "abc",
            "--n_generation",
            "3",
            "--n_mutations",
            "4",
            "--n_evals",
            "20",
            "--debug_max",
            "1",
            "--safety",
            "--task_timeout",
            "30",
        ])
        .unwrap();
        let mut config = DiscoveryConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.run.benchmark, "clrs_text");
        assert_eq!(config.run.population_id.as_deref(), Some("abc"));
        assert_eq!(config.run.n_generation, 3);
        assert_eq!(config.run.n_mutations, 4);
        assert_eq!(config.run.n_evals, 20);
        assert_eq!(config.run.debug_max, 1);
        assert!(config.run.safety);
        assert!(!config.run.pareto);
        assert_eq!(config.run.task_timeout_secs, 30);
    }

    #[test]
    fn absent_flags_keep_the_config() {
        let cli = Cli::try_parse_from(["breeder"]).unwrap();
        let mut config = DiscoveryConfig::default();
        config.run.safety = true;
        cli.apply(&mut config);
        assert_eq!(config, {
            let mut expected = DiscoveryConfig::default();
            expected.run.safety = true;
            expected
        });
    }

    #[test]
    fn unknown_benchmark_is_rejected() {
        assert!(Cli::try_parse_from(["breeder", "--benchmark", "chess"]).is_err());
    }
}
