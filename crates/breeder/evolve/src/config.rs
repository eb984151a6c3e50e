//! Run configuration.
//!
//! Layered as built-in defaults, then an optional TOML/JSON file, then
//! `BREEDER_`-prefixed environment variables with `__` between sections
//! (`BREEDER_RUN__N_MUTATIONS=4`). Command-line flags are applied last by
//! the binary.

use crate::EvolveResult;
use breeder_bench::{Benchmark, BootstrapConfig, FilterBounds, HarnessConfig};
use breeder_gateway::{OpenAiConfig, RetryPolicy};
use breeder_types::PopulationId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings of a discovery run, grouped by concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The generational loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub benchmark: String,
    /// Resume this population instead of bootstrapping a new one.
    pub population_id: Option<String>,
    pub n_generation: u32,
    pub n_mutations: usize,
    /// Samples per task when scoring a system.
    pub n_evals: usize,
    /// Revisions allowed when the debug probe fails.
    pub debug_max: u32,
    pub reflexion_rounds: u32,
    pub model: String,
    pub temperature: f64,
    /// Also score safety and truthfulness.
    pub safety: bool,
    /// Select parents from the capability/safety Pareto front.
    pub pareto: bool,
    /// Per-cluster elites offered as parents.
    pub elite_top_k: usize,
    pub random_seed: u64,
    pub task_timeout_secs: u64,
    /// Systems generated or validated concurrently.
    pub workers: usize,
    /// Samples of one system scored concurrently.
    pub sample_concurrency: usize,
    pub bootstrap_resamples: usize,
    pub confidence_level: f64,
    /// Python interpreter that runs candidates.
    pub interpreter: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            benchmark: "mmlu".to_string(),
            population_id: None,
            n_generation: 10,
            n_mutations: 10,
            n_evals: 100,
            debug_max: 3,
            reflexion_rounds: 2,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.8,
            safety: false,
            pareto: false,
            elite_top_k: 1,
            random_seed: 42,
            task_timeout_secs: 180,
            workers: 8,
            sample_concurrency: 16,
            bootstrap_resamples: 100_000,
            confidence_level: 0.95,
            interpreter: PathBuf::from("python3"),
        }
    }
}

impl RunConfig {
    pub fn benchmark(&self) -> EvolveResult<Benchmark> {
        Ok(self.benchmark.parse()?)
    }

    /// Population to resume, if one was named.
    pub fn population_id(&self) -> EvolveResult<Option<PopulationId>> {
        self.population_id
            .as_deref()
            .map(|raw| {
                raw.parse::<PopulationId>()
                    .map_err(|e| crate::EvolveError::Config(format!("population id {raw:?}: {e}")))
            })
            .transpose()
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Harness settings derived from the run. The bootstrap reuses the run seed.
    pub fn harness(&self) -> HarnessConfig {
        HarnessConfig {
            concurrency: self.sample_concurrency.max(1),
            task_timeout: self.task_timeout(),
            bootstrap: BootstrapConfig {
                resamples: self.bootstrap_resamples,
                confidence: self.confidence_level,
                seed: Some(self.random_seed),
                ..BootstrapConfig::default()
            },
        }
    }
}

/// Model provider and embedding settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub retry: RetryPolicy,
    pub openai: OpenAiConfig,
    /// Length of behavioural descriptors.
    pub embedding_dimensions: usize,
    /// Embed with the local feature-hashing transport instead of the provider.
    pub offline_embeddings: bool,
    /// Concurrent embedding calls.
    pub embedding_concurrency: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            openai: OpenAiConfig::default(),
            embedding_dimensions: 16,
            offline_embeddings: false,
            embedding_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file. In-memory when absent.
    pub db: Option<PathBuf>,
}

/// HDBSCAN parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub min_cluster_size: usize,
    pub min_samples: usize,
    /// Below this many descriptors every system gets its own cluster.
    pub min_population: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 3,
            min_samples: 2,
            min_population: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding `<benchmark>.jsonl` files.
    pub data_dir: PathBuf,
    pub filter: FilterBounds,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            filter: FilterBounds::default(),
        }
    }
}

/// Where final results are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    pub dir: PathBuf,
    /// Systems re-scored on the test split after the last generation.
    pub final_top: usize,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("results"),
            final_top: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl DiscoveryConfig {
    /// Load defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> EvolveResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&DiscoveryConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("BREEDER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        Ok(builder.build()?.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_documented_run() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.run.debug_max, 3);
        assert_eq!(config.run.reflexion_rounds, 2);
        assert_eq!(config.run.task_timeout(), Duration::from_secs(180));
        assert_eq!(config.run.bootstrap_resamples, 100_000);
        assert_eq!(config.run.benchmark().unwrap(), Benchmark::Mmlu);
        assert!(config.store.db.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breeder.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[run]\nbenchmark = \"math\"\nn_mutations = 3\n\n[clustering]\nmin_cluster_size = 4").unwrap();

        let config = DiscoveryConfig::load(Some(&path)).unwrap();
        assert_eq!(config.run.benchmark().unwrap(), Benchmark::Math);
        assert_eq!(config.run.n_mutations, 3);
        assert_eq!(config.run.n_generation, 10);
        assert_eq!(config.clustering.min_cluster_size, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn bad_population_id_is_a_config_error() {
        let run = RunConfig {
            population_id: Some("nope".into()),
            ..RunConfig::default()
        };
        assert!(matches!(run.population_id(), Err(crate::EvolveError::Config(_))));
    }
}
