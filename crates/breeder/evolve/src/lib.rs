//! Breeder discovery loop.
//!
//! One generation:
//! 1. the [`Generator`] proposes drafts from elite parents, refines them with
//!    two reflexion rounds and debugs them against a probe sample
//! 2. the [`Descriptor`] embeds them and the [`Clusterer`] reclusters the whole
//!    population into behavioural niches, recording a new generation
//! 3. the [`Illuminator`] admits or rejects each draft against its niche
//! 4. the [`Evaluator`] scores the admitted drafts with bootstrap intervals
//! 5. the selector picks the next elites, per cluster or on the Pareto front
//!
//! The [`Orchestrator`] drives the loop, resumes interrupted populations and
//! writes the final test-split results.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

pub mod cluster;
pub mod config;
pub mod descriptor;
mod error;
pub mod evaluator;
pub mod generator;
pub mod illuminator;
pub mod orchestrator;
pub mod prompts;
pub mod results;
pub mod seeds;
pub mod selector;

#[cfg(test)]
mod testing;

pub use cluster::{hdbscan, ClusterSnapshot, Clusterer, NOISE};
pub use config::{
    ClusteringConfig, DataConfig, DiscoveryConfig, GatewayConfig, LoggingConfig, ResultsConfig,
    RunConfig, StoreConfig,
};
pub use descriptor::Descriptor;
pub use error::{EvolveError, EvolveResult};
pub use evaluator::{Evaluator, Fitness};
pub use generator::{Generator, GeneratorSettings, Operator};
pub use illuminator::{Illuminator, Verdict};
pub use orchestrator::{Orchestrator, RunSummary, StageCounts};
pub use results::{ResultRecord, ResultsWriter};
pub use seeds::{Seed, SEEDS};
pub use selector::{cluster_elites, dominates, pareto_front, SelectionMode};
