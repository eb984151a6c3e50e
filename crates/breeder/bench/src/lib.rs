//! Breeder benchmark harness.
//!
//! Per benchmark the harness combines:
//! - a [`Dataset`] with `validation` and `test` splits and a `sample_filter`
//! - a [`Scorer`] mapping `(sample, output)` to a value in `[0, 1]`
//! - bootstrap aggregation of per-sample scores into a confidence triple
//!
//! [`Harness::evaluate`] runs candidate programs through a
//! [`breeder_runtime::CandidateExecutor`] and reports
//! `system → task → {accuracy, ci_lower, ci_upper, median}`.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

pub mod dataset;
mod error;
mod harness;
mod registry;
pub mod scorer;
pub mod stats;

pub use dataset::{Dataset, JsonlDataset, LoadOptions, Sample, Split, StaticDataset};
pub use error::{BenchError, BenchResult};
pub use harness::{EvaluationReport, Harness, HarnessConfig, TaskReport, TaskSpec};
pub use registry::{Benchmark, FilterBounds, Objective};
pub use scorer::{match_latex, percentage_match, trace_score, Score, Scorer};
pub use stats::{bootstrap_ci, BootstrapConfig};
