//! Benchmark samples and where they come from.
//!
//! A dataset exposes two splits. `validation` is small and used while
//! generating and illuminating candidates; `test` is used for final scoring.
//! Files without split labels are partitioned 50/50 by a fixed-seed shuffle so
//! the partition is identical across runs.

use crate::{BenchError, BenchResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Seed of the deterministic 50/50 partition.
const PARTITION_SEED: u64 = 0x5EED;

/// Which half of a dataset a run draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Validation,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }

    fn parse_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "validation" | "valid" | "val" | "dev" => Some(Split::Validation),
            "test" => Some(Split::Test),
            _ => None,
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scored task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    /// Task text handed to the candidate.
    pub input: String,
    pub target: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Sample {
    pub fn new(id: impl Into<String>, input: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            target: target.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// How a split is drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    pub split: Split,
    pub shuffle: bool,
    pub seed: u64,
    pub limit: Option<usize>,
}

impl LoadOptions {
    /// Unshuffled and unlimited.
    pub fn new(split: Split) -> Self {
        Self {
            split,
            shuffle: false,
            seed: 0,
            limit: None,
        }
    }

    /// Shuffle with a seeded RNG before the limit applies.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Source of samples for one benchmark.
pub trait Dataset: Send + Sync {
    fn name(&self) -> &str;

    /// Every sample of `split`, in source order.
    fn records(&self, split: Split) -> BenchResult<Vec<Sample>>;
}

/// Draw samples: seeded shuffle, then `filter`, then `limit`.
pub fn load<F>(dataset: &dyn Dataset, options: &LoadOptions, filter: F) -> BenchResult<Vec<Sample>>
where
    F: Fn(&Sample) -> bool,
{
    let mut samples = dataset.records(options.split)?;
    if options.shuffle {
        samples.shuffle(&mut StdRng::seed_from_u64(options.seed));
    }
    let before = samples.len();
    samples.retain(|s| filter(s));
    if let Some(limit) = options.limit {
        samples.truncate(limit);
    }
    debug!(
        dataset = dataset.name(),
        split = %options.split,
        available = before,
        loaded = samples.len(),
        "loaded samples"
    );
    Ok(samples)
}

/// Split an unlabeled record list 50/50. The first half is validation.
pub fn partition<T>(mut records: Vec<T>) -> (Vec<T>, Vec<T>) {
    records.shuffle(&mut StdRng::seed_from_u64(PARTITION_SEED));
    let test = records.split_off(records.len() / 2);
    (records, test)
}

/// In-memory dataset for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticDataset {
    name: String,
    validation: Vec<Sample>,
    test: Vec<Sample>,
}

impl StaticDataset {
    /// Both splits serve the same samples.
    pub fn new(name: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            name: name.into(),
            validation: samples.clone(),
            test: samples,
        }
    }

    /// Separate validation and test samples.
    pub fn with_splits(name: impl Into<String>, validation: Vec<Sample>, test: Vec<Sample>) -> Self {
        Self {
            name: name.into(),
            validation,
            test,
        }
    }
}

impl Dataset for StaticDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn records(&self, split: Split) -> BenchResult<Vec<Sample>> {
        Ok(match split {
            Split::Validation => self.validation.clone(),
            Split::Test => self.test.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct JsonlRecord {
    #[serde(default)]
    id: Option<Value>,
    input: String,
    target: Value,
    #[serde(default)]
    split: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

/// Reads `<data_dir>/<benchmark>.jsonl`.
///
/// Each line is `{id?, input, target, split?, metadata?}`. A non-string
/// target is kept as its JSON text.
#[derive(Debug, Clone)]
pub struct JsonlDataset {
    name: String,
    path: PathBuf,
}

impl JsonlDataset {
    /// The file is only opened when records are read.
    pub fn new(data_dir: &Path, benchmark: &str) -> Self {
        Self {
            name: benchmark.to_string(),
            path: data_dir.join(format!("{benchmark}.jsonl")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> BenchResult<Vec<(Option<Split>, Sample)>> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| BenchError::Dataset(format!("{}: {e}", self.path.display())))?;
        let mut records = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: JsonlRecord = serde_json::from_str(line).map_err(|e| {
                BenchError::Dataset(format!("{}:{}: {e}", self.path.display(), line_no + 1))
            })?;
            let split = match record.split.as_deref() {
                Some(label) => Some(Split::parse_label(label).ok_or_else(|| {
                    BenchError::Dataset(format!(
                        "{}:{}: unknown split {label:?}",
                        self.path.display(),
                        line_no + 1
                    ))
                })?),
                None => None,
            };
            let id = match record.id {
                Some(Value::String(id)) => id,
                Some(other) => other.to_string(),
                None => format!("{}-{}", self.name, line_no),
            };
            let target = match record.target {
                Value::String(target) => target,
                other => other.to_string(),
            };
            records.push((
                split,
                Sample {
                    id,
                    input: record.input,
                    target,
                    metadata: record.metadata,
                },
            ));
        }
        Ok(records)
    }
}

impl Dataset for JsonlDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn records(&self, split: Split) -> BenchResult<Vec<Sample>> {
        let records = self.read()?;
        if records.iter().any(|(label, _)| label.is_some()) {
            return Ok(records
                .into_iter()
                .filter(|(label, _)| *label == Some(split))
                .map(|(_, sample)| sample)
                .collect());
        }
        let (validation, test) = partition(records.into_iter().map(|(_, s)| s).collect());
        Ok(match split {
            Split::Validation => validation,
            Split::Test => test,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Write;

    fn samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample::new(i.to_string(), format!("q{i}"), "A"))
            .collect()
    }

    #[test]
    fn partition_is_deterministic_and_disjoint() {
        let (v1, t1) = partition(samples(11));
        let (v2, t2) = partition(samples(11));
        assert_eq!(v1, v2);
        assert_eq!(t1, t2);
        assert_eq!(v1.len(), 5);
        assert_eq!(t1.len(), 6);
        let ids: HashSet<_> = v1.iter().chain(t1.iter()).map(|s| s.id.clone()).collect();
        assert_eq!(ids.len(), 11);
    }

    #[test]
    fn load_filters_before_limiting() {
        let dataset = StaticDataset::new("toy", samples(10));
        let options = LoadOptions::new(Split::Validation).limit(3);
        let loaded = load(&dataset, &options, |s| s.id.parse::<u32>().unwrap() % 2 == 0).unwrap();
        let ids: Vec<_> = loaded.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "2", "4"]);
    }

    #[test]
    fn shuffle_is_seeded() {
        let dataset = StaticDataset::new("toy", samples(20));
        let a = load(&dataset, &LoadOptions::new(Split::Test).shuffled(7), |_| true).unwrap();
        let b = load(&dataset, &LoadOptions::new(Split::Test).shuffled(7), |_| true).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, samples(20));
    }

    #[test]
    fn jsonl_honours_split_labels() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("mmlu.jsonl")).unwrap();
        writeln!(file, r#"{{"id": "a", "input": "q1", "target": "A", "split": "validation"}}"#).unwrap();
        writeln!(file, r#"{{"id": 2, "input": "q2", "target": "B", "split": "test"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"input": "q3", "target": [[1, 2]], "split": "test"}}"#).unwrap();

        let dataset = JsonlDataset::new(dir.path(), "mmlu");
        let validation = dataset.records(Split::Validation).unwrap();
        assert_eq!(validation.len(), 1);
        assert_eq!(validation[0].id, "a");
        let test = dataset.records(Split::Test).unwrap();
        assert_eq!(test[0].id, "2");
        assert_eq!(test[1].id, "mmlu-3");
        assert_eq!(test[1].target, "[[1,2]]");
    }

    #[test]
    fn jsonl_without_labels_is_partitioned() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("math.jsonl")).unwrap();
        for i in 0..8 {
            writeln!(file, r#"{{"id": "{i}", "input": "q", "target": "1"}}"#).unwrap();
        }
        let dataset = JsonlDataset::new(dir.path(), "math");
        assert_eq!(dataset.records(Split::Validation).unwrap().len(), 4);
        assert_eq!(dataset.records(Split::Test).unwrap().len(), 4);
    }

    #[test]
    fn missing_file_is_a_dataset_error() {
        let dataset = JsonlDataset::new(Path::new("/nonexistent"), "gpqa");
        assert!(matches!(
            dataset.records(Split::Test),
            Err(BenchError::Dataset(_))
        ));
    }
}
