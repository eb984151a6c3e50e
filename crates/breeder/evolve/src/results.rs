//! Newline-delimited JSON result records, one file per system name.

use crate::evaluator::Fitness;
use crate::generator::sanitize_name;
use crate::EvolveResult;
use breeder_types::{ConfidenceInterval, System, SystemId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One line of a results file. Safety and truth columns appear only when scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub system_id: SystemId,
    pub system_name: String,
    pub system_code: String,
    pub system_capability_ci_lower: Option<f64>,
    pub system_capability_ci_median: Option<f64>,
    pub system_capability_ci_upper: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_safety_ci_lower: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_safety_ci_median: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_safety_ci_upper: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_truth_ci_lower: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_truth_ci_median: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_truth_ci_upper: Option<f64>,
}

fn bounds(ci: Option<ConfidenceInterval>) -> (Option<f64>, Option<f64>, Option<f64>) {
    match ci {
        Some(ci) => (Some(ci.lower), Some(ci.median), Some(ci.upper)),
        None => (None, None, None),
    }
}

impl ResultRecord {
    pub fn new(system: &System, fitness: &Fitness) -> Self {
        let (cap_lower, cap_median, cap_upper) = bounds(fitness.capability);
        let (safety_lower, safety_median, safety_upper) = bounds(fitness.safety);
        let (truth_lower, truth_median, truth_upper) = bounds(fitness.truth);
        Self {
            system_id: system.id,
            system_name: system.name.clone(),
            system_code: system.code.clone(),
            system_capability_ci_lower: cap_lower,
            system_capability_ci_median: cap_median,
            system_capability_ci_upper: cap_upper,
            system_safety_ci_lower: safety_lower,
            system_safety_ci_median: safety_median,
            system_safety_ci_upper: safety_upper,
            system_truth_ci_lower: truth_lower,
            system_truth_ci_median: truth_median,
            system_truth_ci_upper: truth_upper,
        }
    }
}

/// Writes under `<root>/<run_timestamp>/`.
#[derive(Debug, Clone)]
pub struct ResultsWriter {
    dir: PathBuf,
}

impl ResultsWriter {
    /// Nothing is created until the first record is appended.
    pub fn new(root: &Path, started_at: DateTime<Utc>) -> Self {
        Self {
            dir: root.join(started_at.format("%Y%m%dT%H%M%SZ").to_string()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the records of `system_name`.
    pub fn path_for(&self, system_name: &str) -> PathBuf {
        let stem = sanitize_name(system_name).replace(' ', "_");
        self.dir.join(format!("{stem}.jsonl"))
    }

    /// Append one record to the file of `record.system_name`.
    pub async fn append(&self, record: &ResultRecord) -> EvolveResult<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&record.system_name);
        let mut line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(path = %path.display(), "result appended");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::scored;
    use std::collections::BTreeMap;

    fn fitness(capability: f64, safety: Option<f64>) -> Fitness {
        Fitness {
            capability: ConfidenceInterval::new(capability - 0.1, capability, capability + 0.1),
            safety: safety.map(ConfidenceInterval::point),
            truth: None,
            sample_size: 10,
            confidence_level: 0.95,
            accuracy: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn records_append_per_system_name() {
        let root = tempfile::tempdir().unwrap();
        let writer = ResultsWriter::new(root.path(), Utc::now());
        let mut system = scored(Some(0.5), None);
        system.name = "LLM Debate".into();

        let path = writer.append(&ResultRecord::new(&system, &fitness(0.5, None))).await.unwrap();
        writer.append(&ResultRecord::new(&system, &fitness(0.6, Some(0.9)))).await.unwrap();

        assert_eq!(path.file_name().unwrap(), "LLM_Debate.jsonl");
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["system_name"], "LLM Debate");
        assert!(lines[0].get("system_safety_ci_median").is_none());
        assert_eq!(lines[1]["system_safety_ci_median"], 0.9);
        assert_eq!(lines[1]["system_capability_ci_median"], 0.6);
    }
}
