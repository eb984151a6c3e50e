//! Population, generation, cluster and system records.

use crate::ci::ConfidenceInterval;
use crate::ids::{ClusterId, GenerationId, PopulationId, SystemId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A discovery run over one benchmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Population {
    pub id: PopulationId,
    pub benchmark: String,
    /// Whether safety (and truthfulness) objectives are scored.
    pub safety: bool,
    pub created_at: DateTime<Utc>,
}

/// One pass of the evolutionary loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub id: GenerationId,
    pub population_id: PopulationId,
    /// 1-based ordinal within the population.
    pub number: u32,
    pub created_at: DateTime<Utc>,
}

/// Behavioural niche within a (population, generation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub population_id: PopulationId,
    pub generation_id: GenerationId,
    /// Density label that produced this cluster (`-1` is the noise label).
    pub label: i64,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a candidate program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    /// Hand-written member of the initial archive.
    Seed,
    Draft,
    Embedded,
    Clustered,
    Admitted,
    Rejected,
    Validated,
}

impl SystemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemStatus::Seed => "seed",
            SystemStatus::Draft => "draft",
            SystemStatus::Embedded => "embedded",
            SystemStatus::Clustered => "clustered",
            SystemStatus::Admitted => "admitted",
            SystemStatus::Rejected => "rejected",
            SystemStatus::Validated => "validated",
        }
    }

    /// Statuses whose pipeline work has not finished yet.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SystemStatus::Draft
                | SystemStatus::Embedded
                | SystemStatus::Clustered
                | SystemStatus::Admitted
        )
    }
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SystemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seed" => Ok(SystemStatus::Seed),
            "draft" => Ok(SystemStatus::Draft),
            "embedded" => Ok(SystemStatus::Embedded),
            "clustered" => Ok(SystemStatus::Clustered),
            "admitted" => Ok(SystemStatus::Admitted),
            "rejected" => Ok(SystemStatus::Rejected),
            "validated" => Ok(SystemStatus::Validated),
            other => Err(format!("unknown system status: {}", other)),
        }
    }
}

/// A candidate multi-agent program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub id: SystemId,
    pub population_id: PopulationId,
    pub name: String,
    /// Source text defining the `forward(task, required_answer_format)` entry.
    pub code: String,
    pub rationale: String,
    pub first_parent_id: Option<SystemId>,
    pub second_parent_id: Option<SystemId>,
    /// Operator instruction that produced this system.
    pub mutation_prompt: Option<String>,
    pub descriptor: Option<Vec<f32>>,
    pub cluster_id: Option<ClusterId>,
    pub capability_ci: Option<ConfidenceInterval>,
    pub safety_ci: Option<ConfidenceInterval>,
    pub truth_ci: Option<ConfidenceInterval>,
    pub sample_size: Option<u32>,
    pub confidence_level: Option<f64>,
    pub status: SystemStatus,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl System {
    pub fn capability_median(&self) -> Option<f64> {
        self.capability_ci.map(|ci| ci.median)
    }

    pub fn safety_median(&self) -> Option<f64> {
        self.safety_ci.map(|ci| ci.median)
    }

    pub fn parents(&self) -> impl Iterator<Item = SystemId> + '_ {
        self.first_parent_id
            .iter()
            .chain(self.second_parent_id.iter())
            .copied()
    }

    /// Whether this system may be sampled as a mutation parent.
    pub fn is_selectable(&self) -> bool {
        matches!(self.status, SystemStatus::Validated | SystemStatus::Seed)
            && self.capability_ci.is_some()
    }

    /// Typed read of a late-bound property.
    pub fn property<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.properties
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn set_property<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        if let Ok(value) = serde_json::to_value(value) {
            self.properties.insert(key.into(), value);
        }
    }
}

/// Fields required to create a system record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSystem {
    pub population_id: PopulationId,
    pub name: String,
    pub code: String,
    pub rationale: String,
    pub first_parent_id: Option<SystemId>,
    pub second_parent_id: Option<SystemId>,
    pub mutation_prompt: Option<String>,
    pub status: SystemStatus,
}

impl NewSystem {
    pub fn draft(
        population_id: PopulationId,
        name: impl Into<String>,
        code: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            population_id,
            name: name.into(),
            code: code.into(),
            rationale: rationale.into(),
            first_parent_id: None,
            second_parent_id: None,
            mutation_prompt: None,
            status: SystemStatus::Draft,
        }
    }

    pub fn seed(
        population_id: PopulationId,
        name: impl Into<String>,
        code: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            status: SystemStatus::Seed,
            ..Self::draft(population_id, name, code, rationale)
        }
    }

    pub fn with_parents(mut self, first: Option<SystemId>, second: Option<SystemId>) -> Self {
        self.first_parent_id = first;
        self.second_parent_id = second;
        self
    }

    pub fn with_mutation_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.mutation_prompt = Some(prompt.into());
        self
    }
}

/// Partial update of the late-bound fields of a system.
///
/// `None` leaves a field untouched. Fitness fields use a nested option so a
/// re-validation can clear a previously recorded interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemUpdate {
    pub descriptor: Option<Vec<f32>>,
    pub cluster_id: Option<ClusterId>,
    pub status: Option<SystemStatus>,
    pub capability_ci: Option<Option<ConfidenceInterval>>,
    pub safety_ci: Option<Option<ConfidenceInterval>>,
    pub truth_ci: Option<Option<ConfidenceInterval>>,
    pub sample_size: Option<u32>,
    pub confidence_level: Option<f64>,
    /// Merged into the existing properties map.
    pub properties: BTreeMap<String, Value>,
}

impl SystemUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor(mut self, descriptor: Vec<f32>) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn cluster(mut self, cluster_id: ClusterId) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    pub fn status(mut self, status: SystemStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn fitness(
        mut self,
        capability: Option<ConfidenceInterval>,
        safety: Option<ConfidenceInterval>,
        truth: Option<ConfidenceInterval>,
    ) -> Self {
        self.capability_ci = Some(capability);
        self.safety_ci = Some(safety);
        self.truth_ci = Some(truth);
        self
    }

    pub fn sampling(mut self, sample_size: u32, confidence_level: f64) -> Self {
        self.sample_size = Some(sample_size);
        self.confidence_level = Some(confidence_level);
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Apply this update to an in-memory record.
    pub fn apply(self, system: &mut System) {
        if let Some(descriptor) = self.descriptor {
            system.descriptor = Some(descriptor);
        }
        if let Some(cluster_id) = self.cluster_id {
            system.cluster_id = Some(cluster_id);
        }
        if let Some(status) = self.status {
            system.status = status;
        }
        if let Some(ci) = self.capability_ci {
            system.capability_ci = ci;
        }
        if let Some(ci) = self.safety_ci {
            system.safety_ci = ci;
        }
        if let Some(ci) = self.truth_ci {
            system.truth_ci = ci;
        }
        if let Some(n) = self.sample_size {
            system.sample_size = Some(n);
        }
        if let Some(level) = self.confidence_level {
            system.confidence_level = Some(level);
        }
        system.properties.extend(self.properties);
    }
}

/// Archive order: highest capability median first, then most recent.
///
/// Systems without a capability score sort after every scored system.
pub fn capability_order(a: &System, b: &System) -> Ordering {
    let by_median = match (a.capability_median(), b.capability_median()) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_median.then_with(|| b.created_at.cmp(&a.created_at))
}

/// The elite of a cluster: the scored member with the highest capability
/// median, ties broken by the most recent creation time.
pub fn elite<'a, I>(members: I) -> Option<&'a System>
where
    I: IntoIterator<Item = &'a System>,
{
    members
        .into_iter()
        .filter(|s| s.capability_median().is_some())
        .min_by(|a, b| capability_order(a, b))
}
