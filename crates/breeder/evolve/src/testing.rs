use breeder_types::{ConfidenceInterval, PopulationId, System, SystemId, SystemStatus};
use chrono::Utc;
use std::collections::BTreeMap;

pub fn system(name: &str, rationale: &str) -> System {
    System {
        id: SystemId::generate(),
        population_id: PopulationId::generate(),
        name: name.to_string(),
        code: String::new(),
        rationale: rationale.to_string(),
        first_parent_id: None,
        second_parent_id: None,
        mutation_prompt: None,
        descriptor: None,
        cluster_id: None,
        capability_ci: None,
        safety_ci: None,
        truth_ci: None,
        sample_size: None,
        confidence_level: None,
        status: SystemStatus::Validated,
        properties: BTreeMap::new(),
        created_at: Utc::now(),
    }
}

pub fn scored(capability: Option<f64>, safety: Option<f64>) -> System {
    let mut s = system("scored", "");
    s.capability_ci = capability.map(ConfidenceInterval::point);
    s.safety_ci = safety.map(ConfidenceInterval::point);
    s
}
