//! Parent selection: per-cluster elites or the capability/safety Pareto front.

use crate::cluster::ClusterSnapshot;
use breeder_types::{capability_order, System};
use std::collections::{BTreeMap, HashMap};

/// How parents are picked for the next generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    ClusterLocal,
    Pareto,
}

impl SelectionMode {
    pub fn from_flag(pareto: bool) -> Self {
        if pareto {
            SelectionMode::Pareto
        } else {
            SelectionMode::ClusterLocal
        }
    }
}

/// Elite set for the next generation. Only selectable systems qualify.
pub fn select(
    mode: SelectionMode,
    systems: &[System],
    snapshot: &ClusterSnapshot,
    top_k: usize,
) -> Vec<System> {
    match mode {
        SelectionMode::ClusterLocal => cluster_elites(systems, snapshot, top_k),
        SelectionMode::Pareto => pareto_front(systems),
    }
}

/// The `top_k` selectable members of every cluster by capability median,
/// ties broken by recency.
pub fn cluster_elites(systems: &[System], snapshot: &ClusterSnapshot, top_k: usize) -> Vec<System> {
    let mut by_cluster: BTreeMap<_, Vec<&System>> = BTreeMap::new();
    for system in systems.iter().filter(|s| s.is_selectable()) {
        if let Some(cluster_id) = snapshot.cluster_of(system.id) {
            by_cluster.entry(cluster_id).or_default().push(system);
        }
    }
    let mut elites: Vec<System> = by_cluster
        .into_values()
        .flat_map(|mut members| {
            members.sort_by(|a, b| capability_order(a, b));
            members.into_iter().take(top_k.max(1)).cloned()
        })
        .collect();
    elites.sort_by(capability_order);
    elites
}

fn objectives(system: &System) -> (f64, f64) {
    (
        system.capability_median().unwrap_or(f64::NEG_INFINITY),
        system.safety_median().unwrap_or(f64::NEG_INFINITY),
    )
}

/// Whether `a` dominates `b` under maximisation of both objectives.
pub fn dominates(a: (f64, f64), b: (f64, f64)) -> bool {
    a.0 >= b.0 && a.1 >= b.1 && (a.0 > b.0 || a.1 > b.1)
}

/// Non-dominated selectable systems over (capability median, safety median).
/// Missing medians count as the worst value.
pub fn pareto_front(systems: &[System]) -> Vec<System> {
    let candidates: Vec<&System> = systems.iter().filter(|s| s.is_selectable()).collect();
    let points: HashMap<_, _> = candidates.iter().map(|s| (s.id, objectives(s))).collect();
    let mut front: Vec<System> = candidates
        .iter()
        .filter(|s| {
            let p = points[&s.id];
            !candidates.iter().any(|other| dominates(points[&other.id], p))
        })
        .map(|s| (*s).clone())
        .collect();
    front.sort_by(capability_order);
    front
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::scored;
    use breeder_types::{ClusterId, Generation, GenerationId, PopulationId, SystemStatus};
    use chrono::Utc;
    use proptest::prelude::*;

    fn snapshot(groups: &[&[&System]]) -> ClusterSnapshot {
        let mut assignments = BTreeMap::new();
        for group in groups {
            let cluster_id = ClusterId::generate();
            for system in group.iter() {
                assignments.insert(system.id, cluster_id);
            }
        }
        ClusterSnapshot {
            generation: Generation {
                id: GenerationId::generate(),
                population_id: PopulationId::generate(),
                number: 1,
                created_at: Utc::now(),
            },
            clusters: Vec::new(),
            assignments,
        }
    }

    fn pairs(front: &[System]) -> Vec<(f64, f64)> {
        let mut out: Vec<(f64, f64)> = front.iter().map(objectives).collect();
        out.sort_by(|a, b| a.0.total_cmp(&b.0));
        out
    }

    #[test]
    fn pareto_keeps_the_non_dominated_systems() {
        let systems = vec![
            scored(Some(0.70), Some(0.60)),
            scored(Some(0.72), Some(0.55)),
            scored(Some(0.65), Some(0.80)),
            scored(Some(0.60), Some(0.55)),
        ];
        let front = pareto_front(&systems);
        assert_eq!(pairs(&front), vec![(0.65, 0.80), (0.70, 0.60), (0.72, 0.55)]);
    }

    #[test]
    fn missing_safety_counts_as_worst() {
        let systems = vec![scored(Some(0.9), None), scored(Some(0.8), Some(0.1))];
        assert_eq!(pareto_front(&systems).len(), 2);
        let systems = vec![scored(Some(0.8), None), scored(Some(0.8), Some(0.1))];
        assert_eq!(pairs(&pareto_front(&systems)), vec![(0.8, 0.1)]);
    }

    #[test]
    fn cluster_elites_take_the_best_of_each_cluster() {
        let a = scored(Some(0.4), None);
        let b = scored(Some(0.7), None);
        let c = scored(Some(0.2), None);
        let mut rejected = scored(Some(0.99), None);
        rejected.status = SystemStatus::Rejected;
        let unscored = scored(None, None);
        let snap = snapshot(&[&[&a, &b, &rejected], &[&c, &unscored]]);
        let systems = vec![a, b.clone(), c.clone(), rejected, unscored];

        let elites = cluster_elites(&systems, &snap, 1);
        let ids: Vec<_> = elites.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![b.id, c.id]);
        assert_eq!(cluster_elites(&systems, &snap, 2).len(), 3);
    }

    proptest! {
        #[test]
        fn front_is_non_dominated_and_covers_the_rest(
            points in proptest::collection::vec((0.0f64..1.0, 0.0f64..1.0), 1..40)
        ) {
            let systems: Vec<System> = points
                .iter()
                .map(|(c, s)| scored(Some(*c), Some(*s)))
                .collect();
            let front = pareto_front(&systems);
            prop_assert!(!front.is_empty());
            for member in &front {
                prop_assert!(!systems.iter().any(|s| dominates(objectives(s), objectives(member))));
            }
            let front_ids: Vec<_> = front.iter().map(|s| s.id).collect();
            for system in systems.iter().filter(|s| !front_ids.contains(&s.id)) {
                prop_assert!(front.iter().any(|m| dominates(objectives(m), objectives(system))));
            }
        }
    }
}
