//! Behavioural niches.
//!
//! Descriptors are clustered with a compact HDBSCAN: core distances over
//! `min_samples` neighbours, a minimum spanning tree of the mutual
//! reachability graph, a condensed tree pruned at `min_cluster_size`, and
//! excess-of-mass selection with the root excluded. Points outside every
//! selected cluster get the [`NOISE`] label, which becomes a cluster of its own.

use crate::config::ClusteringConfig;
use crate::{EvolveError, EvolveResult};
use breeder_store::{retry_on_conflict, EntityStore};
use breeder_types::{
    Cluster, ClusterId, Generation, PopulationId, SystemId, SystemStatus, SystemUpdate,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

pub const NOISE: i64 = -1;

/// Lambda used for zero-distance merges.
const MAX_LAMBDA: f64 = 1e12;

/// Outcome of one clustering pass: the generation it was recorded under and
/// the cluster of every system of the population.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub generation: Generation,
    pub clusters: Vec<Cluster>,
    pub assignments: BTreeMap<SystemId, ClusterId>,
}

impl ClusterSnapshot {
    pub fn cluster_of(&self, system_id: SystemId) -> Option<ClusterId> {
        self.assignments.get(&system_id).copied()
    }

    pub fn members(&self, cluster_id: ClusterId) -> impl Iterator<Item = SystemId> + '_ {
        self.assignments
            .iter()
            .filter(move |(_, c)| **c == cluster_id)
            .map(|(s, _)| *s)
    }

    /// Read back the snapshot recorded under `generation`.
    pub async fn load(store: &dyn EntityStore, generation: Generation) -> EvolveResult<Self> {
        let clusters = store.list_clusters(generation.id).await?;
        let assignments = store
            .cluster_assignments(generation.id)
            .await?
            .into_iter()
            .collect();
        Ok(Self {
            generation,
            clusters,
            assignments,
        })
    }
}

/// Groups a population into niches by descriptor density.
pub struct Clusterer {
    config: ClusteringConfig,
}

impl Clusterer {
    pub fn new(config: ClusteringConfig) -> Self {
        Self { config }
    }

    /// One label per descriptor. Too few descriptors for density clustering
    /// gives every descriptor its own label.
    pub fn labels(&self, descriptors: &[Option<Vec<f32>>]) -> Vec<i64> {
        let points = zero_fill(descriptors);
        match self.density_labels(&points) {
            Ok(labels) => labels,
            Err(e) => {
                debug!(error = %e, "falling back to singleton clusters");
                (0..points.len() as i64).collect()
            }
        }
    }

    /// HDBSCAN labels; errors when there are too few points.
    pub fn density_labels(&self, points: &[Vec<f64>]) -> EvolveResult<Vec<i64>> {
        let needed = self.config.min_population.max(2);
        if points.len() < needed {
            return Err(EvolveError::DegenerateCluster(format!(
                "{} descriptors, need at least {needed}",
                points.len()
            )));
        }
        Ok(hdbscan(
            points,
            self.config.min_cluster_size.max(2),
            self.config.min_samples.max(1),
        ))
    }

    /// Recluster the whole population under a new generation.
    ///
    /// Every system gets exactly one cluster in the snapshot; embedded drafts
    /// move to `clustered`.
    pub async fn cluster(
        &self,
        store: &dyn EntityStore,
        population_id: PopulationId,
    ) -> EvolveResult<ClusterSnapshot> {
        let systems = store.list_systems(population_id).await?;
        let descriptors: Vec<Option<Vec<f32>>> =
            systems.iter().map(|s| s.descriptor.clone()).collect();
        let labels = self.labels(&descriptors);

        let generation = store.append_generation(population_id).await?;
        let mut by_label: BTreeMap<i64, Cluster> = BTreeMap::new();
        for label in &labels {
            if !by_label.contains_key(label) {
                let cluster = store.create_cluster(generation.id, *label).await?;
                by_label.insert(*label, cluster);
            }
        }

        let assignments: Vec<(SystemId, ClusterId)> = systems
            .iter()
            .zip(&labels)
            .filter_map(|(system, label)| by_label.get(label).map(|c| (system.id, c.id)))
            .collect();
        retry_on_conflict("assign clusters", || {
            store.assign_clusters(generation.id, &assignments)
        })
        .await?;

        for system in systems.iter().filter(|s| s.status == SystemStatus::Embedded) {
            store
                .update_system(system.id, SystemUpdate::new().status(SystemStatus::Clustered))
                .await?;
        }

        let noise = labels.iter().filter(|l| **l == NOISE).count();
        info!(
            generation = generation.number,
            systems = systems.len(),
            clusters = by_label.len(),
            noise,
            "population clustered"
        );
        Ok(ClusterSnapshot {
            generation,
            clusters: by_label.into_values().collect(),
            assignments: assignments.into_iter().collect(),
        })
    }
}

/// Replace descriptors that are missing, non-finite or not of the modal
/// length with zero vectors of the modal length.
pub fn zero_fill(descriptors: &[Option<Vec<f32>>]) -> Vec<Vec<f64>> {
    let valid = |d: &Vec<f32>| !d.is_empty() && d.iter().all(|x| x.is_finite());
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for d in descriptors.iter().flatten().filter(|d| valid(d)) {
        *counts.entry(d.len()).or_default() += 1;
    }
    let modal = counts
        .into_iter()
        .max_by(|(len_a, n_a), (len_b, n_b)| n_a.cmp(n_b).then(len_a.cmp(len_b)))
        .map(|(len, _)| len)
        .unwrap_or(0);

    descriptors
        .iter()
        .map(|d| match d {
            Some(d) if d.len() == modal && valid(d) => d.iter().map(|x| f64::from(*x)).collect(),
            _ => vec![0.0; modal],
        })
        .collect()
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

struct Merge {
    left: usize,
    right: usize,
    distance: f64,
    size: usize,
}

struct CondensedCluster {
    parent: Option<usize>,
    birth: f64,
    stability: f64,
    children: Vec<usize>,
}

/// Density labels for `points`; `-1` marks noise.
pub fn hdbscan(points: &[Vec<f64>], min_cluster_size: usize, min_samples: usize) -> Vec<i64> {
    let n = points.len();
    if n < 2 {
        return vec![NOISE; n];
    }
    let distances: Vec<Vec<f64>> = points
        .iter()
        .map(|a| points.iter().map(|b| euclidean(a, b)).collect())
        .collect();

    // Core distance: distance to the k-th nearest point, counting the point itself.
    let k = min_samples.clamp(1, n);
    let core: Vec<f64> = distances
        .iter()
        .map(|row| {
            let mut sorted = row.clone();
            sorted.sort_by(f64::total_cmp);
            sorted[k - 1]
        })
        .collect();
    let reach = |i: usize, j: usize| distances[i][j].max(core[i]).max(core[j]);

    let merges = single_linkage(n, minimum_spanning_tree(n, reach));
    let (clusters, fell_from) = condense(n, &merges, min_cluster_size);
    let selected = select_eom(&clusters);

    let mut label_of = HashMap::new();
    for (id, _) in selected.iter().enumerate().filter(|(_, s)| **s) {
        let next = label_of.len() as i64;
        label_of.insert(id, next);
    }
    fell_from
        .into_iter()
        .map(|start| {
            let mut current = Some(start);
            while let Some(id) = current {
                if let Some(label) = label_of.get(&id) {
                    return *label;
                }
                current = clusters[id].parent;
            }
            NOISE
        })
        .collect()
}

/// Prim's algorithm over the complete graph; edges sorted by weight.
fn minimum_spanning_tree<F>(n: usize, weight: F) -> Vec<(usize, usize, f64)>
where
    F: Fn(usize, usize) -> f64,
{
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut from = vec![0usize; n];
    in_tree[0] = true;
    for j in 1..n {
        best[j] = weight(0, j);
    }

    let mut edges = Vec::with_capacity(n - 1);
    for _ in 1..n {
        let Some(next) = (0..n)
            .filter(|j| !in_tree[*j])
            .min_by(|a, b| best[*a].total_cmp(&best[*b]))
        else {
            break;
        };
        in_tree[next] = true;
        edges.push((from[next], next, best[next]));
        for j in 0..n {
            if !in_tree[j] {
                let w = weight(next, j);
                if w < best[j] {
                    best[j] = w;
                    from[j] = next;
                }
            }
        }
    }
    edges.sort_by(|a, b| a.2.total_cmp(&b.2));
    edges
}

/// Dendrogram of sorted MST edges. Node `n + i` is the `i`-th merge.
fn single_linkage(n: usize, edges: Vec<(usize, usize, f64)>) -> Vec<Merge> {
    let mut parent: Vec<usize> = (0..2 * n - 1).collect();
    let mut size = vec![1usize; 2 * n - 1];
    let mut merges = Vec::with_capacity(n - 1);

    fn find(parent: &mut [usize], mut x: usize) -> usize {
        let mut root = x;
        while parent[root] != root {
            root = parent[root];
        }
        while parent[x] != root {
            let next = parent[x];
            parent[x] = root;
            x = next;
        }
        root
    }

    for (a, b, distance) in edges {
        let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
        let id = n + merges.len();
        parent[ra] = id;
        parent[rb] = id;
        size[id] = size[ra] + size[rb];
        merges.push(Merge {
            left: ra,
            right: rb,
            distance,
            size: size[id],
        });
    }
    merges
}

/// Condensed tree. Returns the clusters (root first, children after their
/// parent) and, per point, the cluster it falls out of.
fn condense(n: usize, merges: &[Merge], min_cluster_size: usize) -> (Vec<CondensedCluster>, Vec<usize>) {
    let size_of = |node: usize| if node < n { 1 } else { merges[node - n].size };
    let lambda = |distance: f64| {
        if distance > 0.0 {
            (1.0 / distance).min(MAX_LAMBDA)
        } else {
            MAX_LAMBDA
        }
    };
    let leaves = |node: usize| {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            if node < n {
                out.push(node);
            } else {
                stack.push(merges[node - n].left);
                stack.push(merges[node - n].right);
            }
        }
        out
    };

    let mut clusters = vec![CondensedCluster {
        parent: None,
        birth: 0.0,
        stability: 0.0,
        children: Vec::new(),
    }];
    let mut fell_from = vec![0usize; n];
    let mut stack = vec![(2 * n - 2, 0usize)];

    while let Some((node, label)) = stack.pop() {
        if node < n {
            fell_from[node] = label;
            continue;
        }
        let merge = &merges[node - n];
        let at = lambda(merge.distance);
        let birth = clusters[label].birth;
        let (left, right) = (merge.left, merge.right);
        let (big_left, big_right) = (
            size_of(left) >= min_cluster_size,
            size_of(right) >= min_cluster_size,
        );

        if big_left && big_right {
            clusters[label].stability += merge.size as f64 * (at - birth);
            for child in [left, right] {
                let id = clusters.len();
                clusters.push(CondensedCluster {
                    parent: Some(label),
                    birth: at,
                    stability: 0.0,
                    children: Vec::new(),
                });
                clusters[label].children.push(id);
                stack.push((child, id));
            }
        } else {
            for (child, big) in [(left, big_left), (right, big_right)] {
                if big {
                    stack.push((child, label));
                } else {
                    for point in leaves(child) {
                        fell_from[point] = label;
                        clusters[label].stability += at - birth;
                    }
                }
            }
        }
    }
    (clusters, fell_from)
}

/// Excess-of-mass selection. The root is never selected.
fn select_eom(clusters: &[CondensedCluster]) -> Vec<bool> {
    let mut selected = vec![false; clusters.len()];
    let mut subtree = vec![0.0; clusters.len()];
    for id in (1..clusters.len()).rev() {
        let cluster = &clusters[id];
        let children_total: f64 = cluster.children.iter().map(|c| subtree[*c]).sum();
        if cluster.children.is_empty() || cluster.stability >= children_total {
            selected[id] = true;
            subtree[id] = cluster.stability;
            let mut stack = cluster.children.clone();
            while let Some(descendant) = stack.pop() {
                selected[descendant] = false;
                stack.extend(clusters[descendant].children.iter().copied());
            }
        } else {
            subtree[id] = children_total;
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(cx: f64, cy: f64) -> Vec<Vec<f64>> {
        vec![
            vec![cx, cy],
            vec![cx + 0.1, cy],
            vec![cx, cy + 0.1],
            vec![cx + 0.1, cy + 0.1],
            vec![cx + 0.05, cy + 0.05],
        ]
    }

    #[test]
    fn separates_two_blobs() {
        let mut points = blob(0.0, 0.0);
        points.extend(blob(10.0, 10.0));
        let labels = hdbscan(&points, 3, 2);

        assert!(labels.iter().all(|l| *l != NOISE), "{labels:?}");
        assert!(labels[..5].iter().all(|l| *l == labels[0]));
        assert!(labels[5..].iter().all(|l| *l == labels[5]));
        assert_ne!(labels[0], labels[5]);
    }

    #[test]
    fn far_outlier_is_noise() {
        let mut points = blob(0.0, 0.0);
        points.extend(blob(10.0, 10.0));
        points.push(vec![100.0, -100.0]);
        let labels = hdbscan(&points, 3, 2);
        assert_eq!(labels[10], NOISE);
        assert_ne!(labels[0], NOISE);
        assert_ne!(labels[0], labels[5]);
    }

    #[test]
    fn malformed_descriptors_are_zero_filled() {
        let filled = zero_fill(&[
            Some(vec![1.0, 2.0, 3.0]),
            Some(vec![4.0, 5.0, 6.0]),
            Some(vec![1.0]),
            None,
            Some(vec![f32::NAN, 0.0, 0.0]),
        ]);
        assert!(filled.iter().all(|d| d.len() == 3));
        assert_eq!(filled[1], vec![4.0, 5.0, 6.0]);
        assert_eq!(filled[2], vec![0.0; 3]);
        assert_eq!(filled[3], vec![0.0; 3]);
        assert_eq!(filled[4], vec![0.0; 3]);
    }

    #[test]
    fn small_populations_get_singletons() {
        let clusterer = Clusterer::new(ClusteringConfig {
            min_population: 6,
            ..ClusteringConfig::default()
        });
        let labels = clusterer.labels(&[Some(vec![0.0, 1.0]), Some(vec![0.0, 1.0]), None]);
        assert_eq!(labels, vec![0, 1, 2]);
        assert!(matches!(
            clusterer.density_labels(&[vec![0.0]]),
            Err(EvolveError::DegenerateCluster(_))
        ));
    }
}
