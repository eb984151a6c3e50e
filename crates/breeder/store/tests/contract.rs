//! Behaviour shared by every store backend.

use breeder_store::{EntityStore, InMemoryStore, PopulationStore, StoreError, SystemStore};
use breeder_types::{NewSystem, SystemStatus, SystemUpdate};
use std::collections::HashSet;
use std::sync::Arc;

async fn lineage_and_snapshot(store: Arc<dyn EntityStore>) {
    let population = store.create_population("gpqa", false).await.unwrap();
    let seed = store
        .append_system(NewSystem::seed(population.id, "Seed", "code", "why"))
        .await
        .unwrap();

    let seed_id = seed.id;
    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let pid = population.id;
        handles.push(tokio::spawn(async move {
            store
                .append_system(
                    NewSystem::draft(pid, format!("child-{i}"), "code", "why")
                        .with_parents(Some(seed_id), None)
                        .with_mutation_prompt("mutate"),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let systems = store.list_systems(population.id).await.unwrap();
    assert_eq!(systems.len(), 9);
    assert!(systems.windows(2).all(|w| w[0].created_at < w[1].created_at));
    for child in systems.iter().filter(|s| s.status == SystemStatus::Draft) {
        let parent = store
            .get_system(child.first_parent_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parent.population_id, child.population_id);
    }

    let generation = store.append_generation(population.id).await.unwrap();
    let left = store.create_cluster(generation.id, 0).await.unwrap();
    let right = store.create_cluster(generation.id, 1).await.unwrap();
    let assignments: Vec<_> = systems
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id, if i % 2 == 0 { left.id } else { right.id }))
        .collect();
    store
        .assign_clusters(generation.id, &assignments)
        .await
        .unwrap();

    let snapshot = store.cluster_assignments(generation.id).await.unwrap();
    let unique: HashSet<_> = snapshot.iter().map(|(s, _)| *s).collect();
    assert_eq!(unique.len(), systems.len());
    let members = store.cluster_members(left.id).await.unwrap();
    assert_eq!(members.len(), 5);

    let next = store.append_generation(population.id).await.unwrap();
    let foreign = store.create_cluster(next.id, 0).await.unwrap();
    let err = store
        .assign_clusters(generation.id, &[(seed.id, foreign.id)])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvariantViolation(_)));
    assert_eq!(store.cluster_assignments(generation.id).await.unwrap().len(), 9);

    let updated = store
        .update_system(seed.id, SystemUpdate::new().status(SystemStatus::Rejected))
        .await
        .unwrap();
    assert!(!updated.is_selectable());
}

#[tokio::test]
async fn in_memory_store_contract() {
    lineage_and_snapshot(Arc::new(InMemoryStore::new())).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = breeder_store::SqliteStore::connect(dir.path().join("run.db"))
        .await
        .unwrap();
    lineage_and_snapshot(Arc::new(store)).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.db");
    let (population_id, system_id) = {
        let store = breeder_store::SqliteStore::connect(&path).await.unwrap();
        let p = store.create_population("drop", true).await.unwrap();
        let s = store
            .append_system(NewSystem::seed(p.id, "Debate", "code", "why"))
            .await
            .unwrap();
        store.pool().close().await;
        (p.id, s.id)
    };

    let store = breeder_store::SqliteStore::connect(&path).await.unwrap();
    let population = store.get_population(population_id).await.unwrap().unwrap();
    assert_eq!(population.benchmark, "drop");
    let later = store
        .append_system(NewSystem::draft(population_id, "Next", "code", "why"))
        .await
        .unwrap();
    let first = store.get_system(system_id).await.unwrap().unwrap();
    assert!(later.created_at > first.created_at);
}
