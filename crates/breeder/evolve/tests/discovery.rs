use breeder_bench::{
    Benchmark, BootstrapConfig, Harness, HarnessConfig, Sample, StaticDataset, TaskSpec,
};
use breeder_evolve::{
    cluster_elites, pareto_front, ClusterSnapshot, DiscoveryConfig, Evaluator, EvolveError,
    Illuminator, Orchestrator, Verdict,
};
use breeder_gateway::{
    FailingChatTransport, Gateway, GatewayError, HashEmbeddingTransport, RetryPolicy,
    ScriptedChatTransport,
};
use breeder_runtime::{RuntimeError, ScriptedExecutor};
use breeder_store::{ClusterStore, InMemoryStore, PopulationStore, SystemStore};
use breeder_types::{
    ClusterId, ConfidenceInterval, NewSystem, PopulationId, System, SystemStatus, SystemUpdate,
};
use std::collections::BTreeMap;
use serde_json::json;
use std::sync::Arc;

/// Every schema the loop asks for is satisfied by one object; extra keys are dropped.
fn universal_reply(decision: &'static str) -> ScriptedChatTransport {
    ScriptedChatTransport::new(move |_| {
        Ok(json!({
            "reflection": "the design is sound",
            "thought": "ask a verifier to check the first answer",
            "name": "Verified Chain",
            "code": "class VerifiedChain:\n    async def forward(self, task, required_answer_format):\n        return 'A'\n",
            "thinking": "compared with the niche",
            "decision": decision,
        })
        .to_string())
    })
}

fn gateway(chat: Arc<dyn breeder_gateway::ChatTransport>) -> Gateway {
    Gateway::new(chat, Arc::new(HashEmbeddingTransport::new()), RetryPolicy::immediate(0))
}

fn config(results: &std::path::Path) -> DiscoveryConfig {
    let mut config = DiscoveryConfig::default();
    config.run.benchmark = "mmlu".into();
    config.run.n_generation = 1;
    config.run.n_mutations = 1;
    config.run.debug_max = 1;
    config.run.n_evals = 6;
    config.run.workers = 2;
    config.run.bootstrap_resamples = 500;
    config.results.dir = results.to_path_buf();
    config
}

fn samples() -> Vec<Sample> {
    (0..6)
        .map(|i| Sample::new(format!("q{i}"), format!("question {i}? (A) yes (B) no"), "A"))
        .collect()
}

fn dataset() -> Arc<StaticDataset> {
    Arc::new(StaticDataset::new("mmlu", samples()))
}

fn orchestrator(store: Arc<InMemoryStore>, config: DiscoveryConfig) -> Orchestrator {
    Orchestrator::new(
        store,
        gateway(Arc::new(universal_reply("Y"))),
        Arc::new(ScriptedExecutor::constant("A")),
        config,
    )
    .with_dataset(Benchmark::Mmlu, dataset())
}

#[tokio::test]
async fn one_generation_produces_a_validated_descendant() {
    let results = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let summary = orchestrator(store.clone(), config(results.path()))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.benchmark, Benchmark::Mmlu);
    assert_eq!(summary.generations, 2);
    let systems = store.list_systems(summary.population_id).await.unwrap();
    assert_eq!(systems.len(), 6);

    let draft = systems
        .iter()
        .find(|s| s.status != SystemStatus::Seed)
        .unwrap();
    assert_eq!(draft.name, "Verified Chain");
    assert_eq!(draft.status, SystemStatus::Validated);
    assert!(draft.descriptor.is_some());
    assert!(draft.cluster_id.is_some());
    assert!(draft.first_parent_id.is_some());
    assert!(draft.mutation_prompt.is_some());
    assert_eq!(draft.capability_median(), Some(1.0));
    assert_eq!(draft.sample_size, Some(6));

    for seed in systems.iter().filter(|s| s.status == SystemStatus::Seed) {
        assert!(seed.capability_ci.is_some(), "{} was not validated", seed.name);
    }

    assert!(!summary.finalists.is_empty());
    let written = std::fs::read_dir(&summary.results_dir).unwrap().count();
    assert_eq!(written, summary.finalists.len());
}

#[tokio::test]
async fn resume_continues_an_existing_population() {
    let results = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let mut first = config(results.path());
    first.run.n_generation = 0;
    let summary = orchestrator(store.clone(), first).run().await.unwrap();
    assert_eq!(summary.generations, 1);
    assert_eq!(store.list_systems(summary.population_id).await.unwrap().len(), 5);

    let mut resumed = config(results.path());
    resumed.run.population_id = Some(summary.population_id.to_string());
    let again = orchestrator(store.clone(), resumed).run().await.unwrap();
    assert_eq!(again.population_id, summary.population_id);
    assert_eq!(again.generations, 2);
    assert_eq!(store.list_systems(summary.population_id).await.unwrap().len(), 6);
}

#[tokio::test]
async fn resuming_an_unknown_population_fails() {
    let results = tempfile::tempdir().unwrap();
    let mut config = config(results.path());
    config.run.population_id = Some(PopulationId::generate().to_string());
    let err = orchestrator(Arc::new(InMemoryStore::new()), config)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, EvolveError::Config(_)));
}

/// A population with one cluster holding scored members and an unscored candidate.
async fn niche(store: &InMemoryStore, medians: &[f64]) -> System {
    let population = store.create_population("mmlu", false).await.unwrap();
    let mut members = Vec::new();
    for (i, median) in medians.iter().enumerate() {
        let member = store
            .append_system(NewSystem::draft(population.id, format!("member {i}"), "code", "why"))
            .await
            .unwrap();
        store
            .update_system(
                member.id,
                SystemUpdate::new()
                    .fitness(Some(ConfidenceInterval::point(*median)), None, None)
                    .status(SystemStatus::Validated),
            )
            .await
            .unwrap();
        members.push(member.id);
    }
    let candidate = store
        .append_system(NewSystem::draft(population.id, "candidate", "code", "why"))
        .await
        .unwrap();
    store
        .update_system(candidate.id, SystemUpdate::new().status(SystemStatus::Clustered))
        .await
        .unwrap();
    members.push(candidate.id);

    let generation = store.append_generation(population.id).await.unwrap();
    let cluster = store.create_cluster(generation.id, 0).await.unwrap();
    let assignments: Vec<_> = members.iter().map(|id| (*id, cluster.id)).collect();
    store.assign_clusters(generation.id, &assignments).await.unwrap();
    store.get_system(candidate.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn judge_rejection_keeps_the_candidate_unscored() {
    let store = InMemoryStore::new();
    let candidate = niche(&store, &[0.80, 0.78, 0.77, 0.75, 0.70]).await;
    let chat = Arc::new(universal_reply("N"));
    let illuminator = Illuminator::new(gateway(chat.clone()), "m", Benchmark::Mmlu);

    let verdict = illuminator.illuminate(&store, &candidate).await.unwrap();
    assert_eq!(verdict, Verdict::Rejected);

    let stored = store.get_system(candidate.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SystemStatus::Rejected);
    assert!(stored.capability_ci.is_none());
    let requests = chat.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].transcript().contains("80.0%"));
    assert_eq!(requests[0].temperature, 0.0);
}

#[tokio::test]
async fn sparse_niche_admits_without_asking() {
    let store = InMemoryStore::new();
    let candidate = niche(&store, &[0.5]).await;
    let chat = Arc::new(FailingChatTransport::new(GatewayError::Upstream("down".into())));
    let illuminator = Illuminator::new(gateway(chat.clone()), "m", Benchmark::Mmlu);

    let verdict = illuminator.illuminate(&store, &candidate).await.unwrap();
    assert_eq!(verdict, Verdict::Admitted);
    assert_eq!(chat.calls(), 0);
    let stored = store.get_system(candidate.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SystemStatus::Admitted);
}

#[tokio::test]
async fn judge_failure_rejects() {
    let store = InMemoryStore::new();
    let candidate = niche(&store, &[0.6, 0.4]).await;
    let chat = Arc::new(FailingChatTransport::new(GatewayError::Upstream("down".into())));
    let illuminator = Illuminator::new(gateway(chat.clone()), "m", Benchmark::Mmlu);

    let admitted = illuminator.filter(&store, vec![candidate], 2).await;
    assert!(admitted.is_empty());
    assert!(chat.calls() >= 1);
}

#[tokio::test]
async fn crashing_system_stays_out_of_selection() {
    let store = Arc::new(InMemoryStore::new());
    let population = store.create_population("mmlu", false).await.unwrap();
    let steady = store
        .append_system(NewSystem::draft(population.id, "steady", "code", "why"))
        .await
        .unwrap();
    let crashing = store
        .append_system(NewSystem::draft(population.id, "crashing", "code", "why"))
        .await
        .unwrap();

    let executor = ScriptedExecutor::new(|program, _| {
        if program.name == "crashing" {
            Err(RuntimeError::CandidateError("boom".into()))
        } else {
            Ok("A".to_string())
        }
    });
    let harness = Harness::new(
        Arc::new(executor),
        gateway(Arc::new(universal_reply("Y"))),
        "m",
        HarnessConfig {
            concurrency: 2,
            bootstrap: BootstrapConfig {
                resamples: 500,
                seed: Some(1),
                ..BootstrapConfig::default()
            },
            ..HarnessConfig::default()
        },
    );
    let evaluator = Evaluator::new(store.clone(), Arc::new(harness), 2);
    let tasks = [TaskSpec::new(Benchmark::Mmlu, samples())];

    let validated = evaluator
        .validate_all(vec![steady.clone(), crashing.clone()], &tasks)
        .await;
    assert_eq!(validated.len(), 2);

    let stored = store.get_system(crashing.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SystemStatus::Validated);
    assert_eq!(stored.sample_size, Some(6));
    assert!(stored.capability_ci.is_none());
    assert!(!stored.is_selectable());

    let systems = store.list_systems(population.id).await.unwrap();
    let cluster_id = ClusterId::generate();
    let snapshot = ClusterSnapshot {
        generation: store.append_generation(population.id).await.unwrap(),
        clusters: vec![],
        assignments: BTreeMap::from([(steady.id, cluster_id), (crashing.id, cluster_id)]),
    };

    let elites: Vec<_> = cluster_elites(&systems, &snapshot, 5)
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(elites, vec![steady.id]);
    let front: Vec<_> = pareto_front(&systems).into_iter().map(|s| s.id).collect();
    assert_eq!(front, vec![steady.id]);
}
