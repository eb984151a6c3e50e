//! In-memory reference implementation of the store traits.
//!
//! Deterministic and test-friendly. All writes go through one lock, so
//! concurrent writers are serialised at the store boundary.

use crate::traits::{ClusterStore, InteractionStore, PopulationStore, SystemStore};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use breeder_types::{
    Agent, AgentId, Chat, ChatId, Cluster, ClusterId, Generation, GenerationId, Meeting,
    MeetingId, MonotonicClock, NewSystem, Population, PopulationId, System, SystemId,
    SystemUpdate,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct MemoryState {
    populations: HashMap<PopulationId, Population>,
    generations: HashMap<PopulationId, Vec<Generation>>,
    generation_owner: HashMap<GenerationId, PopulationId>,
    clusters: HashMap<ClusterId, Cluster>,
    systems: HashMap<SystemId, System>,
    system_order: HashMap<PopulationId, Vec<SystemId>>,
    assignments: HashMap<GenerationId, Vec<(SystemId, ClusterId)>>,
    meetings: HashMap<MeetingId, Meeting>,
    agents: HashMap<AgentId, Agent>,
    agent_meetings: HashMap<AgentId, Vec<MeetingId>>,
    meeting_agents: HashMap<MeetingId, Vec<AgentId>>,
    chats: HashMap<MeetingId, Vec<Chat>>,
}

/// In-memory entity store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
    clock: MonotonicClock,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }
}

fn check_parent(
    state: &MemoryState,
    population_id: PopulationId,
    parent: Option<SystemId>,
) -> StoreResult<()> {
    let Some(parent_id) = parent else {
        return Ok(());
    };
    match state.systems.get(&parent_id) {
        Some(parent) if parent.population_id == population_id => Ok(()),
        Some(parent) => Err(StoreError::InvariantViolation(format!(
            "parent {} belongs to population {}, not {}",
            parent_id, parent.population_id, population_id
        ))),
        None => Err(StoreError::InvariantViolation(format!(
            "parent {} does not exist",
            parent_id
        ))),
    }
}

#[async_trait]
impl PopulationStore for InMemoryStore {
    async fn create_population(&self, benchmark: &str, safety: bool) -> StoreResult<Population> {
        let mut guard = self.write()?;
        let population = Population {
            id: PopulationId::generate(),
            benchmark: benchmark.to_string(),
            safety,
            created_at: self.clock.now(),
        };
        guard.populations.insert(population.id, population.clone());
        Ok(population)
    }

    async fn get_population(&self, id: PopulationId) -> StoreResult<Option<Population>> {
        Ok(self.read()?.populations.get(&id).cloned())
    }

    async fn append_generation(&self, population_id: PopulationId) -> StoreResult<Generation> {
        let mut guard = self.write()?;
        if !guard.populations.contains_key(&population_id) {
            return Err(StoreError::NotFound(format!(
                "population {} not found",
                population_id
            )));
        }
        let generations = guard.generations.entry(population_id).or_default();
        let number = generations.last().map_or(1, |g| g.number + 1);
        let generation = Generation {
            id: GenerationId::generate(),
            population_id,
            number,
            created_at: self.clock.now(),
        };
        generations.push(generation.clone());
        guard.generation_owner.insert(generation.id, population_id);
        Ok(generation)
    }

    async fn list_generations(&self, population_id: PopulationId) -> StoreResult<Vec<Generation>> {
        Ok(self
            .read()?
            .generations
            .get(&population_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl SystemStore for InMemoryStore {
    async fn append_system(&self, new: NewSystem) -> StoreResult<System> {
        let mut guard = self.write()?;
        if !guard.populations.contains_key(&new.population_id) {
            return Err(StoreError::NotFound(format!(
                "population {} not found",
                new.population_id
            )));
        }
        check_parent(&guard, new.population_id, new.first_parent_id)?;
        check_parent(&guard, new.population_id, new.second_parent_id)?;

        let system = System {
            id: SystemId::generate(),
            population_id: new.population_id,
            name: new.name,
            code: new.code,
            rationale: new.rationale,
            first_parent_id: new.first_parent_id,
            second_parent_id: new.second_parent_id,
            mutation_prompt: new.mutation_prompt,
            descriptor: None,
            cluster_id: None,
            capability_ci: None,
            safety_ci: None,
            truth_ci: None,
            sample_size: None,
            confidence_level: None,
            status: new.status,
            properties: BTreeMap::new(),
            created_at: self.clock.now(),
        };
        guard
            .system_order
            .entry(system.population_id)
            .or_default()
            .push(system.id);
        guard.systems.insert(system.id, system.clone());
        Ok(system)
    }

    async fn get_system(&self, id: SystemId) -> StoreResult<Option<System>> {
        Ok(self.read()?.systems.get(&id).cloned())
    }

    async fn update_system(&self, id: SystemId, update: SystemUpdate) -> StoreResult<System> {
        let mut guard = self.write()?;
        if let Some(cluster_id) = update.cluster_id {
            if !guard.clusters.contains_key(&cluster_id) {
                return Err(StoreError::InvariantViolation(format!(
                    "cluster {} does not exist",
                    cluster_id
                )));
            }
        }
        let system = guard
            .systems
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("system {} not found", id)))?;
        update.apply(system);
        Ok(system.clone())
    }

    async fn list_systems(&self, population_id: PopulationId) -> StoreResult<Vec<System>> {
        let guard = self.read()?;
        Ok(guard
            .system_order
            .get(&population_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| guard.systems.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn create_cluster(
        &self,
        generation_id: GenerationId,
        label: i64,
    ) -> StoreResult<Cluster> {
        let mut guard = self.write()?;
        let population_id = *guard.generation_owner.get(&generation_id).ok_or_else(|| {
            StoreError::NotFound(format!("generation {} not found", generation_id))
        })?;
        let cluster = Cluster {
            id: ClusterId::generate(),
            population_id,
            generation_id,
            label,
            created_at: self.clock.now(),
        };
        guard.clusters.insert(cluster.id, cluster.clone());
        Ok(cluster)
    }

    async fn list_clusters(&self, generation_id: GenerationId) -> StoreResult<Vec<Cluster>> {
        let guard = self.read()?;
        let mut clusters: Vec<Cluster> = guard
            .clusters
            .values()
            .filter(|c| c.generation_id == generation_id)
            .cloned()
            .collect();
        clusters.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(clusters)
    }

    async fn assign_clusters(
        &self,
        generation_id: GenerationId,
        assignments: &[(SystemId, ClusterId)],
    ) -> StoreResult<()> {
        let mut guard = self.write()?;
        let population_id = *guard.generation_owner.get(&generation_id).ok_or_else(|| {
            StoreError::NotFound(format!("generation {} not found", generation_id))
        })?;

        let mut seen = HashSet::new();
        for (system_id, cluster_id) in assignments {
            if !seen.insert(*system_id) {
                return Err(StoreError::InvariantViolation(format!(
                    "system {} assigned twice in generation {}",
                    system_id, generation_id
                )));
            }
            match guard.systems.get(system_id) {
                Some(s) if s.population_id == population_id => {}
                _ => {
                    return Err(StoreError::InvariantViolation(format!(
                        "system {} is not in population {}",
                        system_id, population_id
                    )))
                }
            }
            match guard.clusters.get(cluster_id) {
                Some(c) if c.generation_id == generation_id => {}
                _ => {
                    return Err(StoreError::InvariantViolation(format!(
                        "cluster {} is not in generation {}",
                        cluster_id, generation_id
                    )))
                }
            }
        }

        for (system_id, cluster_id) in assignments {
            if let Some(system) = guard.systems.get_mut(system_id) {
                system.cluster_id = Some(*cluster_id);
            }
        }
        guard
            .assignments
            .insert(generation_id, assignments.to_vec());
        Ok(())
    }

    async fn cluster_assignments(
        &self,
        generation_id: GenerationId,
    ) -> StoreResult<Vec<(SystemId, ClusterId)>> {
        Ok(self
            .read()?
            .assignments
            .get(&generation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn cluster_members(&self, cluster_id: ClusterId) -> StoreResult<Vec<System>> {
        let guard = self.read()?;
        let cluster = guard
            .clusters
            .get(&cluster_id)
            .ok_or_else(|| StoreError::NotFound(format!("cluster {} not found", cluster_id)))?;
        Ok(guard
            .assignments
            .get(&cluster.generation_id)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, c)| *c == cluster_id)
                    .filter_map(|(s, _)| guard.systems.get(s).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl InteractionStore for InMemoryStore {
    async fn create_meeting(&self, system_id: SystemId, name: &str) -> StoreResult<Meeting> {
        let mut guard = self.write()?;
        let meeting = Meeting {
            id: MeetingId::generate(),
            system_id,
            name: name.to_string(),
            created_at: self.clock.now(),
        };
        guard.meetings.insert(meeting.id, meeting.clone());
        Ok(meeting)
    }

    async fn create_agent(
        &self,
        system_id: SystemId,
        name: &str,
        temperature: f64,
    ) -> StoreResult<Agent> {
        let mut guard = self.write()?;
        let agent = Agent {
            id: AgentId::generate(),
            system_id,
            name: name.to_string(),
            temperature,
            created_at: self.clock.now(),
        };
        guard.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>> {
        Ok(self.read()?.agents.get(&id).cloned())
    }

    async fn add_agent_to_meeting(
        &self,
        meeting_id: MeetingId,
        agent_id: AgentId,
    ) -> StoreResult<()> {
        let mut guard = self.write()?;
        join(&mut guard, meeting_id, agent_id)
    }

    async fn append_chat(
        &self,
        meeting_id: MeetingId,
        speaker_id: AgentId,
        content: &str,
    ) -> StoreResult<Chat> {
        let mut guard = self.write()?;
        join(&mut guard, meeting_id, speaker_id)?;
        let speaker_name = guard
            .agents
            .get(&speaker_id)
            .map(|a| a.name.clone())
            .unwrap_or_default();
        let chat = Chat {
            id: ChatId::generate(),
            meeting_id,
            speaker_id,
            speaker_name,
            content: content.to_string(),
            created_at: self.clock.now(),
        };
        guard.chats.entry(meeting_id).or_default().push(chat.clone());
        Ok(chat)
    }

    async fn meeting_chats(&self, meeting_id: MeetingId) -> StoreResult<Vec<Chat>> {
        Ok(self
            .read()?
            .chats
            .get(&meeting_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn agent_meetings(&self, agent_id: AgentId) -> StoreResult<Vec<MeetingId>> {
        Ok(self
            .read()?
            .agent_meetings
            .get(&agent_id)
            .cloned()
            .unwrap_or_default())
    }
}

fn join(state: &mut MemoryState, meeting_id: MeetingId, agent_id: AgentId) -> StoreResult<()> {
    if !state.meetings.contains_key(&meeting_id) {
        return Err(StoreError::NotFound(format!(
            "meeting {} not found",
            meeting_id
        )));
    }
    if !state.agents.contains_key(&agent_id) {
        return Err(StoreError::NotFound(format!("agent {} not found", agent_id)));
    }
    let members = state.meeting_agents.entry(meeting_id).or_default();
    if !members.contains(&agent_id) {
        members.push(agent_id);
        state
            .agent_meetings
            .entry(agent_id)
            .or_default()
            .push(meeting_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use breeder_types::{ChatMessage, ConfidenceInterval, SystemStatus, SYSTEM_SPEAKER};

    async fn population(store: &InMemoryStore) -> Population {
        store.create_population("mmlu", false).await.unwrap()
    }

    #[tokio::test]
    async fn generations_are_numbered_from_one() {
        let store = InMemoryStore::new();
        let p = population(&store).await;
        let g1 = store.append_generation(p.id).await.unwrap();
        let g2 = store.append_generation(p.id).await.unwrap();
        assert_eq!((g1.number, g2.number), (1, 2));
        assert_eq!(store.latest_generation(p.id).await.unwrap().unwrap().id, g2.id);
    }

    #[tokio::test]
    async fn parents_must_share_population() {
        let store = InMemoryStore::new();
        let a = population(&store).await;
        let b = population(&store).await;
        let parent = store
            .append_system(NewSystem::seed(a.id, "CoT", "code", "why"))
            .await
            .unwrap();

        let ok = store
            .append_system(
                NewSystem::draft(a.id, "child", "code", "why").with_parents(Some(parent.id), None),
            )
            .await
            .unwrap();
        assert_eq!(ok.first_parent_id, Some(parent.id));

        let err = store
            .append_system(
                NewSystem::draft(b.id, "stray", "code", "why").with_parents(Some(parent.id), None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn update_overwrites_fitness() {
        let store = InMemoryStore::new();
        let p = population(&store).await;
        let s = store
            .append_system(NewSystem::draft(p.id, "x", "code", "why"))
            .await
            .unwrap();

        let first = ConfidenceInterval::new(0.1, 0.2, 0.3);
        let second = ConfidenceInterval::new(0.4, 0.5, 0.6);
        store
            .update_system(s.id, SystemUpdate::new().fitness(first, None, None))
            .await
            .unwrap();
        let updated = store
            .update_system(
                s.id,
                SystemUpdate::new()
                    .fitness(second, None, None)
                    .status(SystemStatus::Validated),
            )
            .await
            .unwrap();
        assert_eq!(updated.capability_ci, second);
        assert_eq!(updated.status, SystemStatus::Validated);
    }

    #[tokio::test]
    async fn snapshot_assigns_each_system_once() {
        let store = InMemoryStore::new();
        let p = population(&store).await;
        let s1 = store
            .append_system(NewSystem::draft(p.id, "a", "c", "r"))
            .await
            .unwrap();
        let s2 = store
            .append_system(NewSystem::draft(p.id, "b", "c", "r"))
            .await
            .unwrap();
        let g = store.append_generation(p.id).await.unwrap();
        let c = store.create_cluster(g.id, 0).await.unwrap();

        let dup = store
            .assign_clusters(g.id, &[(s1.id, c.id), (s1.id, c.id)])
            .await
            .unwrap_err();
        assert!(matches!(dup, StoreError::InvariantViolation(_)));
        assert!(store.cluster_assignments(g.id).await.unwrap().is_empty());

        store
            .assign_clusters(g.id, &[(s1.id, c.id), (s2.id, c.id)])
            .await
            .unwrap();
        let members = store.cluster_members(c.id).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.cluster_id == Some(c.id)));
    }

    #[tokio::test]
    async fn agent_history_spans_meetings() {
        let store = InMemoryStore::new();
        let owner = SystemId::generate();
        let system = store.create_agent(owner, SYSTEM_SPEAKER, 0.0).await.unwrap();
        let solver = store.create_agent(owner, "Solver", 0.7).await.unwrap();
        let critic = store.create_agent(owner, "Critic", 0.7).await.unwrap();
        let m1 = store.create_meeting(owner, "solve").await.unwrap();
        let m2 = store.create_meeting(owner, "review").await.unwrap();

        store.append_chat(m1.id, system.id, "task").await.unwrap();
        store.append_chat(m1.id, solver.id, "draft").await.unwrap();
        store.append_chat(m2.id, critic.id, "fix it").await.unwrap();
        store.add_agent_to_meeting(m2.id, solver.id).await.unwrap();
        store.add_agent_to_meeting(m2.id, solver.id).await.unwrap();

        let history = store.agent_history(solver.id).await.unwrap();
        assert_eq!(
            history,
            vec![
                ChatMessage::system("task"),
                ChatMessage::assistant("draft"),
                ChatMessage::user("Critic: fix it"),
            ]
        );
        assert_eq!(store.agent_meetings(solver.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn interaction_records_keep_their_system() {
        let store = InMemoryStore::new();
        let owner = SystemId::generate();
        let agent = store.create_agent(owner, "Solver", 0.7).await.unwrap();
        let meeting = store.create_meeting(owner, "solve").await.unwrap();
        assert_eq!(meeting.system_id, owner);
        let stored = store.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(stored.system_id, owner);
    }

    #[tokio::test]
    async fn chats_are_strictly_ordered() {
        let store = InMemoryStore::new();
        let owner = SystemId::generate();
        let a = store.create_agent(owner, "A", 0.5).await.unwrap();
        let m = store.create_meeting(owner, "m").await.unwrap();
        for i in 0..50 {
            store.append_chat(m.id, a.id, &i.to_string()).await.unwrap();
        }
        let chats = store.meeting_chats(m.id).await.unwrap();
        assert!(chats.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }

    #[tokio::test]
    async fn unknown_records_are_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .append_chat(MeetingId::generate(), AgentId::generate(), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        let err = store
            .update_system(SystemId::generate(), SystemUpdate::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
