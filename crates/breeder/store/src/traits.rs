use crate::StoreResult;
use async_trait::async_trait;
use breeder_types::{
    chat_history, Agent, AgentId, Chat, ChatMessage, Cluster, ClusterId, Generation, GenerationId,
    Meeting, MeetingId, NewSystem, Population, PopulationId, System, SystemId, SystemUpdate,
};

/// Runs and their generations.
#[async_trait]
pub trait PopulationStore: Send + Sync {
    async fn create_population(&self, benchmark: &str, safety: bool) -> StoreResult<Population>;

    async fn get_population(&self, id: PopulationId) -> StoreResult<Option<Population>>;

    /// Append the next generation (numbered from 1) to a population.
    async fn append_generation(&self, population_id: PopulationId) -> StoreResult<Generation>;

    /// Generations of a population in ascending number order.
    async fn list_generations(&self, population_id: PopulationId) -> StoreResult<Vec<Generation>>;

    async fn latest_generation(
        &self,
        population_id: PopulationId,
    ) -> StoreResult<Option<Generation>> {
        Ok(self.list_generations(population_id).await?.pop())
    }
}

/// Candidate program records.
#[async_trait]
pub trait SystemStore: Send + Sync {
    /// Persist a new system. Parents must already exist in the same population.
    async fn append_system(&self, system: NewSystem) -> StoreResult<System>;

    async fn get_system(&self, id: SystemId) -> StoreResult<Option<System>>;

    /// Apply a partial update of the late-bound fields and return the result.
    async fn update_system(&self, id: SystemId, update: SystemUpdate) -> StoreResult<System>;

    /// Systems of a population in creation order.
    async fn list_systems(&self, population_id: PopulationId) -> StoreResult<Vec<System>>;
}

/// Behavioural niches and the per-generation assignment snapshot.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn create_cluster(&self, generation_id: GenerationId, label: i64)
        -> StoreResult<Cluster>;

    async fn list_clusters(&self, generation_id: GenerationId) -> StoreResult<Vec<Cluster>>;

    /// Record the snapshot of a generation and point each system at its cluster.
    ///
    /// All-or-nothing: every cluster must belong to the generation and every
    /// system to its population, and a system may appear at most once.
    async fn assign_clusters(
        &self,
        generation_id: GenerationId,
        assignments: &[(SystemId, ClusterId)],
    ) -> StoreResult<()>;

    async fn cluster_assignments(
        &self,
        generation_id: GenerationId,
    ) -> StoreResult<Vec<(SystemId, ClusterId)>>;

    /// Systems assigned to a cluster in its generation's snapshot.
    async fn cluster_members(&self, cluster_id: ClusterId) -> StoreResult<Vec<System>>;
}

/// Scratch records created while a candidate runs.
#[async_trait]
pub trait InteractionStore: Send + Sync {
    async fn create_meeting(&self, system_id: SystemId, name: &str) -> StoreResult<Meeting>;

    async fn create_agent(
        &self,
        system_id: SystemId,
        name: &str,
        temperature: f64,
    ) -> StoreResult<Agent>;

    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>>;

    /// Idempotent.
    async fn add_agent_to_meeting(&self, meeting_id: MeetingId, agent_id: AgentId)
        -> StoreResult<()>;

    /// Append a chat; the speaker joins the meeting if it has not yet.
    async fn append_chat(
        &self,
        meeting_id: MeetingId,
        speaker_id: AgentId,
        content: &str,
    ) -> StoreResult<Chat>;

    /// Chats of a meeting in timestamp order.
    async fn meeting_chats(&self, meeting_id: MeetingId) -> StoreResult<Vec<Chat>>;

    async fn agent_meetings(&self, agent_id: AgentId) -> StoreResult<Vec<MeetingId>>;

    /// The agent's view of every meeting it takes part in.
    async fn agent_history(&self, agent_id: AgentId) -> StoreResult<Vec<ChatMessage>> {
        let mut chats = Vec::new();
        for meeting_id in self.agent_meetings(agent_id).await? {
            chats.extend(self.meeting_chats(meeting_id).await?);
        }
        Ok(chat_history(agent_id, chats))
    }
}

/// Everything the discovery loop needs from persistence.
pub trait EntityStore:
    PopulationStore + SystemStore + ClusterStore + InteractionStore + Send + Sync
{
}

impl<T> EntityStore for T where
    T: PopulationStore + SystemStore + ClusterStore + InteractionStore + Send + Sync
{
}
