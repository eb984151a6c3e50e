//! Behavioural descriptors: embeddings of a system's name, rationale and code.

use crate::EvolveResult;
use breeder_gateway::Gateway;
use breeder_store::EntityStore;
use breeder_types::{System, SystemStatus, SystemUpdate};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{debug, warn};

/// Computes behavioural descriptors by embedding a system's name, rationale and code.
pub struct Descriptor {
    gateway: Gateway,
    dimensions: usize,
    concurrency: usize,
}

impl Descriptor {
    pub fn new(gateway: Gateway, dimensions: usize, concurrency: usize) -> Self {
        Self {
            gateway,
            dimensions,
            concurrency: concurrency.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Text that is embedded for `system`.
    pub fn text(system: &System) -> String {
        format!("{}: {}\n{}", system.name, system.rationale, system.code)
    }

    /// Embed `system` without storing the result.
    pub async fn generate(&self, system: &System) -> EvolveResult<Vec<f32>> {
        Ok(self
            .gateway
            .embed(&Self::text(system), self.dimensions)
            .await?)
    }

    /// Embed `systems` concurrently and persist their descriptors.
    ///
    /// Drafts move to `embedded`; seeds keep their status. A system whose
    /// embedding fails is rejected and left out of the result.
    pub async fn batch(&self, store: &dyn EntityStore, systems: Vec<System>) -> Vec<System> {
        stream::iter(systems)
            .map(|system| self.embed_one(store, system))
            .buffer_unordered(self.concurrency)
            .filter_map(futures::future::ready)
            .collect()
            .await
    }

    async fn embed_one(&self, store: &dyn EntityStore, system: System) -> Option<System> {
        let status = match system.status {
            SystemStatus::Seed => SystemStatus::Seed,
            _ => SystemStatus::Embedded,
        };
        let update = match self.generate(&system).await {
            Ok(descriptor) => SystemUpdate::new().descriptor(descriptor).status(status),
            Err(e) => {
                warn!(system_id = %system.id, error = %e, "embedding failed, discarding system");
                let discard = SystemUpdate::new()
                    .status(SystemStatus::Rejected)
                    .property("discarded", json!(format!("embedding: {e}")));
                if let Err(e) = store.update_system(system.id, discard).await {
                    warn!(system_id = %system.id, error = %e, "could not record discarded system");
                }
                return None;
            }
        };
        match store.update_system(system.id, update).await {
            Ok(updated) => {
                debug!(system_id = %updated.id, "descriptor stored");
                Some(updated)
            }
            Err(e) => {
                warn!(system_id = %system.id, error = %e, "could not store descriptor");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use breeder_gateway::{
        FailingChatTransport, GatewayError, HashEmbeddingTransport, RetryPolicy,
    };
    use breeder_store::{InMemoryStore, PopulationStore, SystemStore};
    use breeder_types::NewSystem;
    use std::sync::Arc;

    fn descriptor() -> Descriptor {
        let gateway = Gateway::new(
            Arc::new(FailingChatTransport::new(GatewayError::Upstream("unused".into()))),
            Arc::new(HashEmbeddingTransport::new()),
            RetryPolicy::immediate(0),
        );
        Descriptor::new(gateway, 8, 4)
    }

    #[tokio::test]
    async fn batch_embeds_and_advances_drafts() {
        let store = InMemoryStore::new();
        let population = store.create_population("mmlu", false).await.unwrap();
        let seed = store
            .append_system(NewSystem::seed(population.id, "cot", "code", "think"))
            .await
            .unwrap();
        let draft = store
            .append_system(NewSystem::draft(population.id, "debate", "code 2", "argue"))
            .await
            .unwrap();

        let embedded = descriptor().batch(&store, vec![seed.clone(), draft.clone()]).await;
        assert_eq!(embedded.len(), 2);

        let seed = store.get_system(seed.id).await.unwrap().unwrap();
        let draft = store.get_system(draft.id).await.unwrap().unwrap();
        assert_eq!(seed.status, SystemStatus::Seed);
        assert_eq!(draft.status, SystemStatus::Embedded);
        assert_eq!(draft.descriptor.as_ref().map(Vec::len), Some(8));
        assert_ne!(seed.descriptor, draft.descriptor);
    }

    #[test]
    fn text_joins_name_rationale_and_code() {
        let mut system = crate::testing::system("Debate", "argue it out");
        system.code = "class C: pass".into();
        assert_eq!(Descriptor::text(&system), "Debate: argue it out\nclass C: pass");
    }
}
