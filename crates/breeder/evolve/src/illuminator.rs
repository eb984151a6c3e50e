//! Surrogate filter run before the expensive validation.
//!
//! A new candidate is compared with the best scored members of its cluster.
//! With at most one such member it is admitted outright; otherwise the model
//! is asked whether the candidate has at least an even chance of matching the
//! best of them. Any failure of that call rejects the candidate.

use crate::prompts;
use crate::EvolveResult;
use breeder_bench::Benchmark;
use breeder_gateway::{text_field, ChatMessage, Gateway, ResponseSchema};
use breeder_store::EntityStore;
use breeder_types::{capability_order, System, SystemStatus, SystemUpdate};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{debug, info, warn};

/// Cluster members shown to the judge.
pub const TOP_MEMBERS: usize = 5;

/// Outcome of judging a candidate against its niche.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admitted,
    Rejected,
}

/// Decides whether a clustered candidate is novel enough to be scored.
pub struct Illuminator {
    gateway: Gateway,
    model: String,
    benchmark: Benchmark,
}

impl Illuminator {
    pub fn new(gateway: Gateway, model: impl Into<String>, benchmark: Benchmark) -> Self {
        Self {
            gateway,
            model: model.into(),
            benchmark,
        }
    }

    fn schema() -> ResponseSchema {
        ResponseSchema::new()
            .field("thinking", "Your step by step comparison of the candidate with the top systems.")
            .field("decision", "Y or N.")
    }

    /// Best scored members of the candidate's cluster, excluding the candidate.
    pub async fn top_members(
        &self,
        store: &dyn EntityStore,
        candidate: &System,
    ) -> EvolveResult<Vec<System>> {
        let Some(cluster_id) = candidate.cluster_id else {
            return Ok(Vec::new());
        };
        let mut members: Vec<System> = store
            .cluster_members(cluster_id)
            .await?
            .into_iter()
            .filter(|s| s.id != candidate.id && s.capability_median().is_some())
            .collect();
        members.sort_by(capability_order);
        members.truncate(TOP_MEMBERS);
        Ok(members)
    }

    /// Ask the model whether `candidate` is competitive with `top`.
    pub async fn judge(&self, candidate: &System, top: &[System]) -> Verdict {
        let messages = [
            ChatMessage::system(prompts::illuminator_system(self.benchmark)),
            ChatMessage::user(prompts::illuminator_message(candidate, top)),
        ];
        match self
            .gateway
            .structured_chat(&messages, &Self::schema(), &self.model, 0.0)
            .await
        {
            Ok(reply) => {
                let decision = text_field(&reply, "decision");
                if decision.trim_start().to_ascii_uppercase().starts_with('Y') {
                    Verdict::Admitted
                } else {
                    Verdict::Rejected
                }
            }
            Err(e) => {
                warn!(system_id = %candidate.id, error = %e, "illuminator call failed, rejecting");
                Verdict::Rejected
            }
        }
    }

    /// Decide one candidate and record the outcome on its status.
    pub async fn illuminate(&self, store: &dyn EntityStore, candidate: &System) -> EvolveResult<Verdict> {
        let top = self.top_members(store, candidate).await?;
        let verdict = if top.len() <= 1 {
            debug!(system_id = %candidate.id, "sparse cluster, admitting");
            Verdict::Admitted
        } else {
            self.judge(candidate, &top).await
        };
        let (status, label) = match verdict {
            Verdict::Admitted => (SystemStatus::Admitted, "admitted"),
            Verdict::Rejected => (SystemStatus::Rejected, "rejected"),
        };
        store
            .update_system(
                candidate.id,
                SystemUpdate::new()
                    .status(status)
                    .property("illuminator", json!({"verdict": label, "compared": top.len()})),
            )
            .await?;
        Ok(verdict)
    }

    /// Filter `candidates`, returning the admitted ones.
    pub async fn filter(
        &self,
        store: &dyn EntityStore,
        candidates: Vec<System>,
        concurrency: usize,
    ) -> Vec<System> {
        let total = candidates.len();
        let admitted: Vec<System> = stream::iter(candidates)
            .map(|candidate| async move {
                match self.illuminate(store, &candidate).await {
                    Ok(Verdict::Admitted) => Some(candidate),
                    Ok(Verdict::Rejected) => None,
                    Err(e) => {
                        warn!(system_id = %candidate.id, error = %e, "illumination failed, discarding");
                        None
                    }
                }
            })
            .buffer_unordered(concurrency.max(1))
            .filter_map(futures::future::ready)
            .collect()
            .await;
        info!(candidates = total, admitted = admitted.len(), "illumination done");
        admitted
    }
}
