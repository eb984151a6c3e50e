//! JSON-lines protocol between a running candidate and the host.
//!
//! The candidate writes one message per line on its stdout. Calls carry an
//! `id` and get exactly one reply line on its stdin with the same id. `done`
//! and `failed` end the run and get no reply.

use breeder_gateway::{Gateway, ResponseSchema};
use breeder_store::InteractionStore;
use breeder_types::{AgentId, MeetingId, SystemId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn default_temperature() -> f64 {
    0.5
}

/// Message sent by the candidate side.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CandidateMessage {
    AgentNew {
        id: u64,
        name: String,
        #[serde(default = "default_temperature")]
        temperature: f64,
    },
    MeetingNew {
        id: u64,
        name: String,
    },
    MeetingAddAgent {
        id: u64,
        meeting_id: MeetingId,
        agent_id: AgentId,
    },
    ChatNew {
        id: u64,
        meeting_id: MeetingId,
        speaker_id: AgentId,
        content: String,
    },
    AgentHistory {
        id: u64,
        agent_id: AgentId,
    },
    AgentForward {
        id: u64,
        agent_id: AgentId,
        response_format: Map<String, Value>,
        #[serde(default)]
        meeting_id: Option<MeetingId>,
    },
    Done {
        answer: Value,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

impl CandidateMessage {
    /// Calls that may wait on the LLM and so run concurrently with others.
    pub fn is_slow(&self) -> bool {
        matches!(self, CandidateMessage::AgentForward { .. })
    }
}

/// Why the candidate side gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The entry point raised.
    Error,
    /// The entry point returned something other than a string.
    Shape,
    /// The source did not define a usable entry point.
    Load,
}

/// Reply line written back to the candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeReply {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeReply {
    fn from_result(id: u64, result: Result<Value, String>) -> Self {
        match result {
            Ok(value) => Self {
                id,
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(error) => Self {
                id,
                ok: false,
                result: None,
                error: Some(error),
            },
        }
    }
}

/// Host side of one candidate run. Sessions never cross candidates.
pub struct BridgeSession {
    system_id: SystemId,
    store: Arc<dyn InteractionStore>,
    gateway: Gateway,
    model: String,
}

impl BridgeSession {
    /// Session recording calls of `system_id` in `store`.
    pub fn new(
        system_id: SystemId,
        store: Arc<dyn InteractionStore>,
        gateway: Gateway,
        model: impl Into<String>,
    ) -> Self {
        Self {
            system_id,
            store,
            gateway,
            model: model.into(),
        }
    }

    /// Answer one call. Terminal messages are not calls and yield `None`.
    pub async fn handle(&self, message: CandidateMessage) -> Option<BridgeReply> {
        let (id, result) = match message {
            CandidateMessage::AgentNew {
                id,
                name,
                temperature,
            } => (id, self.agent_new(&name, temperature).await),
            CandidateMessage::MeetingNew { id, name } => (id, self.meeting_new(&name).await),
            CandidateMessage::MeetingAddAgent {
                id,
                meeting_id,
                agent_id,
            } => (
                id,
                self.store
                    .add_agent_to_meeting(meeting_id, agent_id)
                    .await
                    .map(|_| json!({}))
                    .map_err(|e| e.to_string()),
            ),
            CandidateMessage::ChatNew {
                id,
                meeting_id,
                speaker_id,
                content,
            } => (
                id,
                self.store
                    .append_chat(meeting_id, speaker_id, &content)
                    .await
                    .map(|chat| json!({ "chat_id": chat.id }))
                    .map_err(|e| e.to_string()),
            ),
            CandidateMessage::AgentHistory { id, agent_id } => (
                id,
                self.store
                    .agent_history(agent_id)
                    .await
                    .map(|history| json!({ "history": history }))
                    .map_err(|e| e.to_string()),
            ),
            CandidateMessage::AgentForward {
                id,
                agent_id,
                response_format,
                meeting_id,
            } => (
                id,
                self.agent_forward(agent_id, &response_format, meeting_id)
                    .await,
            ),
            CandidateMessage::Done { .. } | CandidateMessage::Failed { .. } => return None,
        };
        Some(BridgeReply::from_result(id, result))
    }

    async fn agent_new(&self, name: &str, temperature: f64) -> Result<Value, String> {
        if !temperature.is_finite() || !(0.0..=2.0).contains(&temperature) {
            return Err(format!("temperature {temperature} outside [0, 2]"));
        }
        let agent = self
            .store
            .create_agent(self.system_id, name, temperature)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "agent_id": agent.id }))
    }

    async fn meeting_new(&self, name: &str) -> Result<Value, String> {
        let meeting = self
            .store
            .create_meeting(self.system_id, name)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "meeting_id": meeting.id }))
    }

    /// Ask the LLM as `agent_id`, seeing the agent's own chat history.
    ///
    /// With a meeting, the reply is recorded there as the agent's chat.
    async fn agent_forward(
        &self,
        agent_id: AgentId,
        response_format: &Map<String, Value>,
        meeting_id: Option<MeetingId>,
    ) -> Result<Value, String> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("agent {agent_id} not found"))?;
        if response_format.is_empty() {
            return Err("response_format must name at least one field".to_string());
        }
        let history = self
            .store
            .agent_history(agent_id)
            .await
            .map_err(|e| e.to_string())?;
        let schema = ResponseSchema::from_object(response_format);
        let reply = self
            .gateway
            .structured_chat(&history, &schema, &self.model, agent.temperature)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(meeting_id) = meeting_id {
            let content = Value::Object(reply.clone()).to_string();
            self.store
                .append_chat(meeting_id, agent_id, &content)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(json!({ "reply": reply }))
    }
}
