//! Breeder Types - the data model of the discovery engine
//!
//! A discovery run is a **Population**. Each pass of the evolutionary loop is a
//! **Generation**, which re-derives behavioural niches (**Clusters**) over the
//! population's **Systems** (candidate multi-agent programs).
//!
//! While a candidate runs it creates scratch records: **Meetings** hold ordered
//! **Chats** spoken by **Agents**. An agent's chat history is a read-only view
//! computed from those records, never a persisted cycle.
//!
//! ## Key Concepts
//!
//! - **ConfidenceInterval**: bootstrap `(lower, median, upper)` triple
//! - **SystemStatus**: `draft → embedded → clustered → admitted/rejected → validated`
//! - **MonotonicClock**: strictly increasing timestamps for chat ordering

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod ci;
pub mod clock;
pub mod entities;
pub mod ids;
pub mod interaction;

pub use ci::ConfidenceInterval;
pub use clock::MonotonicClock;
pub use entities::{
    capability_order, elite, Cluster, Generation, NewSystem, Population, System, SystemStatus,
    SystemUpdate,
};
pub use ids::{AgentId, ChatId, ClusterId, GenerationId, MeetingId, PopulationId, SystemId};
pub use interaction::{chat_history, Agent, Chat, ChatMessage, Meeting, Role, SYSTEM_SPEAKER};
