//! Breeder chat/embedding gateway.
//!
//! Every LLM interaction in the discovery loop goes through [`Gateway`]:
//! - `structured_chat` sends role-tagged messages and returns a JSON object
//!   whose keys are exactly the requested schema keys
//! - `embed` returns a fixed-length numeric vector
//!
//! Transports are pluggable. [`OpenAiTransport`] talks to an OpenAI-compatible
//! HTTP API; the scripted transports make every caller testable offline.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
mod gateway;
pub mod openai;
pub mod schema;
pub mod scripted;
mod transport;

pub use breeder_types::{ChatMessage, Role};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{Gateway, RetryPolicy};
pub use openai::{OpenAiConfig, OpenAiTransport};
pub use schema::{text_field, ResponseSchema, StructuredReply};
pub use scripted::{FailingChatTransport, HashEmbeddingTransport, ScriptedChatTransport};
pub use transport::{ChatRequest, ChatTransport, EmbeddingTransport};
