use crate::GatewayResult;
use async_trait::async_trait;
use breeder_types::ChatMessage;

/// One chat completion request as seen by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    /// Ask the provider to constrain output to a JSON object.
    pub json_mode: bool,
}

impl ChatRequest {
    /// Concatenated content of all messages, handy for routing in tests.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == breeder_types::Role::User)
            .map(|m| m.content.as_str())
    }
}

/// Provider transport for chat completions. Returns raw reply text.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> GatewayResult<String>;
}

/// Provider transport for text embeddings.
#[async_trait]
pub trait EmbeddingTransport: Send + Sync {
    async fn embed(&self, text: &str, dimensions: usize) -> GatewayResult<Vec<f32>>;
}
