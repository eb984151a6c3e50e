use crate::schema::{ResponseSchema, StructuredReply};
use crate::transport::{ChatRequest, ChatTransport, EmbeddingTransport};
use crate::{GatewayError, GatewayResult};
use breeder_types::{ChatMessage, Role};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded exponential backoff for transient provider errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never sleeps, for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (0-based), honouring a provider hint.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_delay_ms);
        let jitter = if exp > 0 {
            rand::thread_rng().gen_range(0..=exp / 4)
        } else {
            0
        };
        let backoff = Duration::from_millis(exp + jitter);
        match hint {
            Some(hint) => backoff.max(hint.min(Duration::from_millis(self.max_delay_ms))),
            None => backoff,
        }
    }
}

/// Shared entry point for every chat and embedding call.
#[derive(Clone)]
pub struct Gateway {
    chat: Arc<dyn ChatTransport>,
    embedder: Arc<dyn EmbeddingTransport>,
    policy: RetryPolicy,
}

impl Gateway {
    /// Every call through the gateway is retried under `policy`.
    pub fn new(
        chat: Arc<dyn ChatTransport>,
        embedder: Arc<dyn EmbeddingTransport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            chat,
            embedder,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `messages` and return a reply with exactly the keys of `schema`.
    ///
    /// Transient failures are retried with backoff. A malformed reply gets one
    /// follow-up turn asking for strict JSON; a second malformed reply fails.
    pub async fn structured_chat(
        &self,
        messages: &[ChatMessage],
        schema: &ResponseSchema,
        model: &str,
        temperature: f64,
    ) -> GatewayResult<StructuredReply> {
        let mut request = ChatRequest {
            model: model.to_string(),
            messages: with_format_instruction(messages, schema),
            temperature,
            json_mode: true,
        };

        let raw = self.complete_with_retry(&request).await?;
        match schema.parse(&raw) {
            Ok(reply) => Ok(reply),
            Err(GatewayError::MalformedResponse(reason)) => {
                debug!(%model, %reason, "malformed reply, re-prompting for strict JSON");
                request.messages.push(ChatMessage::assistant(raw));
                request
                    .messages
                    .push(ChatMessage::user(schema.repair_prompt(&reason)));
                let raw = self.complete_with_retry(&request).await?;
                schema.parse(&raw)
            }
            Err(other) => Err(other),
        }
    }

    /// Embed `text` into a vector of `dimensions` floats.
    pub async fn embed(&self, text: &str, dimensions: usize) -> GatewayResult<Vec<f32>> {
        let mut attempt = 0;
        loop {
            match self.embedder.embed(text, dimensions).await {
                Ok(vector) => return Ok(vector),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    self.back_off(attempt, &e).await;
                    attempt += 1;
                }
                Err(GatewayError::RateLimited { .. }) => {
                    return Err(GatewayError::Upstream(
                        "embedding provider kept rate limiting".into(),
                    ))
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn complete_with_retry(&self, request: &ChatRequest) -> GatewayResult<String> {
        let mut attempt = 0;
        loop {
            match self.chat.complete(request).await {
                Ok(raw) => return Ok(raw),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    self.back_off(attempt, &e).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(model = %request.model, error = %e, attempts = attempt + 1, "giving up after retries");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn back_off(&self, attempt: u32, error: &GatewayError) {
        let hint = match error {
            GatewayError::RateLimited { retry_after } => *retry_after,
            _ => None,
        };
        let delay = self.policy.delay(attempt, hint);
        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying gateway call");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Attach the reply-format instruction to the leading system message,
/// or prepend one when the conversation has none.
fn with_format_instruction(messages: &[ChatMessage], schema: &ResponseSchema) -> Vec<ChatMessage> {
    let mut out = messages.to_vec();
    let instruction = schema.instruction();
    match out.first_mut() {
        Some(first) if first.role == Role::System => {
            first.content = format!("{}\n\n{}", first.content, instruction);
        }
        _ => out.insert(0, ChatMessage::system(instruction)),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{FailingChatTransport, HashEmbeddingTransport, ScriptedChatTransport};

    fn gateway(chat: Arc<dyn ChatTransport>) -> Gateway {
        Gateway::new(
            chat,
            Arc::new(HashEmbeddingTransport::new()),
            RetryPolicy::immediate(3),
        )
    }

    fn schema() -> ResponseSchema {
        ResponseSchema::new().field("answer", "Your answer")
    }

    #[tokio::test]
    async fn returns_schema_keys() {
        let chat = Arc::new(ScriptedChatTransport::from_replies(vec![
            r#"{"answer": "A", "extra": true}"#.to_string(),
        ]));
        let reply = gateway(chat.clone())
            .structured_chat(&[ChatMessage::user("q")], &schema(), "m", 0.5)
            .await
            .unwrap();
        assert_eq!(reply.len(), 1);
        assert_eq!(reply["answer"], "A");

        let requests = chat.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages[0].role, Role::System);
        assert!(requests[0].json_mode);
        assert_eq!(requests[0].temperature, 0.5);
    }

    #[tokio::test]
    async fn malformed_reply_is_reprompted_once() {
        let chat = Arc::new(ScriptedChatTransport::from_replies(vec![
            "I think the answer is A".to_string(),
            r#"{"answer": "A"}"#.to_string(),
        ]));
        let reply = gateway(chat.clone())
            .structured_chat(
                &[ChatMessage::system("be brief"), ChatMessage::user("q")],
                &schema(),
                "m",
                0.0,
            )
            .await
            .unwrap();
        assert_eq!(reply["answer"], "A");

        let requests = chat.requests();
        assert_eq!(requests.len(), 2);
        let second = &requests[1].messages;
        assert_eq!(second[second.len() - 2].role, Role::Assistant);
        assert!(second[second.len() - 1].content.contains("answer"));
        assert!(second[0].content.starts_with("be brief"));
    }

    #[tokio::test]
    async fn second_malformed_reply_fails() {
        let chat = Arc::new(ScriptedChatTransport::from_replies(vec![
            "nope".to_string(),
            "still nope".to_string(),
        ]));
        let err = gateway(chat)
            .structured_chat(&[ChatMessage::user("q")], &schema(), "m", 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn rate_limits_are_retried_then_surface() {
        let chat = Arc::new(FailingChatTransport::new(GatewayError::RateLimited {
            retry_after: None,
        }));
        let err = gateway(chat.clone())
            .structured_chat(&[ChatMessage::user("q")], &schema(), "m", 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
        assert_eq!(chat.calls(), 4);
    }

    #[tokio::test]
    async fn rate_limit_then_success() {
        let chat = Arc::new(ScriptedChatTransport::new(|_: &ChatRequest| {
            Ok(r#"{"answer": "ok"}"#.to_string())
        }));
        chat.fail_next(GatewayError::RateLimited {
            retry_after: Some(Duration::ZERO),
        });
        let reply = gateway(chat.clone())
            .structured_chat(&[ChatMessage::user("q")], &schema(), "m", 0.0)
            .await
            .unwrap();
        assert_eq!(reply["answer"], "ok");
        assert_eq!(chat.requests().len(), 2);
    }

    #[tokio::test]
    async fn embed_is_deterministic() {
        let g = gateway(Arc::new(FailingChatTransport::new(GatewayError::Upstream(
            "unused".into(),
        ))));
        let a = g.embed("hello world", 16).await.unwrap();
        let b = g.embed("hello world", 16).await.unwrap();
        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
    }

    #[test]
    fn delay_is_bounded() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        for attempt in 0..10 {
            assert!(policy.delay(attempt, None) <= Duration::from_millis(1_250));
        }
        assert!(policy.delay(0, Some(Duration::from_millis(900))) >= Duration::from_millis(900));
        assert_eq!(RetryPolicy::immediate(1).delay(5, None), Duration::ZERO);
    }
}
