//! OpenAI-compatible HTTP transport for chat completions and embeddings.

use crate::transport::{ChatRequest, ChatTransport, EmbeddingTransport};
use crate::{GatewayError, GatewayResult};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Connection settings for [`OpenAiTransport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub embedding_model: String,
    pub request_timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Chat and embedding transport for any OpenAI-compatible endpoint.
pub struct OpenAiTransport {
    client: Client,
    api_key: String,
    config: OpenAiConfig,
}

impl OpenAiTransport {
    /// Transport authenticating with `api_key`.
    ///
    /// Fails on an empty key or when the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>, config: OpenAiConfig) -> GatewayResult<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(GatewayError::InvalidConfig("empty api key".into()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| GatewayError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    /// Build from `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`.
    pub fn from_env(mut config: OpenAiConfig) -> GatewayResult<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| GatewayError::InvalidConfig("OPENAI_API_KEY is not set".into()))?;
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            if !base_url.trim().is_empty() {
                config.base_url = base_url;
            }
        }
        Self::new(api_key, config)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, payload: &Value) -> GatewayResult<Response> {
        let response = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("request failed: {e}")))?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> GatewayResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(GatewayError::RateLimited { retry_after });
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Upstream(format!(
        "status {}: {}",
        status,
        truncate(&body, 320)
    )))
}

#[async_trait]
impl ChatTransport for OpenAiTransport {
    async fn complete(&self, request: &ChatRequest) -> GatewayResult<String> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        let mut payload = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
        });
        if request.json_mode {
            payload["response_format"] = json!({ "type": "json_object" });
        }

        let body: OpenAiResponse = self
            .post("chat/completions", &payload)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("invalid chat response: {e}")))?;

        let choice = body
            .choices
            .first()
            .ok_or_else(|| GatewayError::MalformedResponse("response had no choices".into()))?;
        Ok(extract_text(&choice.message.content))
    }
}

#[async_trait]
impl EmbeddingTransport for OpenAiTransport {
    async fn embed(&self, text: &str, dimensions: usize) -> GatewayResult<Vec<f32>> {
        let payload = json!({
            "model": self.config.embedding_model,
            "input": text,
            "dimensions": dimensions,
        });
        let body: EmbeddingResponse = self
            .post("embeddings", &payload)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("invalid embedding response: {e}")))?;

        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| GatewayError::Upstream("embedding response had no data".into()))
    }
}

fn extract_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        let err = OpenAiTransport::new("  ", OpenAiConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let transport = OpenAiTransport::new(
            "sk-test",
            OpenAiConfig {
                base_url: "http://localhost:8080/v1/".into(),
                ..OpenAiConfig::default()
            },
        )
        .unwrap();
        assert_eq!(
            transport.endpoint("chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn extract_text_handles_part_arrays() {
        let content = json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]);
        assert_eq!(extract_text(&content), "a\nb");
        assert_eq!(extract_text(&json!("plain")), "plain");
        assert_eq!(extract_text(&Value::Null), "");
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
    }
}
