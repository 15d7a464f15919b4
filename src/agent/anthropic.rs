//! Anthropic Messages API provider.
//!
//! The system prompt travels as an ordered block array; blocks flagged
//! cacheable carry `cache_control: ephemeral` so the static prefix joins
//! provider-side prompt caching.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::agent::provider::{
    ChatRequest, ChatResponse, MessageRole, Provider, ProviderUsage, UsageCounter,
};
use crate::errors::ProviderError;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Environment variable holding the API key.
pub const ENV_KEY: &str = "ANTHROPIC_API_KEY";

pub struct AnthropicProvider {
    api_key: Option<String>,
    client: reqwest::Client,
    usage: UsageCounter,
}

impl AnthropicProvider {
    pub fn from_env() -> Self {
        Self::with_key(std::env::var(ENV_KEY).ok())
    }

    pub fn with_key(api_key: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            usage: UsageCounter::default(),
        }
    }

    /// Request body in the Messages API shape.
    pub fn build_body(request: &ChatRequest) -> Value {
        let system: Vec<Value> = request
            .system
            .iter()
            .map(|block| {
                let mut entry = json!({"type": "text", "text": block.text});
                if block.cacheable {
                    entry["cache_control"] = json!({"type": "ephemeral"});
                }
                entry
            })
            .collect();
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        MessageRole::User => "user",
                        MessageRole::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "system": system,
            "messages": messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if !request.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(request.stop_sequences);
        }
        body
    }

    pub fn parse_response(value: &Value) -> Result<ChatResponse, ProviderError> {
        let malformed = |message: &str| ProviderError::MalformedResponse {
            name: "anthropic".to_string(),
            message: message.to_string(),
        };
        let text = value
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| malformed("missing content array"))?;
        let usage = value.get("usage").cloned().unwrap_or_else(|| json!({}));
        Ok(ChatResponse {
            id: value
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            model: value
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            stop_reason: value
                .get("stop_reason")
                .and_then(|v| v.as_str())
                .map(String::from),
            tokens_in: usage
                .get("input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            tokens_out: usage
                .get("output_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            text,
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn create_message(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| ProviderError::NotAvailable {
            name: "anthropic".to_string(),
            reason: format!("{} not set", ENV_KEY),
        })?;
        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                name: "anthropic".to_string(),
                message: e.to_string(),
            })?;
        let status = response.status();
        let value: Value = response.json().await.map_err(|e| ProviderError::MalformedResponse {
            name: "anthropic".to_string(),
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(ProviderError::Request {
                name: "anthropic".to_string(),
                message: format!("HTTP {}: {}", status, value),
            });
        }
        let parsed = Self::parse_response(&value)?;
        self.usage.record(parsed.tokens_in, parsed.tokens_out);
        Ok(parsed)
    }

    fn usage(&self) -> ProviderUsage {
        self.usage.snapshot()
    }

    fn reset_usage(&self) {
        self.usage.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::provider::{ChatMessage, SystemBlock};

    #[test]
    fn missing_key_means_unavailable() {
        let provider = AnthropicProvider::with_key(None);
        assert!(!provider.is_available());
    }

    #[tokio::test]
    async fn create_message_without_key_is_typed_error() {
        let provider = AnthropicProvider::with_key(None);
        let err = provider
            .create_message(&ChatRequest::new("claude-sonnet-4-0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotAvailable { .. }));
    }

    #[test]
    fn cacheable_blocks_carry_ephemeral_cache_control() {
        let mut request = ChatRequest::new("claude-sonnet-4-0");
        request.system.push(SystemBlock::cached("static prefix"));
        request.system.push(SystemBlock::plain("dynamic suffix"));
        request.messages.push(ChatMessage::user("go"));
        let body = AnthropicProvider::build_body(&request);
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert!(body["system"][1].get("cache_control").is_none());
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn stop_sequences_and_temperature_only_when_set() {
        let mut request = ChatRequest::new("claude-sonnet-4-0");
        let body = AnthropicProvider::build_body(&request);
        assert!(body.get("temperature").is_none());
        assert!(body.get("stop_sequences").is_none());

        request.temperature = Some(0.2);
        request.stop_sequences.push("</promise>".to_string());
        let body = AnthropicProvider::build_body(&request);
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["stop_sequences"][0], "</promise>");
    }

    #[test]
    fn response_parsing_joins_text_blocks_and_reads_usage() {
        let value = serde_json::json!({
            "id": "msg_01",
            "model": "claude-sonnet-4-0",
            "stop_reason": "end_turn",
            "content": [
                {"type": "text", "text": "part one "},
                {"type": "text", "text": "part two"},
            ],
            "usage": {"input_tokens": 1200, "output_tokens": 96},
        });
        let parsed = AnthropicProvider::parse_response(&value).unwrap();
        assert_eq!(parsed.text, "part one part two");
        assert_eq!(parsed.tokens_in, 1200);
        assert_eq!(parsed.tokens_out, 96);
        assert_eq!(parsed.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn response_without_content_is_malformed() {
        let value = serde_json::json!({"id": "msg_02"});
        let err = AnthropicProvider::parse_response(&value).unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse { .. }));
    }
}
