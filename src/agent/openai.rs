//! OpenAI Chat Completions provider. The system blocks collapse into one
//! system message; prompt caching is implicit on this path.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::agent::provider::{
    ChatRequest, ChatResponse, MessageRole, Provider, ProviderUsage, UsageCounter,
};
use crate::errors::ProviderError;

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Environment variable holding the API key.
pub const ENV_KEY: &str = "OPENAI_API_KEY";

pub struct OpenAiProvider {
    api_key: Option<String>,
    client: reqwest::Client,
    usage: UsageCounter,
}

impl OpenAiProvider {
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

    pub fn build_body(request: &ChatRequest) -> Value {
        let mut messages = Vec::new();
        let system = request.system_concatenated();
        if !system.is_empty() {
            messages.push(json!({"role": "system", "content": system}));
        }
        for m in &request.messages {
            messages.push(json!({
                "role": match m.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                },
                "content": m.content,
            }));
        }
        let mut body = json!({
            "model": request.model,
            "max_completion_tokens": request.max_tokens,
            "messages": messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if !request.stop_sequences.is_empty() {
            body["stop"] = json!(request.stop_sequences);
        }
        body
    }

    pub fn parse_response(value: &Value) -> Result<ChatResponse, ProviderError> {
        let malformed = |message: &str| ProviderError::MalformedResponse {
            name: "openai".to_string(),
            message: message.to_string(),
        };
        let choice = value
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| malformed("missing choices"))?;
        let text = choice
            .pointer("/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| malformed("missing message content"))?
            .to_string();
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
            stop_reason: choice
                .get("finish_reason")
                .and_then(|v| v.as_str())
                .map(String::from),
            tokens_in: usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            tokens_out: usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            text,
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn create_message(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| ProviderError::NotAvailable {
            name: "openai".to_string(),
            reason: format!("{} not set", ENV_KEY),
        })?;
        let response = self
            .client
            .post(API_URL)
            .bearer_auth(api_key)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                name: "openai".to_string(),
                message: e.to_string(),
            })?;
        let status = response.status();
        let value: Value = response.json().await.map_err(|e| ProviderError::MalformedResponse {
            name: "openai".to_string(),
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(ProviderError::Request {
                name: "openai".to_string(),
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
