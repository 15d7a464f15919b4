//! Google Gemini provider. Assistant turns are rewritten as role `model`
//! per the generateContent wire format.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::agent::provider::{
    ChatRequest, ChatResponse, MessageRole, Provider, ProviderUsage, UsageCounter,
};
use crate::errors::ProviderError;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Environment variable holding the API key.
pub const ENV_KEY: &str = "GEMINI_API_KEY";

pub struct GeminiProvider {
    api_key: Option<String>,
    client: reqwest::Client,
    usage: UsageCounter,
}

impl GeminiProvider {
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
        let contents: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        MessageRole::User => "user",
                        MessageRole::Assistant => "model",
                    },
                    "parts": [{"text": m.content}],
                })
            })
            .collect();
        let mut generation_config = json!({"maxOutputTokens": request.max_tokens});
        if let Some(t) = request.temperature {
            generation_config["temperature"] = json!(t);
        }
        if !request.stop_sequences.is_empty() {
            generation_config["stopSequences"] = json!(request.stop_sequences);
        }
        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        let system = request.system_concatenated();
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        body
    }

    pub fn parse_response(value: &Value) -> Result<ChatResponse, ProviderError> {
        let malformed = |message: &str| ProviderError::MalformedResponse {
            name: "google".to_string(),
            message: message.to_string(),
        };
        let candidate = value
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| malformed("missing candidates"))?;
        let text = candidate
            .pointer("/content/parts")
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| malformed("missing content parts"))?;
        let usage = value
            .get("usageMetadata")
            .cloned()
            .unwrap_or_else(|| json!({}));
        Ok(ChatResponse {
            id: value
                .get("responseId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            model: value
                .get("modelVersion")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            stop_reason: candidate
                .get("finishReason")
                .and_then(|v| v.as_str())
                .map(String::from),
            tokens_in: usage
                .get("promptTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            tokens_out: usage
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            text,
        })
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "google"
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn create_message(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| ProviderError::NotAvailable {
            name: "google".to_string(),
            reason: format!("{} not set", ENV_KEY),
        })?;
        let url = format!("{}/{}:generateContent", API_BASE, request.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                name: "google".to_string(),
                message: e.to_string(),
            })?;
        let status = response.status();
        let value: Value = response.json().await.map_err(|e| ProviderError::MalformedResponse {
            name: "google".to_string(),
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(ProviderError::Request {
                name: "google".to_string(),
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
