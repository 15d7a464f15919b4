//! Provider-neutral LLM backend interface.
//!
//! A [`Provider`] translates the normalised [`ChatRequest`] /
//! [`ChatResponse`] pair into one vendor's wire format. Conversation
//! bookkeeping, prompt assembly, and retrieval live elsewhere; providers
//! only move messages and count tokens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;

/// One system block. Leading cacheable blocks participate in provider-side
/// prompt caching where the vendor supports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
    pub cacheable: bool,
}

impl SystemBlock {
    pub fn cached(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cacheable: true,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cacheable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: Vec<SystemBlock>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 8192,
            system: Vec::new(),
            messages: Vec::new(),
            temperature: None,
            stop_sequences: Vec::new(),
        }
    }

    /// All system blocks concatenated, for vendors that take one string.
    pub fn system_concatenated(&self) -> String {
        self.system
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub text: String,
    pub model: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Cumulative token accounting per provider. Reads return copies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Mutex-protected usage counter shared by the provider implementations.
#[derive(Default)]
pub struct UsageCounter {
    inner: Mutex<ProviderUsage>,
}

impl UsageCounter {
    pub fn record(&self, tokens_in: u64, tokens_out: u64) {
        let mut usage = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        usage.requests += 1;
        usage.tokens_in += tokens_in;
        usage.tokens_out += tokens_out;
    }

    pub fn snapshot(&self) -> ProviderUsage {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner()) = ProviderUsage::default();
    }
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Credentials present and usable?
    fn is_available(&self) -> bool;

    async fn create_message(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    fn usage(&self) -> ProviderUsage;

    fn reset_usage(&self);
}

/// Model quality tiers used for per-role defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Cheapest tier: triage and summarisation work.
    Cheap,
    /// Default tier for development and review agents.
    Mid,
}

/// Per-provider default model for a tier.
pub fn default_model(provider: &str, tier: ModelTier) -> &'static str {
    match (provider, tier) {
        ("anthropic", ModelTier::Cheap) => "claude-3-5-haiku-latest",
        ("anthropic", ModelTier::Mid) => "claude-sonnet-4-0",
        ("openai", ModelTier::Cheap) => "gpt-4.1-nano",
        ("openai", ModelTier::Mid) => "gpt-4.1",
        ("google", ModelTier::Cheap) => "gemini-2.0-flash-lite",
        ("google", ModelTier::Mid) => "gemini-2.0-flash",
        (_, ModelTier::Cheap) => "claude-3-5-haiku-latest",
        (_, ModelTier::Mid) => "claude-sonnet-4-0",
    }
}

/// Process-scoped provider cache keyed by name. Instances are created on
/// first request and shared afterwards.
pub struct ProviderFactory {
    cache: Mutex<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderFactory {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(provider) = cache.get(name) {
            return Ok(Arc::clone(provider));
        }
        let provider: Arc<dyn Provider> = match name {
            "anthropic" => Arc::new(crate::agent::anthropic::AnthropicProvider::from_env()),
            "openai" => Arc::new(crate::agent::openai::OpenAiProvider::from_env()),
            "google" => Arc::new(crate::agent::gemini::GeminiProvider::from_env()),
            other => {
                return Err(ProviderError::NotAvailable {
                    name: other.to_string(),
                    reason: "unknown provider".to_string(),
                });
            }
        };
        cache.insert(name.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    /// Providers whose credentials are present, in preference order.
    pub fn available(&self) -> Vec<String> {
        ["anthropic", "openai", "google"]
            .iter()
            .filter_map(|name| match self.get(name) {
                Ok(p) if p.is_available() => Some(name.to_string()),
                _ => None,
            })
            .collect()
    }

    /// First available provider, if any credential is configured.
    pub fn preferred(&self) -> Option<Arc<dyn Provider>> {
        self.available()
            .first()
            .and_then(|name| self.get(name).ok())
    }
}

impl Default for ProviderFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_counter_accumulates_and_resets() {
        let counter = UsageCounter::default();
        counter.record(100, 20);
        counter.record(50, 10);
        let usage = counter.snapshot();
        assert_eq!(usage.requests, 2);
        assert_eq!(usage.tokens_in, 150);
        assert_eq!(usage.tokens_out, 30);
        counter.reset();
        assert_eq!(counter.snapshot(), ProviderUsage::default());
    }

    #[test]
    fn system_concatenation_joins_blocks_in_order() {
        let mut request = ChatRequest::new("m");
        request.system.push(SystemBlock::cached("role instructions"));
        request.system.push(SystemBlock::plain("ticket context"));
        assert_eq!(
            request.system_concatenated(),
            "role instructions\n\nticket context"
        );
    }

    #[test]
    fn factory_caches_instances_by_name() {
        let factory = ProviderFactory::new();
        let a = factory.get("anthropic").unwrap();
        let b = factory.get("anthropic").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        let factory = ProviderFactory::new();
        let err = factory.get("bedrock").unwrap_err();
        assert!(matches!(err, ProviderError::NotAvailable { .. }));
    }

    #[test]
    fn tier_defaults_pin_ideas_to_cheapest() {
        assert_eq!(
            default_model("anthropic", ModelTier::Cheap),
            "claude-3-5-haiku-latest"
        );
        assert_eq!(default_model("openai", ModelTier::Mid), "gpt-4.1");
        assert_eq!(
            default_model("google", ModelTier::Cheap),
            "gemini-2.0-flash-lite"
        );
    }
}
