//! The production [`AgentRunner`]: selects a provider (or the CLI
//! fallback), assembles the cache-segmented prompt, applies the deadline,
//! and writes the audit trail.
//!
//! Audit writes and retrieval are best-effort: their failures are logged
//! and never abort the invocation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::cli::{CliAgent, detect_verdict};
use crate::agent::prompt::{self, PromptInputs};
use crate::agent::provider::{ChatMessage, ChatRequest, ModelTier, Provider, ProviderFactory};
use crate::agent::{AgentInvocation, AgentOutcome, AgentRunner, Purpose};
use crate::board::models::{AgentRole, AuditEventType, Domain};
use crate::board::store::{StoreHandle, truncate_audit_text};
use crate::errors::ProviderError;
use crate::rag::retrieve::Retriever;

/// Role templates, shared rules, and per-domain expert knowledge loaded
/// from the prompt directory, with built-in minimal fallbacks.
pub struct PromptLibrary {
    dir: Option<PathBuf>,
    cache: std::sync::Mutex<HashMap<String, String>>,
}

impl PromptLibrary {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            cache: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn read_cached(&self, relative: &str) -> Option<String> {
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(relative)
        {
            return Some(hit.clone());
        }
        let dir = self.dir.as_ref()?;
        let content = std::fs::read_to_string(dir.join(relative)).ok()?;
        self.cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(relative.to_string(), content.clone());
        Some(content)
    }

    pub fn role_template(&self, role: AgentRole) -> String {
        self.read_cached(&format!("{}.md", role.as_str()))
            .unwrap_or_else(|| {
                format!(
                    "You are the {} agent in an autonomous development pipeline.\n\
                     Work the ticket to your stage's standard and finish with a\n\
                     <promise> tag, or report {{\"status\": \"failed\"}} with details.\n\n\
                     ## Current Ticket\n{{{{.TicketJSON}}}}",
                    role.as_str()
                )
            })
    }

    pub fn shared_rules(&self) -> String {
        self.read_cached("shared_rules.md").unwrap_or_else(|| {
            "Shared rules: stay within the ticket's file patterns, commit \
             incrementally, and never push directly to trunk."
                .to_string()
        })
    }

    pub fn expert_knowledge(&self, domain: Domain) -> String {
        self.read_cached(&format!("experts/{}.md", domain.as_str()))
            .unwrap_or_default()
    }
}

pub struct AgentInvoker {
    store: StoreHandle,
    factory: Arc<ProviderFactory>,
    retriever: Option<Arc<Retriever>>,
    library: PromptLibrary,
    agent_timeout: Duration,
    enable_audit: bool,
    global_model: Option<String>,
    cli_command: Option<String>,
}

impl AgentInvoker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StoreHandle,
        factory: Arc<ProviderFactory>,
        retriever: Option<Arc<Retriever>>,
        library: PromptLibrary,
        agent_timeout: Duration,
        enable_audit: bool,
        global_model: Option<String>,
        cli_command: Option<String>,
    ) -> Self {
        Self {
            store,
            factory,
            retriever,
            library,
            agent_timeout,
            enable_audit,
            global_model,
            cli_command,
        }
    }

    fn tier_for(&self, role: AgentRole, purpose: &Purpose) -> ModelTier {
        if matches!(purpose, Purpose::Summarise) || role == AgentRole::Ideas {
            ModelTier::Cheap
        } else {
            ModelTier::Mid
        }
    }

    /// Provider and model for this invocation. Stored per-role config wins,
    /// then the global model override, then the tier default.
    async fn select_model(
        &self,
        role: AgentRole,
        purpose: &Purpose,
    ) -> Option<(Arc<dyn Provider>, String, Option<String>)> {
        let role_config = self
            .store
            .call(move |s| s.get_role_config(role))
            .await
            .ok()
            .flatten();
        if let Some(config) = role_config
            && let Ok(provider) = self.factory.get(&config.provider)
            && provider.is_available()
        {
            return Some((provider, config.model, config.system_prompt));
        }
        let provider = self.factory.preferred()?;
        let model = self
            .global_model
            .clone()
            .unwrap_or_else(|| {
                crate::agent::provider::default_model(
                    provider.name(),
                    self.tier_for(role, purpose),
                )
                .to_string()
            });
        Some((provider, model, None))
    }

    async fn audit(
        &self,
        invocation_run: Uuid,
        ticket_id: &str,
        role: AgentRole,
        event_type: AuditEventType,
        event_data: serde_json::Value,
        tokens_in: u64,
        tokens_out: u64,
        duration_ms: u64,
    ) {
        if !self.enable_audit {
            return;
        }
        let ticket_id = ticket_id.to_string();
        let result = self
            .store
            .call(move |s| {
                s.append_audit(
                    invocation_run,
                    &ticket_id,
                    role,
                    event_type,
                    &event_data,
                    tokens_in as i64,
                    tokens_out as i64,
                    duration_ms as i64,
                )
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "audit write failed, continuing");
        }
    }

    async fn knowledge_for(&self, invocation: &AgentInvocation<'_>) -> String {
        if let Some(retriever) = &self.retriever {
            match retriever.retrieve(invocation.ticket).await {
                Ok(context) if !context.chunks.is_empty() => return context.rendered(),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "retrieval failed, falling back to expert knowledge");
                }
            }
        }
        self.library.expert_knowledge(invocation.ticket.domain)
    }

    fn build_request(
        &self,
        invocation: &AgentInvocation<'_>,
        model: &str,
        custom_system: Option<&str>,
        knowledge: &str,
    ) -> (ChatRequest, String) {
        let template = custom_system
            .map(String::from)
            .unwrap_or_else(|| self.library.role_template(invocation.role));
        let shared_rules = self.library.shared_rules();
        let assembled = prompt::assemble(&PromptInputs {
            role_template: &template,
            shared_rules: &shared_rules,
            knowledge,
            ticket: invocation.ticket,
            role: invocation.role,
            round_summary: if invocation.extra_context.is_empty() {
                None
            } else {
                Some(invocation.extra_context.as_str())
            },
        });

        let mut request = ChatRequest::new(model);
        request.system = assembled.system.clone();
        request
            .messages
            .push(ChatMessage::user(assembled.user_message.clone()));
        let rendered = assembled.rendered();
        (request, rendered)
    }

    async fn with_deadline<T>(
        &self,
        cancel: &CancellationToken,
        fut: impl std::future::Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            result = tokio::time::timeout(self.agent_timeout, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(ProviderError::Timeout {
                    seconds: self.agent_timeout.as_secs(),
                }),
            },
        }
    }

    async fn run_api(
        &self,
        invocation: &AgentInvocation<'_>,
        provider: Arc<dyn Provider>,
        model: String,
        custom_system: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, ProviderError> {
        let knowledge = self.knowledge_for(invocation).await;
        let (request, rendered) =
            self.build_request(invocation, &model, custom_system.as_deref(), &knowledge);

        self.audit(
            invocation.run_id,
            &invocation.ticket.id,
            invocation.role,
            AuditEventType::PromptSent,
            json!({
                "provider": provider.name(),
                "model": model,
                "prompt": truncate_audit_text(&rendered),
            }),
            0,
            0,
            0,
        )
        .await;

        let start = Instant::now();
        let result = self
            .with_deadline(cancel, provider.create_message(&request))
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                self.audit(
                    invocation.run_id,
                    &invocation.ticket.id,
                    invocation.role,
                    AuditEventType::ResponseReceived,
                    json!({
                        "model": response.model,
                        "stop_reason": response.stop_reason,
                        "text": truncate_audit_text(&response.text),
                    }),
                    response.tokens_in,
                    response.tokens_out,
                    duration_ms,
                )
                .await;
                Ok(AgentOutcome {
                    verdict: detect_verdict(&response.text),
                    output: response.text,
                    tokens_in: response.tokens_in,
                    tokens_out: response.tokens_out,
                })
            }
            Err(e) => {
                self.audit(
                    invocation.run_id,
                    &invocation.ticket.id,
                    invocation.role,
                    AuditEventType::Error,
                    json!({"error": e.to_string()}),
                    0,
                    0,
                    duration_ms,
                )
                .await;
                Err(e)
            }
        }
    }

    async fn run_cli(
        &self,
        invocation: &AgentInvocation<'_>,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, ProviderError> {
        let knowledge = self.library.expert_knowledge(invocation.ticket.domain);
        let (_, rendered) = self.build_request(invocation, "cli", None, &knowledge);
        let working_dir = invocation
            .workspace
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        self.audit(
            invocation.run_id,
            &invocation.ticket.id,
            invocation.role,
            AuditEventType::PromptSent,
            json!({
                "provider": "cli",
                "prompt": truncate_audit_text(&rendered),
            }),
            0,
            0,
            0,
        )
        .await;

        let agent = CliAgent::new(self.cli_command.as_deref());
        let start = Instant::now();
        let result = self
            .with_deadline(cancel, run_cli_once(&agent, &rendered, &working_dir))
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(outcome) => {
                self.audit(
                    invocation.run_id,
                    &invocation.ticket.id,
                    invocation.role,
                    AuditEventType::ResponseReceived,
                    json!({"text": truncate_audit_text(&outcome.output)}),
                    0,
                    0,
                    duration_ms,
                )
                .await;
                Ok(AgentOutcome {
                    output: outcome.output,
                    verdict: outcome.verdict,
                    tokens_in: 0,
                    tokens_out: 0,
                })
            }
            Err(e) => {
                self.audit(
                    invocation.run_id,
                    &invocation.ticket.id,
                    invocation.role,
                    AuditEventType::Error,
                    json!({"error": e.to_string()}),
                    0,
                    0,
                    duration_ms,
                )
                .await;
                Err(e)
            }
        }
    }
}

async fn run_cli_once(
    agent: &CliAgent,
    prompt: &str,
    working_dir: &Path,
) -> Result<crate::agent::cli::CliOutcome, ProviderError> {
    agent.run(prompt, working_dir).await
}

#[async_trait]
impl AgentRunner for AgentInvoker {
    async fn invoke(
        &self,
        invocation: AgentInvocation<'_>,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, ProviderError> {
        match self.select_model(invocation.role, &invocation.purpose).await {
            Some((provider, model, custom_system)) => {
                tracing::debug!(
                    ticket = %invocation.ticket.id,
                    role = %invocation.role,
                    provider = provider.name(),
                    model = %model,
                    "invoking agent via API"
                );
                self.run_api(&invocation, provider, model, custom_system, cancel)
                    .await
            }
            None => {
                tracing::debug!(
                    ticket = %invocation.ticket.id,
                    role = %invocation.role,
                    "no provider credentials, using CLI fallback"
                );
                self.run_cli(&invocation, cancel).await
            }
        }
    }
}
