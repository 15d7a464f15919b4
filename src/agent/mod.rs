//! Agent invocation layer: provider-neutral LLM backends, cache-aware
//! prompt assembly, the CLI fallback, and the invoker that ties them to
//! the board's audit log.

pub mod anthropic;
pub mod cli;
pub mod gemini;
pub mod invoker;
pub mod openai;
pub mod prompt;
pub mod provider;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::cli::OutputVerdict;
use crate::board::models::{AgentRole, Ticket};
use crate::errors::ProviderError;

/// Why an agent is being invoked. Drives prompt assembly and model tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Purpose {
    /// Execute the ticket's current pipeline stage.
    Stage,
    /// Contribute to one PRD refinement round.
    Refine { round: u32 },
    /// Facilitator synthesis of a refinement round.
    Synthesis { round: u32 },
    /// Split a completed PRD into child tickets.
    Breakdown,
    /// Final PM verification before merge submission.
    PmVerify,
    /// Cheap-tier compression of prior refinement rounds.
    Summarise,
}

/// One agent invocation request.
pub struct AgentInvocation<'a> {
    pub run_id: Uuid,
    pub ticket: &'a Ticket,
    pub role: AgentRole,
    pub purpose: Purpose,
    pub workspace: Option<PathBuf>,
    /// Purpose-specific dynamic context (round transcript, bug list, ...).
    pub extra_context: String,
}

/// Result of a completed invocation.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub output: String,
    pub verdict: OutputVerdict,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Abstraction over agent execution so the scheduler can run against a
/// scripted double in tests.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn invoke(
        &self,
        invocation: AgentInvocation<'_>,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, ProviderError>;
}
