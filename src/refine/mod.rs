//! Multi-round PRD refinement engine.
//!
//! A facilitator opens each round, the designated experts answer with
//! structured JSON, and the facilitator synthesises. Consensus promotes
//! the ticket to PRD_COMPLETE; a raised user question or the round cap
//! parks it in AWAITING_USER. After PRD_COMPLETE the breakdown agent
//! splits the PRD into conflict-free child tickets.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::cli::OutputVerdict;
use crate::agent::prompt::render_prior_rounds;
use crate::agent::{AgentInvocation, AgentRunner, Purpose};
use crate::board::models::{
    AgentRole, ConversationRound, Domain, ExpertInput, PrdConversation, Ticket, TicketStatus,
};
use crate::board::store::StoreHandle;
use crate::conflict;
use crate::errors::SchedulerError;

/// Experts consulted in every refinement round.
const EXPERT_ROLES: [AgentRole; 4] = [
    AgentRole::DevBackend,
    AgentRole::Qa,
    AgentRole::Ux,
    AgentRole::Security,
];

/// Where a finished round leaves the ticket.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// All experts approve with no open questions.
    Consensus,
    /// The facilitator judged the ticket fully specified as-is; no PRD
    /// breakdown is needed and it can go straight to READY.
    ReadyDirect,
    /// The facilitator asked for a domain-expert consultation round.
    NeedsExpert,
    /// No consensus yet; the scheduler opens the next round.
    NextRound(u32),
    /// An expert or the facilitator needs the user.
    UserQuestion(String),
    /// Round cap hit without consensus.
    RoundCapReached,
}

/// Structured expert reply as emitted by the agents.
#[derive(Debug, Default, Deserialize)]
struct ExpertReply {
    #[serde(default)]
    response: String,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    concerns: Vec<String>,
    #[serde(default)]
    questions_for_others: Vec<String>,
    #[serde(default)]
    approves: bool,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    user_question: Option<String>,
}

/// Child ticket spec produced by the breakdown agent.
#[derive(Debug, Deserialize)]
struct ChildSpec {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
}

/// First JSON value embedded in agent output, object or array.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    for (open, close) in [('{', '}'), ('[', ']')] {
        let start = match text.find(open) {
            Some(start) => start,
            None => continue,
        };
        let end = match text.rfind(close) {
            Some(end) if end > start => end,
            _ => continue,
        };
        if let Ok(value) = serde_json::from_str(&text[start..=end]) {
            return Some(value);
        }
    }
    None
}

fn parse_expert_reply(expert: AgentRole, output: &str) -> ExpertInput {
    let reply: ExpertReply = extract_json(output)
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_else(|| ExpertReply {
            response: output.to_string(),
            ..Default::default()
        });
    ExpertInput {
        expert: expert.as_str().to_string(),
        response: if reply.response.is_empty() {
            output.to_string()
        } else {
            reply.response
        },
        key_points: reply.key_points,
        concerns: reply.concerns,
        questions_for_others: reply.questions_for_others,
        approves: reply.approves,
        reasoning: reply.reasoning,
    }
}

pub struct RefinementEngine {
    store: StoreHandle,
    runner: Arc<dyn AgentRunner>,
    max_rounds: u32,
}

impl RefinementEngine {
    pub fn new(store: StoreHandle, runner: Arc<dyn AgentRunner>, max_rounds: u32) -> Self {
        Self {
            store,
            runner,
            max_rounds,
        }
    }

    async fn invoke(
        &self,
        ticket: &Ticket,
        role: AgentRole,
        purpose: Purpose,
        extra_context: String,
        cancel: &CancellationToken,
    ) -> Result<crate::agent::AgentOutcome, SchedulerError> {
        let invocation = AgentInvocation {
            run_id: Uuid::new_v4(),
            ticket,
            role,
            purpose,
            workspace: None,
            extra_context,
        };
        self.runner
            .invoke(invocation, cancel)
            .await
            .map_err(|e| SchedulerError::Other(anyhow::anyhow!(e.to_string())))
    }

    /// Execute one refinement round for a ticket in REFINING or
    /// REFINING_ROUND_N and persist the updated conversation.
    pub async fn run_round(
        &self,
        ticket: &Ticket,
        cancel: &CancellationToken,
    ) -> Result<RoundOutcome, SchedulerError> {
        let mut conversation = ticket.conversation.clone().unwrap_or_default();
        let round = conversation.current_round() + 1;

        // Rounds past the first get a cheap-model compression of history.
        let summary = if round > 1 {
            let rendered = render_prior_rounds(&conversation, round);
            match self
                .invoke(ticket, AgentRole::Pm, Purpose::Summarise, rendered, cancel)
                .await
            {
                Ok(outcome) => outcome.output,
                Err(e) => {
                    tracing::warn!(ticket = %ticket.id, error = %e, "round summary failed, continuing without");
                    String::new()
                }
            }
        } else {
            String::new()
        };

        let facilitator = self
            .invoke(
                ticket,
                AgentRole::Pm,
                Purpose::Refine { round },
                summary.clone(),
                cancel,
            )
            .await?;

        let mut round_record = ConversationRound {
            round,
            facilitator_prompt: facilitator.output.clone(),
            expert_inputs: Vec::new(),
            synthesis: None,
        };

        let mut user_question: Option<String> = None;
        for role in EXPERT_ROLES {
            let context = format!("{}\n\n## Facilitator\n{}", summary, facilitator.output);
            let outcome = self
                .invoke(ticket, role, Purpose::Refine { round }, context, cancel)
                .await?;
            let reply: Option<ExpertReply> = extract_json(&outcome.output)
                .and_then(|v| serde_json::from_value(v).ok());
            if let Some(question) = reply.as_ref().and_then(|r| r.user_question.clone()) {
                user_question = Some(question);
            }
            round_record
                .expert_inputs
                .push(parse_expert_reply(role, &outcome.output));
        }

        let synthesis_context = round_record
            .expert_inputs
            .iter()
            .map(|e| format!("{}: {}", e.expert, e.response))
            .collect::<Vec<_>>()
            .join("\n");
        let synthesis = self
            .invoke(
                ticket,
                AgentRole::Pm,
                Purpose::Synthesis { round },
                synthesis_context,
                cancel,
            )
            .await?;
        if synthesis.verdict == OutputVerdict::NeedsReview && user_question.is_none() {
            user_question = Some(synthesis.output.clone());
        }
        round_record.synthesis = Some(synthesis.output);

        conversation.rounds.push(round_record);
        conversation.user_question = user_question.clone();
        {
            let id = ticket.id.clone();
            let conversation = conversation.clone();
            self.store
                .call(move |s| s.update_conversation(&id, &conversation))
                .await?;
        }

        if let Some(question) = user_question {
            return Ok(RoundOutcome::UserQuestion(question));
        }
        // The facilitator can short-circuit the PRD path: a ticket judged
        // fully specified goes straight to READY, and a consultation flag
        // keeps the experts in the loop for another round.
        let synthesis_flags = conversation
            .rounds
            .last()
            .and_then(|r| r.synthesis.as_deref())
            .and_then(extract_json);
        if let Some(flags) = &synthesis_flags {
            if flags.get("ready").and_then(|v| v.as_bool()) == Some(true) {
                return Ok(RoundOutcome::ReadyDirect);
            }
            // Consultation still counts against the round cap, so a
            // facilitator stuck on "ask an expert" cannot loop forever.
            if flags.get("needs_expert").and_then(|v| v.as_bool()) == Some(true)
                && round < self.max_rounds
            {
                return Ok(RoundOutcome::NeedsExpert);
            }
        }
        if conversation.has_consensus() {
            return Ok(RoundOutcome::Consensus);
        }
        if round >= self.max_rounds {
            return Ok(RoundOutcome::RoundCapReached);
        }
        Ok(RoundOutcome::NextRound(round + 1))
    }

    /// Split a PRD_COMPLETE ticket into child tickets. Children land in
    /// READY with `parent_id` set and parallel groups assigned so no two
    /// group members conflict.
    pub async fn breakdown(
        &self,
        ticket: &Ticket,
        cancel: &CancellationToken,
    ) -> Result<Vec<Ticket>, SchedulerError> {
        let outcome = self
            .invoke(ticket, AgentRole::Pm, Purpose::Breakdown, String::new(), cancel)
            .await?;
        let specs: Vec<ChildSpec> = extract_json(&outcome.output)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        if specs.is_empty() {
            return Err(SchedulerError::Other(anyhow::anyhow!(
                "breakdown agent produced no child tickets for {}",
                ticket.id
            )));
        }

        let file_sets: Vec<Vec<String>> = specs.iter().map(|s| s.files.clone()).collect();
        let groups = conflict::parallel_groups(&file_sets);

        let mut children = Vec::new();
        for (idx, spec) in specs.into_iter().enumerate() {
            let mut child = Ticket::new(
                &format!("{}-C{}", ticket.id, idx + 1),
                &spec.title,
                spec.domain
                    .as_deref()
                    .and_then(|d| Domain::parse(d).ok())
                    .unwrap_or(ticket.domain),
            );
            child.description = spec.description;
            child.files = spec.files;
            child.acceptance_criteria = spec.acceptance_criteria;
            child.priority = ticket.priority;
            child.ticket_type = ticket.ticket_type;
            child.parent_id = Some(ticket.id.clone());
            child.parallel_group = Some(groups[idx] as i64);
            child.status = TicketStatus::Ready;
            {
                let child = child.clone();
                self.store.call(move |s| s.create_ticket(&child)).await?;
            }
            children.push(child);
        }
        tracing::info!(
            parent = %ticket.id,
            count = children.len(),
            "PRD broken down into child tickets"
        );
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentOutcome;
    use crate::board::store::BoardStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted runner: maps (role, purpose tag) to canned output.
    struct ScriptedRunner {
        responses: Mutex<HashMap<String, Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
            }
        }

        fn script(&self, key: &str, output: &str) {
            self.responses
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .push(output.to_string());
        }

        fn key(role: AgentRole, purpose: &Purpose) -> String {
            let tag = match purpose {
                Purpose::Stage => "stage".to_string(),
                Purpose::Refine { .. } => "refine".to_string(),
                Purpose::Synthesis { .. } => "synthesis".to_string(),
                Purpose::Breakdown => "breakdown".to_string(),
                Purpose::PmVerify => "pm_verify".to_string(),
                Purpose::Summarise => "summarise".to_string(),
            };
            format!("{}:{}", role.as_str(), tag)
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn invoke(
            &self,
            invocation: AgentInvocation<'_>,
            _cancel: &CancellationToken,
        ) -> Result<AgentOutcome, crate::errors::ProviderError> {
            let key = Self::key(invocation.role, &invocation.purpose);
            let output = {
                let mut responses = self.responses.lock().unwrap();
                let queue = responses.entry(key.clone()).or_default();
                if queue.is_empty() {
                    format!("default output for {}", key)
                } else {
                    queue.remove(0)
                }
            };
            Ok(AgentOutcome {
                verdict: crate::agent::cli::detect_verdict(&output),
                output,
                tokens_in: 10,
                tokens_out: 5,
            })
        }
    }

    fn approving_reply() -> &'static str {
        r#"{"response": "fine by me", "approves": true, "key_points": ["scoped"]}"#
    }

    fn objecting_reply() -> &'static str {
        r#"{"response": "not yet", "approves": false, "concerns": ["unclear scope"]}"#
    }

    async fn engine_with(
        runner: Arc<ScriptedRunner>,
        max_rounds: u32,
    ) -> (RefinementEngine, StoreHandle, Ticket) {
        let store = StoreHandle::new(BoardStore::open_in_memory().unwrap());
        let mut ticket = Ticket::new("T-PRD", "Design the export flow", Domain::Backend);
        ticket.status = TicketStatus::Refining;
        {
            let t = ticket.clone();
            store.call(move |s| s.create_ticket(&t)).await.unwrap();
        }
        let engine = RefinementEngine::new(store.clone(), runner, max_rounds);
        (engine, store, ticket)
    }

    #[test]
    fn json_extraction_tolerates_prose_wrapping() {
        let text = "Here is my answer:\n{\"approves\": true}\nThanks!";
        let value = extract_json(text).unwrap();
        assert_eq!(value["approves"], true);

        let array = "leading words [1, 2, 3] trailing";
        assert!(extract_json(array).unwrap().is_array());

        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn unparseable_expert_output_defaults_to_objection() {
        let input = parse_expert_reply(AgentRole::Qa, "free-form musings");
        assert!(!input.approves);
        assert_eq!(input.response, "free-form musings");
        assert_eq!(input.expert, "qa");
    }

    #[tokio::test]
    async fn unanimous_round_reaches_consensus() {
        let runner = Arc::new(ScriptedRunner::new());
        for role in ["dev-backend", "qa", "ux", "security"] {
            runner.script(&format!("{}:refine", role), approving_reply());
        }
        let (engine, store, ticket) = engine_with(Arc::clone(&runner), 5).await;
        let outcome = engine
            .run_round(&ticket, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RoundOutcome::Consensus);

        let stored = store
            .call(|s| s.get_ticket("T-PRD"))
            .await
            .unwrap()
            .unwrap();
        let conversation = stored.conversation.unwrap();
        assert_eq!(conversation.rounds.len(), 1);
        assert_eq!(conversation.rounds[0].expert_inputs.len(), 4);
        assert!(conversation.rounds[0].synthesis.is_some());
    }

    #[tokio::test]
    async fn objection_moves_to_next_round() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("dev-backend:refine", approving_reply());
        runner.script("qa:refine", objecting_reply());
        runner.script("ux:refine", approving_reply());
        runner.script("security:refine", approving_reply());
        let (engine, _store, ticket) = engine_with(Arc::clone(&runner), 5).await;
        let outcome = engine
            .run_round(&ticket, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RoundOutcome::NextRound(2));
    }

    #[tokio::test]
    async fn facilitator_can_mark_ticket_fully_specified() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("qa:refine", objecting_reply());
        runner.script(
            "pm:synthesis",
            r#"{"synthesis": "small and unambiguous, skip the PRD", "ready": true}"#,
        );
        let (engine, _store, ticket) = engine_with(Arc::clone(&runner), 5).await;
        let outcome = engine
            .run_round(&ticket, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RoundOutcome::ReadyDirect);
    }

    #[tokio::test]
    async fn facilitator_can_request_expert_consultation() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.script(
            "pm:synthesis",
            r#"{"synthesis": "needs the database expert", "needs_expert": true}"#,
        );
        let (engine, _store, ticket) = engine_with(Arc::clone(&runner), 5).await;
        let outcome = engine
            .run_round(&ticket, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RoundOutcome::NeedsExpert);
    }

    #[tokio::test]
    async fn round_cap_escalates_to_user() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("qa:refine", objecting_reply());
        let (engine, store, mut ticket) = engine_with(Arc::clone(&runner), 1).await;
        // Pretend nothing approves; round 1 is also the cap.
        let outcome = engine
            .run_round(&ticket, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RoundOutcome::RoundCapReached);

        // A later round sees the persisted conversation.
        ticket.conversation = store
            .call(|s| s.get_ticket("T-PRD"))
            .await
            .unwrap()
            .unwrap()
            .conversation;
        assert_eq!(ticket.conversation.unwrap().rounds.len(), 1);
    }

    #[tokio::test]
    async fn expert_user_question_parks_ticket() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.script(
            "qa:refine",
            r#"{"response": "blocked", "approves": false, "user_question": "Which regions must comply?"}"#,
        );
        let (engine, store, ticket) = engine_with(Arc::clone(&runner), 5).await;
        let outcome = engine
            .run_round(&ticket, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RoundOutcome::UserQuestion("Which regions must comply?".to_string())
        );
        let stored = store
            .call(|s| s.get_ticket("T-PRD"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.conversation.unwrap().user_question.as_deref(),
            Some("Which regions must comply?")
        );
    }

    #[tokio::test]
    async fn second_round_requests_summary() {
        let runner = Arc::new(ScriptedRunner::new());
        // Round 1: qa objects. Round 2: everyone approves.
        runner.script("dev-backend:refine", approving_reply());
        runner.script("qa:refine", objecting_reply());
        runner.script("ux:refine", approving_reply());
        runner.script("security:refine", approving_reply());
        for role in ["dev-backend", "qa", "ux", "security"] {
            runner.script(&format!("{}:refine", role), approving_reply());
        }
        runner.script("pm:summarise", "- qa wanted clearer scope");
        let (engine, store, mut ticket) = engine_with(Arc::clone(&runner), 5).await;

        let first = engine
            .run_round(&ticket, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first, RoundOutcome::NextRound(2));

        ticket.conversation = store
            .call(|s| s.get_ticket("T-PRD"))
            .await
            .unwrap()
            .unwrap()
            .conversation;
        let second = engine
            .run_round(&ticket, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second, RoundOutcome::Consensus);
        let summarise_used = runner
            .responses
            .lock()
            .unwrap()
            .get("pm:summarise")
            .map(|q| q.is_empty())
            .unwrap_or(false);
        assert!(summarise_used, "round 2 must compress round 1 history");
    }

    #[tokio::test]
    async fn breakdown_creates_grouped_children() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.script(
            "pm:breakdown",
            r#"[
                {"title": "API endpoint", "domain": "backend", "files": ["api/export.rs"], "acceptance_criteria": ["returns csv"]},
                {"title": "Export button", "domain": "frontend", "files": ["ui/export.tsx"]},
                {"title": "API pagination", "domain": "backend", "files": ["api/export.rs"]}
            ]"#,
        );
        let (engine, store, ticket) = engine_with(Arc::clone(&runner), 5).await;
        let children = engine
            .breakdown(&ticket, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(children.len(), 3);
        assert_eq!(children[0].parent_id.as_deref(), Some("T-PRD"));
        assert_eq!(children[0].status, TicketStatus::Ready);
        // First and third share a file pattern, so they sit in different groups.
        assert_ne!(children[0].parallel_group, children[2].parallel_group);
        assert_eq!(children[0].parallel_group, children[1].parallel_group);

        let stored = store
            .call(|s| s.list_by_parent("T-PRD"))
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn breakdown_with_no_children_is_an_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("pm:breakdown", "no structured output at all");
        let (engine, _store, ticket) = engine_with(Arc::clone(&runner), 5).await;
        let result = engine.breakdown(&ticket, &CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
