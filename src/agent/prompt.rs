//! Cache-aware prompt assembly.
//!
//! Role templates split into a static prefix (role instructions, shared
//! rules, domain knowledge or retrieved patterns) and a dynamic suffix
//! (rendered ticket context, conversation summary, minimised ticket JSON).
//! The prefix blocks are flagged cacheable so the Anthropic path reuses
//! them across invocations; only the suffix changes per ticket.

use serde_json::{Value, json};

use crate::agent::provider::{ChatMessage, ChatRequest, SystemBlock};
use crate::board::models::{AgentRole, PrdConversation, Ticket};

/// Markers separating the static template prefix from the dynamic portion.
pub const SPLIT_MARKERS: [&str; 5] = [
    "## Ticket Context",
    "## Current Ticket",
    "## Conversation History",
    "{{.TicketJSON}}",
    "{{.ConversationSummary}}",
];

/// Directive embedded in role templates where shared rules used to be
/// inlined. It is stripped and re-injected as its own cacheable block.
pub const SHARED_RULES_DIRECTIVE: &str = "{{.SharedRules}}";

/// Split a role template into (static prefix, dynamic suffix).
///
/// The cut lands at the earliest marker occurrence. Without a marker, the
/// template splits at the first paragraph break past 60% of its length;
/// failing that the whole template is static.
pub fn split_template(template: &str) -> (String, String) {
    let cut = SPLIT_MARKERS
        .iter()
        .filter_map(|marker| template.find(marker))
        .min();
    if let Some(cut) = cut {
        return (template[..cut].to_string(), template[cut..].to_string());
    }
    let threshold = (template.len() as f64 * 0.6) as usize;
    if let Some(offset) = template.get(threshold..).and_then(|tail| tail.find("\n\n")) {
        let cut = threshold + offset + 2;
        return (template[..cut].to_string(), template[cut..].to_string());
    }
    (template.to_string(), String::new())
}

/// Remove the embedded shared-rules directive from a template fragment.
pub fn strip_shared_rules(fragment: &str) -> String {
    fragment.replace(SHARED_RULES_DIRECTIVE, "")
}

/// Per-role projection of a ticket, dropping everything the role does not
/// need to save prompt tokens.
pub fn minimised_ticket_json(ticket: &Ticket, role: AgentRole) -> Value {
    let mut value = json!({
        "id": ticket.id,
        "title": ticket.title,
        "status": ticket.status.as_str(),
        "domain": ticket.domain.as_str(),
        "priority": ticket.priority,
        "acceptance_criteria": ticket.acceptance_criteria,
    });
    match role {
        AgentRole::DevFrontend | AgentRole::DevBackend | AgentRole::DevInfra => {
            value["description"] = json!(ticket.description);
            value["technical_context"] = json!(ticket.technical_context);
            value["files"] = json!(ticket.files);
            value["constraints"] = json!(ticket.constraints);
            value["bugs"] = json!(ticket.bugs);
        }
        AgentRole::Qa => {
            value["description"] = json!(ticket.description);
            value["bugs"] = json!(ticket.bugs);
        }
        AgentRole::Ux => {
            value["description"] = json!(ticket.description);
        }
        AgentRole::Security => {
            value["files"] = json!(ticket.files);
            value["constraints"] = json!(ticket.constraints);
            value["technical_context"] = json!(ticket.technical_context);
        }
        AgentRole::Pm => {
            value["description"] = json!(ticket.description);
            value["dependencies"] = json!(ticket.dependencies);
            value["parent_id"] = json!(ticket.parent_id);
            value["bugs"] = json!(ticket.bugs);
        }
        AgentRole::Ideas => {
            value["description"] = json!(ticket.description);
        }
    }
    value
}

/// Render prior refinement rounds for the cheap-model summariser. The
/// current round is never included.
pub fn render_prior_rounds(conversation: &PrdConversation, current_round: u32) -> String {
    let mut out = String::new();
    for round in &conversation.rounds {
        if round.round >= current_round {
            continue;
        }
        out.push_str(&format!("### Round {}\n", round.round));
        for input in &round.expert_inputs {
            out.push_str(&format!(
                "- {} ({}): {}\n",
                input.expert,
                if input.approves { "approves" } else { "objects" },
                input.response,
            ));
            for concern in &input.concerns {
                out.push_str(&format!("  concern: {}\n", concern));
            }
        }
        if let Some(synthesis) = &round.synthesis {
            out.push_str(&format!("Synthesis: {}\n", synthesis));
        }
        out.push('\n');
    }
    out
}

/// Build the cheap-tier request that compresses prior rounds into at most
/// 300 words of bullet points.
pub fn summarisation_request(model: &str, prior_rounds: &str) -> ChatRequest {
    let mut request = ChatRequest::new(model);
    request.max_tokens = 1024;
    request.system.push(SystemBlock::plain(
        "Compress the following discussion rounds into at most 300 words of \
         bullet points. Keep decisions, open concerns, and who raised them. \
         Drop pleasantries and repetition.",
    ));
    request.messages.push(ChatMessage::user(prior_rounds));
    request
}

/// Inputs for one assembled prompt.
pub struct PromptInputs<'a> {
    pub role_template: &'a str,
    pub shared_rules: &'a str,
    /// Full domain-expert knowledge, or the retrieved patterns when RAG is
    /// enabled. Exactly one of the two feeds this slot.
    pub knowledge: &'a str,
    pub ticket: &'a Ticket,
    pub role: AgentRole,
    pub round_summary: Option<&'a str>,
}

/// Assembled prompt: ordered system blocks plus the user turn.
pub struct AssembledPrompt {
    pub system: Vec<SystemBlock>,
    pub user_message: String,
}

impl AssembledPrompt {
    /// Full prompt text for auditing and the CLI fallback path.
    pub fn rendered(&self) -> String {
        let mut out = String::new();
        for block in &self.system {
            out.push_str(&block.text);
            out.push_str("\n\n");
        }
        out.push_str(&self.user_message);
        out
    }
}

/// Assemble the cache-segmented prompt for one invocation.
pub fn assemble(inputs: &PromptInputs<'_>) -> AssembledPrompt {
    let (static_part, dynamic_part) = split_template(inputs.role_template);

    let mut system = Vec::new();
    let static_clean = strip_shared_rules(&static_part);
    if !static_clean.trim().is_empty() {
        system.push(SystemBlock::cached(static_clean.trim_end().to_string()));
    }
    if !inputs.shared_rules.trim().is_empty() {
        system.push(SystemBlock::cached(inputs.shared_rules.trim().to_string()));
    }
    if !inputs.knowledge.trim().is_empty() {
        system.push(SystemBlock::cached(inputs.knowledge.trim().to_string()));
    }

    let mut dynamic = strip_shared_rules(&dynamic_part);
    if let Some(summary) = inputs.round_summary {
        dynamic.push_str("\n\n## Conversation Summary\n");
        dynamic.push_str(summary);
    }
    let ticket_json = minimised_ticket_json(inputs.ticket, inputs.role);
    let dynamic = dynamic.replace("{{.TicketJSON}}", &ticket_json.to_string());
    let dynamic = if dynamic.contains(&ticket_json.to_string()) {
        dynamic
    } else {
        format!("{}\n\n## Current Ticket\n{}", dynamic.trim_end(), ticket_json)
    };
    system.push(SystemBlock::plain(dynamic.trim().to_string()));

    AssembledPrompt {
        system,
        user_message: format!(
            "Execute the {} stage for ticket {}.",
            inputs.role.as_str(),
            inputs.ticket.id
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::models::{ConversationRound, Domain, ExpertInput};

    fn ticket() -> Ticket {
        let mut t = Ticket::new("T-9", "Add search", Domain::Backend);
        t.description = "Full text search over tickets".to_string();
        t.technical_context = "sqlite fts5".to_string();
        t.acceptance_criteria = vec!["results ranked".to_string()];
        t.files = vec!["src/search/*.rs".to_string()];
        t
    }

    #[test]
    fn split_at_earliest_marker() {
        let template = "Role intro.\n## Current Ticket\n{{.TicketJSON}}\n## Ticket Context\nmore";
        let (stat, dynamic) = split_template(template);
        assert_eq!(stat, "Role intro.\n");
        assert!(dynamic.starts_with("## Current Ticket"));
    }

    #[test]
    fn split_without_marker_uses_paragraph_break_past_sixty_percent() {
        let head = "x".repeat(70);
        let template = format!("{}\n\nshort tail", head);
        let (stat, dynamic) = split_template(&template);
        assert!(stat.starts_with('x'));
        assert_eq!(dynamic, "short tail");
    }

    #[test]
    fn split_without_any_break_keeps_everything_static() {
        let template = "one continuous line with no paragraph breaks at all";
        let (stat, dynamic) = split_template(template);
        assert_eq!(stat, template);
        assert!(dynamic.is_empty());
    }

    #[test]
    fn shared_rules_directive_is_stripped_and_reinjected() {
        let template = format!(
            "Role intro.\n{}\nMore instructions.\n## Current Ticket\n{{{{.TicketJSON}}}}",
            SHARED_RULES_DIRECTIVE
        );
        let inputs = PromptInputs {
            role_template: &template,
            shared_rules: "Always respond with a promise tag.",
            knowledge: "",
            ticket: &ticket(),
            role: AgentRole::DevBackend,
            round_summary: None,
        };
        let prompt = assemble(&inputs);
        assert!(!prompt.system[0].text.contains(SHARED_RULES_DIRECTIVE));
        assert_eq!(prompt.system[1].text, "Always respond with a promise tag.");
        assert!(prompt.system[1].cacheable);
    }

    #[test]
    fn static_blocks_cacheable_dynamic_block_not() {
        let inputs = PromptInputs {
            role_template: "Intro.\n## Current Ticket\n{{.TicketJSON}}",
            shared_rules: "rules",
            knowledge: "patterns",
            ticket: &ticket(),
            role: AgentRole::DevBackend,
            round_summary: None,
        };
        let prompt = assemble(&inputs);
        let (cached, plain): (Vec<_>, Vec<_>) =
            prompt.system.iter().partition(|b| b.cacheable);
        assert_eq!(cached.len(), 3);
        assert_eq!(plain.len(), 1);
        assert!(plain[0].text.contains("\"id\":\"T-9\""));
    }

    #[test]
    fn ticket_json_injected_when_template_lacks_placeholder() {
        let inputs = PromptInputs {
            role_template: "Intro.\n## Current Ticket\nreview carefully",
            shared_rules: "",
            knowledge: "",
            ticket: &ticket(),
            role: AgentRole::Qa,
            round_summary: None,
        };
        let prompt = assemble(&inputs);
        let dynamic = &prompt.system.last().unwrap().text;
        assert!(dynamic.contains("\"id\":\"T-9\""));
    }

    #[test]
    fn minimised_json_keeps_only_role_fields() {
        let t = ticket();
        let dev = minimised_ticket_json(&t, AgentRole::DevBackend);
        assert_eq!(dev["technical_context"], "sqlite fts5");
        assert!(dev.get("history").is_none());

        let ux = minimised_ticket_json(&t, AgentRole::Ux);
        assert!(ux.get("technical_context").is_none());
        assert!(ux.get("files").is_none());
        assert_eq!(ux["description"], "Full text search over tickets");

        let sec = minimised_ticket_json(&t, AgentRole::Security);
        assert_eq!(sec["files"][0], "src/search/*.rs");
        assert!(sec.get("description").is_none());
    }

    #[test]
    fn prior_round_rendering_excludes_current_round() {
        let mut conv = PrdConversation::default();
        for round in 1..=3 {
            conv.rounds.push(ConversationRound {
                round,
                facilitator_prompt: format!("prompt {}", round),
                expert_inputs: vec![ExpertInput {
                    expert: "qa".to_string(),
                    response: format!("round {} take", round),
                    approves: round == 3,
                    ..Default::default()
                }],
                synthesis: Some(format!("synthesis {}", round)),
            });
        }
        let rendered = render_prior_rounds(&conv, 3);
        assert!(rendered.contains("round 1 take"));
        assert!(rendered.contains("round 2 take"));
        assert!(!rendered.contains("round 3 take"));
    }

    #[test]
    fn summarisation_request_targets_cheap_tier_budget() {
        let request = summarisation_request("claude-3-5-haiku-latest", "### Round 1\n- dev: ok");
        assert_eq!(request.model, "claude-3-5-haiku-latest");
        assert!(request.system[0].text.contains("300 words"));
        assert!(!request.system[0].cacheable);
    }

    #[test]
    fn rendered_prompt_joins_blocks_and_user_turn() {
        let inputs = PromptInputs {
            role_template: "Intro.\n## Current Ticket\n{{.TicketJSON}}",
            shared_rules: "rules",
            knowledge: "",
            ticket: &ticket(),
            role: AgentRole::DevBackend,
            round_summary: None,
        };
        let prompt = assemble(&inputs);
        let rendered = prompt.rendered();
        assert!(rendered.starts_with("Intro."));
        assert!(rendered.ends_with("Execute the dev-backend stage for ticket T-9."));
    }
}
