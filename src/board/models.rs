use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline stage of a ticket.
///
/// Stored as a snake_case string; `RefiningRound(n)` round-trips through
/// `refining_round_N` so multi-round PRD discussions keep their round number
/// in the persisted status column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TicketStatus {
    Backlog,
    Approved,
    Refining,
    RefiningRound(u32),
    PrdComplete,
    BreakingDown,
    NeedsExpert,
    AwaitingUser,
    Ready,
    InDev,
    InQa,
    InUx,
    InSec,
    PmReview,
    Done,
    Blocked,
}

impl TicketStatus {
    pub fn as_str(&self) -> String {
        match self {
            Self::Backlog => "backlog".to_string(),
            Self::Approved => "approved".to_string(),
            Self::Refining => "refining".to_string(),
            Self::RefiningRound(n) => format!("refining_round_{}", n),
            Self::PrdComplete => "prd_complete".to_string(),
            Self::BreakingDown => "breaking_down".to_string(),
            Self::NeedsExpert => "needs_expert".to_string(),
            Self::AwaitingUser => "awaiting_user".to_string(),
            Self::Ready => "ready".to_string(),
            Self::InDev => "in_dev".to_string(),
            Self::InQa => "in_qa".to_string(),
            Self::InUx => "in_ux".to_string(),
            Self::InSec => "in_sec".to_string(),
            Self::PmReview => "pm_review".to_string(),
            Self::Done => "done".to_string(),
            Self::Blocked => "blocked".to_string(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        if let Some(round) = s.strip_prefix("refining_round_") {
            let n: u32 = round
                .parse()
                .map_err(|_| format!("Invalid refining round in status: {}", s))?;
            return Ok(Self::RefiningRound(n));
        }
        match s {
            "backlog" => Ok(Self::Backlog),
            "approved" => Ok(Self::Approved),
            "refining" => Ok(Self::Refining),
            "prd_complete" => Ok(Self::PrdComplete),
            "breaking_down" => Ok(Self::BreakingDown),
            "needs_expert" => Ok(Self::NeedsExpert),
            "awaiting_user" => Ok(Self::AwaitingUser),
            "ready" => Ok(Self::Ready),
            "in_dev" => Ok(Self::InDev),
            "in_qa" => Ok(Self::InQa),
            "in_ux" => Ok(Self::InUx),
            "in_sec" => Ok(Self::InSec),
            "pm_review" => Ok(Self::PmReview),
            "done" => Ok(Self::Done),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }

    /// True for statuses counted against `max_parallel_agents`.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InDev | Self::InQa | Self::InUx | Self::InSec)
    }

    /// The fixed forward stage chain. Returns `None` past PM review;
    /// DONE is reached through the merge queue, not plain advancement.
    pub fn next_stage(&self) -> Option<TicketStatus> {
        match self {
            Self::InDev => Some(Self::InQa),
            Self::InQa => Some(Self::InUx),
            Self::InUx => Some(Self::InSec),
            Self::InSec => Some(Self::PmReview),
            _ => None,
        }
    }
}

impl Serialize for TicketStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for TicketStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TicketStatus::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Frontend,
    Backend,
    Infra,
    Database,
    Shared,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Infra => "infra",
            Self::Database => "database",
            Self::Shared => "shared",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "frontend" => Ok(Self::Frontend),
            "backend" => Ok(Self::Backend),
            "infra" => Ok(Self::Infra),
            "database" => Ok(Self::Database),
            "shared" => Ok(Self::Shared),
            _ => Err(format!("Invalid domain: {}", s)),
        }
    }

    /// Dev agent role responsible for tickets in this domain.
    pub fn dev_role(&self) -> AgentRole {
        match self {
            Self::Frontend => AgentRole::DevFrontend,
            Self::Backend => AgentRole::DevBackend,
            Self::Infra => AgentRole::DevInfra,
            Self::Database | Self::Shared => AgentRole::DevBackend,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TicketType {
    Feature,
    Bugfix,
    TechDebt,
    Security,
}

impl TicketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::TechDebt => "tech-debt",
            Self::Security => "security",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "feature" => Ok(Self::Feature),
            "bugfix" => Ok(Self::Bugfix),
            "tech-debt" => Ok(Self::TechDebt),
            "security" => Ok(Self::Security),
            _ => Err(format!("Invalid ticket type: {}", s)),
        }
    }
}

/// Agent roles the scheduler dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentRole {
    Pm,
    DevFrontend,
    DevBackend,
    DevInfra,
    Qa,
    Ux,
    Security,
    Ideas,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pm => "pm",
            Self::DevFrontend => "dev-frontend",
            Self::DevBackend => "dev-backend",
            Self::DevInfra => "dev-infra",
            Self::Qa => "qa",
            Self::Ux => "ux",
            Self::Security => "security",
            Self::Ideas => "ideas",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pm" => Ok(Self::Pm),
            "dev-frontend" => Ok(Self::DevFrontend),
            "dev-backend" => Ok(Self::DevBackend),
            "dev-infra" => Ok(Self::DevInfra),
            "qa" => Ok(Self::Qa),
            "ux" => Ok(Self::Ux),
            "security" => Ok(Self::Security),
            "ideas" => Ok(Self::Ideas),
            _ => Err(format!("Invalid agent role: {}", s)),
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Self::DevFrontend | Self::DevBackend | Self::DevInfra)
    }

    /// The review stage this role signs off, if any.
    pub fn signoff_stage(&self) -> Option<Stage> {
        match self {
            Self::DevFrontend | Self::DevBackend | Self::DevInfra => Some(Stage::Dev),
            Self::Qa => Some(Stage::Qa),
            Self::Ux => Some(Stage::Ux),
            Self::Security => Some(Stage::Security),
            Self::Pm => Some(Stage::Pm),
            Self::Ideas => None,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reviewing stages that accumulate signoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Dev,
    Qa,
    Ux,
    Security,
    Pm,
}

impl Stage {
    pub const ALL: [Stage; 5] = [Stage::Dev, Stage::Qa, Stage::Ux, Stage::Security, Stage::Pm];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Qa => "qa",
            Self::Ux => "ux",
            Self::Security => "security",
            Self::Pm => "pm",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "dev" => Ok(Self::Dev),
            "qa" => Ok(Self::Qa),
            "ux" => Ok(Self::Ux),
            "security" => Ok(Self::Security),
            "pm" => Ok(Self::Pm),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }

    /// Stages downstream of `self` in the review chain.
    pub fn downstream(&self) -> &'static [Stage] {
        match self {
            Self::Dev => &[Stage::Qa, Stage::Ux, Stage::Security, Stage::Pm],
            Self::Qa => &[Stage::Ux, Stage::Security, Stage::Pm],
            Self::Ux => &[Stage::Security, Stage::Pm],
            Self::Security => &[Stage::Pm],
            Self::Pm => &[],
        }
    }
}

/// One stage's approval: set once with the approval timestamp, cleared only
/// by rework of an upstream stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signoffs {
    pub dev: Option<DateTime<Utc>>,
    pub qa: Option<DateTime<Utc>>,
    pub ux: Option<DateTime<Utc>>,
    pub security: Option<DateTime<Utc>>,
    pub pm: Option<DateTime<Utc>>,
}

impl Signoffs {
    pub fn get(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Dev => self.dev,
            Stage::Qa => self.qa,
            Stage::Ux => self.ux,
            Stage::Security => self.security,
            Stage::Pm => self.pm,
        }
    }

    pub fn set(&mut self, stage: Stage, at: Option<DateTime<Utc>>) {
        match stage {
            Stage::Dev => self.dev = at,
            Stage::Qa => self.qa = at,
            Stage::Ux => self.ux = at,
            Stage::Security => self.security = at,
            Stage::Pm => self.pm = at,
        }
    }

    /// All stages signed, excluding `skipped` ones.
    pub fn all_signed(&self, skipped: &[Stage]) -> bool {
        Stage::ALL
            .iter()
            .filter(|s| !skipped.contains(s))
            .all(|s| self.get(*s).is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bug {
    pub description: String,
    pub severity: String,
    pub found_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub status: TicketStatus,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// One expert's structured contribution to a refinement round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpertInput {
    pub expert: String,
    pub response: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub questions_for_others: Vec<String>,
    pub approves: bool,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationRound {
    pub round: u32,
    pub facilitator_prompt: String,
    #[serde(default)]
    pub expert_inputs: Vec<ExpertInput>,
    #[serde(default)]
    pub synthesis: Option<String>,
}

/// Multi-round PRD refinement transcript attached to a ticket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrdConversation {
    #[serde(default)]
    pub rounds: Vec<ConversationRound>,
    #[serde(default)]
    pub user_question: Option<String>,
}

impl PrdConversation {
    pub fn current_round(&self) -> u32 {
        self.rounds.len() as u32
    }

    /// Consensus: every expert in the latest round approves and raised no
    /// cross-expert questions.
    pub fn has_consensus(&self) -> bool {
        self.rounds.last().is_some_and(|r| {
            !r.expert_inputs.is_empty()
                && r.expert_inputs
                    .iter()
                    .all(|e| e.approves && e.questions_for_others.is_empty())
        })
    }
}

/// The unit of work moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub description: String,
    pub domain: Domain,
    /// 1 highest priority, 4 lowest.
    pub priority: u8,
    pub ticket_type: TicketType,
    /// Glob-like path patterns used for conflict detection.
    #[serde(default)]
    pub files: Vec<String>,
    /// Dependency ticket ids (or exact titles).
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub technical_context: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub signoffs: Signoffs,
    #[serde(default)]
    pub bugs: Vec<Bug>,
    pub status: TicketStatus,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub workspace_path: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub parallel_group: Option<i64>,
    #[serde(default)]
    pub conversation: Option<PrdConversation>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Minimal constructor used by the creation paths; everything else
    /// defaults to empty.
    pub fn new(id: &str, title: &str, domain: Domain) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            domain,
            priority: 3,
            ticket_type: TicketType::Feature,
            files: Vec::new(),
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
            technical_context: String::new(),
            constraints: Vec::new(),
            signoffs: Signoffs::default(),
            bugs: Vec::new(),
            status: TicketStatus::Backlog,
            assigned_agent: None,
            workspace_path: None,
            branch: None,
            parent_id: None,
            parallel_group: None,
            conversation: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// One invocation of an agent against a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Uuid,
    pub agent: AgentRole,
    pub ticket_id: String,
    #[serde(default)]
    pub workspace_path: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    PromptSent,
    ResponseReceived,
    ToolCall,
    Error,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PromptSent => "prompt_sent",
            Self::ResponseReceived => "response_received",
            Self::ToolCall => "tool_call",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "prompt_sent" => Ok(Self::PromptSent),
            "response_received" => Ok(Self::ResponseReceived),
            "tool_call" => Ok(Self::ToolCall),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid audit event type: {}", s)),
        }
    }
}

/// One LLM interaction event in the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub run_id: Uuid,
    pub ticket_id: String,
    pub agent: AgentRole,
    pub event_type: AuditEventType,
    pub event_data: serde_json::Value,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolEntryStatus {
    Active,
    Merging,
    CleanupPending,
}

impl PoolEntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Merging => "merging",
            Self::CleanupPending => "cleanup_pending",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "active" => Ok(Self::Active),
            "merging" => Ok(Self::Merging),
            "cleanup_pending" => Ok(Self::CleanupPending),
            _ => Err(format!("Invalid pool entry status: {}", s)),
        }
    }

    /// Entries counted against `max_global_worktrees`.
    pub fn holds_slot(&self) -> bool {
        matches!(self, Self::Active | Self::Merging)
    }
}

/// Pool membership record for one ticket's workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    pub ticket_id: String,
    pub branch: String,
    pub path: String,
    pub agent: AgentRole,
    pub status: PoolEntryStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid merge status: {}", s)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A pending trunk-integration job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeEntry {
    pub id: i64,
    pub ticket_id: String,
    pub branch: String,
    pub status: MergeStatus,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}
