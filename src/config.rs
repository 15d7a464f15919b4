//! Layered configuration for the orchestrator.
//!
//! Settings read from `.conveyor/conveyor.toml`, then environment
//! variables, then key/value overrides persisted in the board store. The
//! store layer wins so the dashboard can retune a live deployment.
//!
//! ```toml
//! [scheduler]
//! max_parallel_agents = 3
//! cycle_interval_secs = 10
//! agent_timeout_secs = 1800
//! max_refinement_rounds = 5
//!
//! [workspace]
//! max_global_worktrees = 3
//! main_branch = "main"
//! branch_prefix = "feat/"
//! squash_on_merge = true
//! cleanup_worktree_on_merge = true
//!
//! [agents]
//! model = "claude-sonnet-4-0"
//!
//! [rag]
//! enabled = true
//! vector_db_path = ".conveyor/chunks.db"
//! index_patterns = ["src/**/*.rs", "docs/patterns/*.md"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::board::models::Stage;
use crate::board::store::BoardStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global bound on concurrently running agent tasks.
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    /// Seconds between scheduler ticks.
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    /// Deadline for a single agent invocation, in seconds.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Runs older than `agent_timeout × stale_run_multiplier` are failed.
    #[serde(default = "default_stale_run_multiplier")]
    pub stale_run_multiplier: u32,
    /// Finished runs older than this are purged during housekeeping.
    #[serde(default = "default_run_retention_hours")]
    pub run_retention_hours: u64,
    /// Review stages skipped globally. A skipped stage is treated as
    /// absent: it neither runs nor counts toward merge eligibility.
    #[serde(default)]
    pub skip_stages: Vec<Stage>,
    /// Every mandatory stage must sign off before merge.
    #[serde(default = "default_true")]
    pub require_all_signoffs: bool,
    /// Hand the branch to the merge queue right after dev signoff,
    /// bypassing the review stages.
    #[serde(default)]
    pub merge_after_dev_signoff: bool,
    /// Merge completed branches without operator confirmation.
    #[serde(default = "default_true")]
    pub auto_merge: bool,
    /// Cap on PRD refinement rounds before escalating to the user.
    #[serde(default = "default_max_refinement_rounds")]
    pub max_refinement_rounds: u32,
    /// Minutes between PM check-in summaries.
    #[serde(default = "default_pm_checkin_interval_mins")]
    pub pm_checkin_interval_mins: u64,
    /// Write prompt/response audit entries.
    #[serde(default = "default_true")]
    pub enable_audit_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: default_max_parallel_agents(),
            cycle_interval_secs: default_cycle_interval_secs(),
            agent_timeout_secs: default_agent_timeout_secs(),
            stale_run_multiplier: default_stale_run_multiplier(),
            run_retention_hours: default_run_retention_hours(),
            skip_stages: Vec::new(),
            require_all_signoffs: true,
            merge_after_dev_signoff: false,
            auto_merge: true,
            max_refinement_rounds: default_max_refinement_rounds(),
            pm_checkin_interval_mins: default_pm_checkin_interval_mins(),
            enable_audit_logging: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Bound on pool entries in active ∪ merging.
    #[serde(default = "default_max_global_worktrees")]
    pub max_global_worktrees: usize,
    /// Local bare repository; when set, fetch/push against remotes is
    /// skipped and branches are created from the bare trunk reference.
    #[serde(default)]
    pub bare_repo: Option<PathBuf>,
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_true")]
    pub squash_on_merge: bool,
    #[serde(default = "default_true")]
    pub cleanup_worktree_on_merge: bool,
    /// Seconds between pool consistency checks.
    #[serde(default = "default_worktree_check_interval_secs")]
    pub worktree_check_interval_secs: u64,
    /// Merge attempts before an entry is terminally failed.
    #[serde(default = "default_max_merge_attempts")]
    pub max_merge_attempts: u32,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            max_global_worktrees: default_max_global_worktrees(),
            bare_repo: None,
            main_branch: default_main_branch(),
            branch_prefix: default_branch_prefix(),
            squash_on_merge: true,
            cleanup_worktree_on_merge: true,
            worktree_check_interval_secs: default_worktree_check_interval_secs(),
            max_merge_attempts: default_max_merge_attempts(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Global model override; wins over per-role defaults in CLI-only mode.
    #[serde(default)]
    pub model: Option<String>,
    /// Fallback CLI command when no provider credential is present.
    #[serde(default)]
    pub cli_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_vector_db_path")]
    pub vector_db_path: PathBuf,
    /// Glob patterns of codebase files indexed as retrieval context.
    #[serde(default)]
    pub index_patterns: Vec<String>,
    /// Token budget for retrieved context per invocation.
    #[serde(default = "default_rag_token_budget")]
    pub token_budget: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vector_db_path: default_vector_db_path(),
            index_patterns: Vec::new(),
            token_budget: default_rag_token_budget(),
        }
    }
}

/// Composite runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub agents: AgentConfig,
    #[serde(default)]
    pub rag: RagConfig,
    /// Repository the workspaces branch from.
    #[serde(default = "default_repo_path")]
    pub repo_path: PathBuf,
    /// Board database location.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            workspace: WorkspaceConfig::default(),
            agents: AgentConfig::default(),
            rag: RagConfig::default(),
            repo_path: default_repo_path(),
            db_path: default_db_path(),
        }
    }
}

fn default_max_parallel_agents() -> usize {
    3
}

fn default_cycle_interval_secs() -> u64 {
    10
}

fn default_agent_timeout_secs() -> u64 {
    30 * 60
}

fn default_stale_run_multiplier() -> u32 {
    2
}

fn default_run_retention_hours() -> u64 {
    72
}

fn default_max_refinement_rounds() -> u32 {
    5
}

fn default_pm_checkin_interval_mins() -> u64 {
    30
}

fn default_max_global_worktrees() -> usize {
    3
}

fn default_main_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "feat/".to_string()
}

fn default_worktree_check_interval_secs() -> u64 {
    60
}

fn default_max_merge_attempts() -> u32 {
    3
}

fn default_vector_db_path() -> PathBuf {
    PathBuf::from(".conveyor/chunks.db")
}

fn default_rag_token_budget() -> usize {
    2000
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".conveyor/board.db")
}

fn default_true() -> bool {
    true
}

impl OrchestratorConfig {
    /// Read `.conveyor/conveyor.toml` under `root`, falling back to
    /// defaults when the file is absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(".conveyor").join("conveyor.toml");
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config at {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config at {}", path.display()))?
        } else {
            Self::default()
        };
        if config.repo_path == default_repo_path() {
            config.repo_path = root.to_path_buf();
        }
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for the handful of knobs operators flip
    /// without editing the file.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CONVEYOR_MAX_PARALLEL_AGENTS")
            && let Ok(n) = v.parse()
        {
            self.scheduler.max_parallel_agents = n;
        }
        if let Ok(v) = std::env::var("CONVEYOR_CYCLE_INTERVAL_SECS")
            && let Ok(n) = v.parse()
        {
            self.scheduler.cycle_interval_secs = n;
        }
        if let Ok(v) = std::env::var("CONVEYOR_MODEL") {
            self.agents.model = Some(v);
        }
        if let Ok(v) = std::env::var("CONVEYOR_CLI_COMMAND") {
            self.agents.cli_command = Some(v);
        }
    }

    /// Apply key/value overrides persisted in the board store.
    pub fn apply_store_overrides(&mut self, store: &BoardStore) -> Result<()> {
        if let Some(v) = store.get_config("max_parallel_agents")? {
            self.scheduler.max_parallel_agents = v
                .parse()
                .with_context(|| format!("Bad max_parallel_agents override: {}", v))?;
        }
        if let Some(v) = store.get_config("max_global_worktrees")? {
            self.workspace.max_global_worktrees = v
                .parse()
                .with_context(|| format!("Bad max_global_worktrees override: {}", v))?;
        }
        if let Some(v) = store.get_config("agent_timeout_secs")? {
            self.scheduler.agent_timeout_secs = v
                .parse()
                .with_context(|| format!("Bad agent_timeout_secs override: {}", v))?;
        }
        if let Some(v) = store.get_config("auto_merge")? {
            self.scheduler.auto_merge = v == "true";
        }
        if let Some(v) = store.get_config("max_refinement_rounds")? {
            self.scheduler.max_refinement_rounds = v
                .parse()
                .with_context(|| format!("Bad max_refinement_rounds override: {}", v))?;
        }
        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.cycle_interval_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.agent_timeout_secs)
    }

    /// Age past which a still-running run is considered stale.
    pub fn stale_run_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            (self.scheduler.agent_timeout_secs * u64::from(self.scheduler.stale_run_multiplier))
                as i64,
        )
    }

    /// Stage skipped by global configuration?
    pub fn stage_skipped(&self, stage: Stage) -> bool {
        self.scheduler.skip_stages.contains(&stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.scheduler.max_parallel_agents, 3);
        assert_eq!(config.scheduler.cycle_interval_secs, 10);
        assert_eq!(config.scheduler.agent_timeout_secs, 1800);
        assert_eq!(config.scheduler.max_refinement_rounds, 5);
        assert_eq!(config.workspace.max_global_worktrees, 3);
        assert_eq!(config.workspace.main_branch, "main");
        assert_eq!(config.workspace.branch_prefix, "feat/");
        assert!(config.workspace.squash_on_merge);
        assert!(config.scheduler.require_all_signoffs);
        assert_eq!(config.rag.token_budget, 2000);
    }

    #[test]
    fn load_missing_file_uses_defaults_with_root_repo() {
        let dir = TempDir::new().unwrap();
        let config = OrchestratorConfig::load(dir.path()).unwrap();
        assert_eq!(config.repo_path, dir.path());
        assert_eq!(config.scheduler.max_parallel_agents, 3);
    }

    #[test]
    fn load_partial_file_keeps_defaults_for_the_rest() {
        let dir = TempDir::new().unwrap();
        let conveyor_dir = dir.path().join(".conveyor");
        std::fs::create_dir_all(&conveyor_dir).unwrap();
        std::fs::write(
            conveyor_dir.join("conveyor.toml"),
            "[scheduler]\nmax_parallel_agents = 7\n\n[workspace]\nbranch_prefix = \"ticket/\"\n",
        )
        .unwrap();
        let config = OrchestratorConfig::load(dir.path()).unwrap();
        assert_eq!(config.scheduler.max_parallel_agents, 7);
        assert_eq!(config.workspace.branch_prefix, "ticket/");
        assert_eq!(config.scheduler.cycle_interval_secs, 10);
        assert_eq!(config.workspace.main_branch, "main");
    }

    #[test]
    fn store_overrides_win_over_file_values() {
        let store = BoardStore::open_in_memory().unwrap();
        store.set_config("max_parallel_agents", "9").unwrap();
        store.set_config("auto_merge", "false").unwrap();
        let mut config = OrchestratorConfig::default();
        config.apply_store_overrides(&store).unwrap();
        assert_eq!(config.scheduler.max_parallel_agents, 9);
        assert!(!config.scheduler.auto_merge);
    }

    #[test]
    fn stale_run_age_derives_from_timeout() {
        let mut config = OrchestratorConfig::default();
        config.scheduler.agent_timeout_secs = 600;
        config.scheduler.stale_run_multiplier = 2;
        assert_eq!(config.stale_run_age(), chrono::Duration::seconds(1200));
    }

    #[test]
    fn skip_stages_parse_from_toml() {
        let config: OrchestratorConfig =
            toml::from_str("[scheduler]\nskip_stages = [\"ux\"]\n").unwrap();
        assert!(config.stage_skipped(Stage::Ux));
        assert!(!config.stage_skipped(Stage::Qa));
    }
}
