//! End-to-end scheduler scenarios driven through a scripted agent runner
//! and a real git fixture.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use conveyor::agent::cli::detect_verdict;
use conveyor::agent::{AgentInvocation, AgentOutcome, AgentRunner};
use conveyor::board::models::*;
use conveyor::board::store::{BoardStore, ORPHAN_NOTE, StoreHandle};
use conveyor::config::OrchestratorConfig;
use conveyor::errors::ProviderError;
use conveyor::events::EventBus;
use conveyor::refine::RefinementEngine;
use conveyor::scheduler::engine::Scheduler;
use conveyor::workspace::git::GitManager;
use conveyor::workspace::merge::MergeQueue;
use conveyor::workspace::pool::WorkspacePool;

/// Scripted stand-in for the LLM agents. Dev roles write a file into their
/// workspace so merges carry real changes; every role answers with a
/// promise unless a failure has been scripted for it.
struct PipelineMock {
    fail_once: Mutex<HashMap<String, String>>,
}

impl PipelineMock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_once: Mutex::new(HashMap::new()),
        })
    }

    fn fail_next(&self, role: AgentRole, output: &str) {
        self.fail_once
            .lock()
            .unwrap()
            .insert(role.as_str().to_string(), output.to_string());
    }
}

#[async_trait]
impl AgentRunner for PipelineMock {
    async fn invoke(
        &self,
        invocation: AgentInvocation<'_>,
        _cancel: &CancellationToken,
    ) -> Result<AgentOutcome, ProviderError> {
        if let Some(scripted) = self
            .fail_once
            .lock()
            .unwrap()
            .remove(invocation.role.as_str())
        {
            return Ok(AgentOutcome {
                verdict: detect_verdict(&scripted),
                output: scripted,
                tokens_in: 10,
                tokens_out: 5,
            });
        }
        if invocation.role.is_dev()
            && let Some(workspace) = &invocation.workspace
        {
            std::fs::write(
                workspace.join(format!("{}.txt", invocation.ticket.id)),
                "implemented\n",
            )
            .expect("mock dev writes into its workspace");
        }
        let output = "<promise>stage complete</promise>".to_string();
        Ok(AgentOutcome {
            verdict: detect_verdict(&output),
            output,
            tokens_in: 10,
            tokens_out: 5,
        })
    }
}

struct Harness {
    _repo: TempDir,
    repo_path: std::path::PathBuf,
    store: StoreHandle,
    scheduler: Scheduler,
    cancel: CancellationToken,
}

async fn run_git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?}: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

async fn init_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    run_git(dir.path(), &["init", "-b", "main"]).await;
    run_git(dir.path(), &["config", "user.name", "conveyor-test"]).await;
    run_git(dir.path(), &["config", "user.email", "test@test.invalid"]).await;
    std::fs::write(dir.path().join("README.md"), "fixture\n").unwrap();
    run_git(dir.path(), &["add", "-A"]).await;
    run_git(dir.path(), &["commit", "-m", "init"]).await;
    dir
}

async fn harness(
    runner: Arc<dyn AgentRunner>,
    max_parallel: usize,
    pool_capacity: usize,
) -> Harness {
    let repo = init_repo().await;
    let repo_path = repo.path().to_path_buf();

    let mut config = OrchestratorConfig::default();
    config.repo_path = repo_path.clone();
    config.scheduler.max_parallel_agents = max_parallel;
    config.workspace.max_global_worktrees = pool_capacity;
    config.workspace.bare_repo = Some(repo_path.clone());

    let store = StoreHandle::new(BoardStore::open_in_memory().unwrap());
    let git = Arc::new(GitManager::new(&repo_path, config.workspace.clone()));
    let bus = EventBus::default();
    let pool = Arc::new(WorkspacePool::new(
        store.clone(),
        Arc::clone(&git),
        bus.clone(),
        pool_capacity,
        &config.workspace.branch_prefix,
    ));
    let merge_queue = Arc::new(MergeQueue::new(
        store.clone(),
        Arc::clone(&git),
        Arc::clone(&pool),
        bus.clone(),
        config.workspace.max_merge_attempts,
    ));
    let refine = Arc::new(RefinementEngine::new(
        store.clone(),
        Arc::clone(&runner),
        config.scheduler.max_refinement_rounds,
    ));
    let scheduler = Scheduler::new(
        store.clone(),
        pool,
        git,
        merge_queue,
        runner,
        refine,
        bus,
        config,
    );
    Harness {
        _repo: repo,
        repo_path,
        store,
        scheduler,
        cancel: CancellationToken::new(),
    }
}

impl Harness {
    async fn add_ticket(&self, id: &str, domain: Domain, files: &[&str], deps: &[&str]) {
        let mut ticket = Ticket::new(id, &format!("Ticket {}", id), domain);
        ticket.status = TicketStatus::Ready;
        ticket.files = files.iter().map(|s| s.to_string()).collect();
        ticket.dependencies = deps.iter().map(|s| s.to_string()).collect();
        self.store
            .call(move |s| s.create_ticket(&ticket))
            .await
            .unwrap();
    }

    /// One cycle, then wait for every spawned task to finish.
    async fn cycle(&self) {
        self.scheduler.tick(&self.cancel).await.unwrap();
        self.settle().await;
    }

    async fn settle(&self) {
        for _ in 0..1000 {
            if self.scheduler.inflight() == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("spawned tasks did not settle");
    }

    async fn ticket(&self, id: &str) -> Ticket {
        let id = id.to_string();
        self.store
            .call(move |s| s.get_ticket(&id))
            .await
            .unwrap()
            .unwrap()
    }

    async fn status(&self, id: &str) -> TicketStatus {
        self.ticket(id).await.status
    }
}

fn history_statuses(ticket: &Ticket) -> Vec<String> {
    ticket.history.iter().map(|h| h.status.as_str()).collect()
}

#[tokio::test]
async fn happy_path_runs_the_full_stage_chain() {
    let mock = PipelineMock::new();
    let h = harness(mock, 1, 1).await;
    h.add_ticket("T1", Domain::Backend, &["api/users.go"], &[]).await;

    for _ in 0..8 {
        h.cycle().await;
        if h.status("T1").await == TicketStatus::Done {
            break;
        }
    }

    let ticket = h.ticket("T1").await;
    assert_eq!(ticket.status, TicketStatus::Done);
    assert_eq!(
        history_statuses(&ticket),
        vec!["ready", "in_dev", "in_qa", "in_ux", "in_sec", "pm_review", "done"],
    );
    assert!(ticket.signoffs.all_signed(&[]), "every stage signed off");

    let merges = h
        .store
        .call(|s| s.merge_entries_for_ticket("T1"))
        .await
        .unwrap();
    assert_eq!(merges.len(), 1);
    assert_eq!(merges[0].status, MergeStatus::Completed);

    // The dev agent's file landed on trunk through the squash merge.
    assert!(h.repo_path.join("T1.txt").exists());

    // Pool entry lifecycle finished in cleanup.
    let entry = h.store.call(|s| s.get_pool_entry("T1")).await.unwrap();
    assert!(entry.is_none(), "pool entry cleaned up after merge");
}

#[tokio::test]
async fn conflicting_tickets_enter_dev_one_at_a_time() {
    let mock = PipelineMock::new();
    let h = harness(mock, 2, 2).await;
    h.add_ticket("T1", Domain::Backend, &["pkg/a/*"], &[]).await;
    h.add_ticket("T2", Domain::Backend, &["pkg/a/b.go"], &[]).await;

    h.cycle().await;
    let t1 = h.ticket("T1").await;
    assert!(
        history_statuses(&t1).contains(&"in_dev".to_string()),
        "T1 admitted in the first cycle",
    );
    assert_eq!(
        h.status("T2").await,
        TicketStatus::Ready,
        "overlapping files keep T2 out of dev while T1 holds it",
    );

    // T1 advanced out of dev, so T2 is now admissible.
    assert_eq!(h.status("T1").await, TicketStatus::InQa);
    h.cycle().await;
    let t2 = h.ticket("T2").await;
    assert!(
        history_statuses(&t2).contains(&"in_dev".to_string()),
        "T2 admitted once the overlap cleared",
    );
}

#[tokio::test]
async fn unmet_and_unknown_dependencies_block_admission() {
    let mock = PipelineMock::new();
    let h = harness(mock, 2, 2).await;
    h.add_ticket("T1", Domain::Backend, &["a/*"], &["T-ghost"]).await;
    h.cycle().await;
    assert_eq!(
        h.status("T1").await,
        TicketStatus::Ready,
        "unknown dependency is conservatively unmet",
    );
}

#[tokio::test]
async fn qa_failure_reworks_the_ticket() {
    let mock = PipelineMock::new();
    let h = harness(Arc::clone(&mock) as Arc<dyn AgentRunner>, 1, 1).await;
    h.add_ticket("T1", Domain::Backend, &["api/*"], &[]).await;
    mock.fail_next(
        AgentRole::Qa,
        r#"{"status": "failed", "severity": "high", "reason": "edge case missing"}"#,
    );

    h.cycle().await;
    assert_eq!(h.status("T1").await, TicketStatus::InQa);
    let before = h.ticket("T1").await;
    assert!(before.signoffs.dev.is_some());

    // QA fails: bug recorded, dev signoff cleared, back to IN_DEV.
    h.cycle().await;
    let reworked = h.ticket("T1").await;
    assert_eq!(reworked.status, TicketStatus::InDev);
    assert!(reworked.signoffs.dev.is_none());
    assert_eq!(reworked.bugs.len(), 1);
    assert_eq!(reworked.bugs[0].found_by, "qa");
    assert_eq!(reworked.bugs[0].severity, "high");

    // Next cycle re-dispatches dev and the ticket moves forward again.
    h.cycle().await;
    assert_eq!(h.status("T1").await, TicketStatus::InQa);
}

#[tokio::test]
async fn pool_backpressure_holds_third_ticket_in_ready() {
    let mock = PipelineMock::new();
    let h = harness(mock, 3, 2).await;
    h.add_ticket("T1", Domain::Backend, &["a/*"], &[]).await;
    h.add_ticket("T2", Domain::Frontend, &["b/*"], &[]).await;
    h.add_ticket("T3", Domain::Infra, &["c/*"], &[]).await;

    h.cycle().await;
    for id in ["T1", "T2"] {
        let ticket = h.ticket(id).await;
        assert!(
            history_statuses(&ticket).contains(&"in_dev".to_string()),
            "{} admitted in the first cycle",
            id,
        );
    }
    assert_eq!(
        h.status("T3").await,
        TicketStatus::Ready,
        "pool capacity 2 refuses the third workspace",
    );

    // Drive T1 and T2 to completion; their slots free up.
    for _ in 0..8 {
        h.cycle().await;
        if h.status("T1").await == TicketStatus::Done
            && h.status("T2").await == TicketStatus::Done
        {
            break;
        }
    }
    assert_eq!(h.status("T1").await, TicketStatus::Done);

    for _ in 0..4 {
        h.cycle().await;
        if h.status("T3").await != TicketStatus::Ready {
            break;
        }
    }
    assert_ne!(h.status("T3").await, TicketStatus::Ready, "slot freed, T3 admitted");
}

#[tokio::test]
async fn merge_retry_succeeds_on_second_attempt() {
    let mock = PipelineMock::new();
    let h = harness(mock, 1, 1).await;
    h.add_ticket("T1", Domain::Backend, &["api/*"], &[]).await;

    // Drive to PM_REVIEW with the merge queued.
    for _ in 0..6 {
        h.cycle().await;
        let merges = h
            .store
            .call(|s| s.merge_entries_for_ticket("T1"))
            .await
            .unwrap();
        if !merges.is_empty() {
            break;
        }
    }
    let merges = h
        .store
        .call(|s| s.merge_entries_for_ticket("T1"))
        .await
        .unwrap();
    assert_eq!(merges.len(), 1, "merge queued after pm signoff");

    // Sabotage attempt 1: an uncommitted conflicting file on trunk makes
    // the squash merge refuse.
    std::fs::write(h.repo_path.join("T1.txt"), "conflicting local edit\n").unwrap();
    h.cycle().await;
    let after_first = h
        .store
        .call(|s| s.merge_entries_for_ticket("T1"))
        .await
        .unwrap();
    assert_eq!(after_first[0].status, MergeStatus::Pending, "returned to pending");
    assert_eq!(after_first[0].attempts, 1);
    assert!(after_first[0].last_error.is_some());

    // Clear the sabotage; attempt 2 completes and the ticket lands DONE.
    std::fs::remove_file(h.repo_path.join("T1.txt")).unwrap();
    run_git(&h.repo_path, &["checkout", "--", "."]).await;
    for _ in 0..3 {
        h.cycle().await;
        if h.status("T1").await == TicketStatus::Done {
            break;
        }
    }
    let final_entry = h
        .store
        .call(|s| s.merge_entries_for_ticket("T1"))
        .await
        .unwrap();
    assert_eq!(final_entry.len(), 1);
    assert_eq!(final_entry[0].status, MergeStatus::Completed);
    assert_eq!(final_entry[0].attempts, 2);
    assert!(final_entry[0].last_error.is_none(), "last error cleared on success");
    assert_eq!(h.status("T1").await, TicketStatus::Done);
    let done_entries = h
        .ticket("T1")
        .await
        .history
        .iter()
        .filter(|e| e.status == TicketStatus::Done)
        .count();
    assert_eq!(done_entries, 1, "ticket completed exactly once");
}

#[tokio::test]
async fn orphaned_runs_recover_on_startup() {
    let mock = PipelineMock::new();
    let h = harness(mock, 2, 2).await;
    h.add_ticket("T1", Domain::Backend, &["a/*"], &[]).await;
    h.add_ticket("T2", Domain::Frontend, &["b/*"], &[]).await;

    // Simulate a previous session that died mid-run.
    for id in ["T1", "T2"] {
        let id = id.to_string();
        h.store
            .call(move |s| {
                s.update_status(&id, &TicketStatus::InDev, "scheduler", None)?;
                let run = AgentRun {
                    id: uuid::Uuid::new_v4(),
                    agent: AgentRole::DevBackend,
                    ticket_id: id.clone(),
                    workspace_path: None,
                    started_at: chrono::Utc::now(),
                    ended_at: None,
                    status: RunStatus::Running,
                    output: None,
                };
                s.add_run(&run)
            })
            .await
            .unwrap();
    }

    let recovered = h.scheduler.recover().await.unwrap();
    assert_eq!(recovered, 2);
    let runs = h.store.call(|s| s.recent_runs()).await.unwrap();
    assert!(runs.iter().all(|r| r.status == RunStatus::Failed));
    assert!(runs.iter().all(|r| r.output.as_deref() == Some(ORPHAN_NOTE)));

    // One tick re-dispatches dev agents; nothing stays stuck in IN_DEV.
    h.cycle().await;
    assert_eq!(h.status("T1").await, TicketStatus::InQa);
    assert_eq!(h.status("T2").await, TicketStatus::InQa);
}

#[tokio::test]
async fn refinement_flow_promotes_approved_ticket_to_children() {
    struct RefineMock;

    #[async_trait]
    impl AgentRunner for RefineMock {
        async fn invoke(
            &self,
            invocation: AgentInvocation<'_>,
            _cancel: &CancellationToken,
        ) -> Result<AgentOutcome, ProviderError> {
            use conveyor::agent::Purpose;
            let output = match invocation.purpose {
                Purpose::Refine { .. } if invocation.role != AgentRole::Pm => {
                    r#"{"response": "scope is clear", "approves": true}"#.to_string()
                }
                Purpose::Breakdown => r#"[
                    {"title": "backend half", "domain": "backend", "files": ["api/x.rs"]},
                    {"title": "frontend half", "domain": "frontend", "files": ["ui/x.tsx"]}
                ]"#
                .to_string(),
                _ => "<promise>ok</promise>".to_string(),
            };
            Ok(AgentOutcome {
                verdict: detect_verdict(&output),
                output,
                tokens_in: 5,
                tokens_out: 5,
            })
        }
    }

    let h = harness(Arc::new(RefineMock), 2, 2).await;
    {
        let mut ticket = Ticket::new("T-PRD", "Big feature", Domain::Backend);
        ticket.status = TicketStatus::Approved;
        h.store
            .call(move |s| s.create_ticket(&ticket))
            .await
            .unwrap();
    }

    // Tick 1: APPROVED -> REFINING, round runs to consensus.
    h.cycle().await;
    assert_eq!(h.status("T-PRD").await, TicketStatus::PrdComplete);

    // Tick 2: PRD_COMPLETE -> BREAKING_DOWN, children created READY.
    h.cycle().await;
    assert_eq!(h.status("T-PRD").await, TicketStatus::BreakingDown);
    let children = h
        .store
        .call(|s| s.list_by_parent("T-PRD"))
        .await
        .unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.status == TicketStatus::Ready));
    assert!(children.iter().all(|c| c.parallel_group.is_some()));
}

#[tokio::test]
async fn control_surface_start_stop_status() {
    use conveyor::scheduler::control::Orchestrator;

    let repo = init_repo().await;
    let repo_path = repo.path().to_path_buf();
    let mut config = OrchestratorConfig::default();
    config.repo_path = repo_path.clone();
    config.scheduler.cycle_interval_secs = 1;
    config.workspace.bare_repo = Some(repo_path.clone());

    let store = StoreHandle::new(BoardStore::open_in_memory().unwrap());
    let git = Arc::new(GitManager::new(&repo_path, config.workspace.clone()));
    let bus = EventBus::default();
    let pool = Arc::new(WorkspacePool::new(
        store.clone(),
        Arc::clone(&git),
        bus.clone(),
        config.workspace.max_global_worktrees,
        &config.workspace.branch_prefix,
    ));
    let merge_queue = Arc::new(MergeQueue::new(
        store.clone(),
        Arc::clone(&git),
        Arc::clone(&pool),
        bus.clone(),
        config.workspace.max_merge_attempts,
    ));
    let runner: Arc<dyn AgentRunner> = PipelineMock::new();
    let refine = Arc::new(RefinementEngine::new(
        store.clone(),
        Arc::clone(&runner),
        config.scheduler.max_refinement_rounds,
    ));
    let orchestrator = Orchestrator::new(
        store, pool, git, merge_queue, runner, refine, bus, config,
    );

    assert!(orchestrator.stop().await.is_err(), "stop before start errors");
    orchestrator.start().await.unwrap();
    assert!(orchestrator.start().await.is_err(), "second start errors");

    let status = orchestrator.status().await;
    assert!(status.running);
    assert!(status.started_at.is_some());

    // Let at least one cycle fire before stopping.
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    let metrics = orchestrator.stop().await.unwrap();
    assert!(metrics.cycles >= 1);

    let stopped = orchestrator.status().await;
    assert!(!stopped.running);
    assert!(stopped.started_at.is_none());
    assert_eq!(stopped.metrics.cycles, metrics.cycles);
}

#[tokio::test]
async fn cancelled_scheduler_reports_metrics() {
    let mock = PipelineMock::new();
    let h = harness(mock, 1, 1).await;
    h.add_ticket("T1", Domain::Backend, &["a/*"], &[]).await;

    h.cycle().await;
    h.cancel.cancel();
    let metrics = h.scheduler.metrics().snapshot();
    assert!(metrics.cycles >= 1);
    assert!(metrics.spawned >= 1);
    assert_eq!(metrics.failed, 0);
}
