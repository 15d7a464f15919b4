//! The cycle engine: a tick-driven state machine that advances tickets
//! through the pipeline under concurrency, dependency, conflict, and
//! resource constraints.
//!
//! The scheduler never executes agents inline. Each dispatch acquires a
//! permit from the global worker semaphore and spawns onto a task tracker;
//! the spawned task reconciles its outcome through the store when it
//! finishes. Failures inside a task never escape the task.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::agent::cli::OutputVerdict;
use crate::agent::{AgentInvocation, AgentOutcome, AgentRunner, Purpose};
use crate::board::health::system_health;
use crate::board::models::*;
use crate::board::store::StoreHandle;
use crate::config::OrchestratorConfig;
use crate::errors::{ErrorCategory, SchedulerError};
use crate::events::{EventBus, OrchestratorEvent};
use crate::refine::{RefinementEngine, RoundOutcome};
use crate::workspace::git::GitManager;
use crate::workspace::merge::{MergeOutcome, MergeQueue};
use crate::workspace::pool::WorkspacePool;

const ACTOR: &str = "scheduler";

/// Counters reported through the control surface.
#[derive(Debug, Default)]
pub struct Metrics {
    pub cycles: AtomicU64,
    pub spawned: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub tickets_completed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub cycles: u64,
    pub spawned: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub tickets_completed: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            spawned: self.spawned.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            tickets_completed: self.tickets_completed.load(Ordering::Relaxed),
        }
    }
}

pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    store: StoreHandle,
    pool: Arc<WorkspacePool>,
    git: Arc<GitManager>,
    merge_queue: Arc<MergeQueue>,
    runner: Arc<dyn AgentRunner>,
    refine: Arc<RefinementEngine>,
    bus: EventBus,
    config: OrchestratorConfig,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    metrics: Arc<Metrics>,
    /// Tickets with a refinement or breakdown task in flight. Stage agents
    /// are guarded through the run table instead.
    busy: std::sync::Mutex<HashSet<String>>,
    last_health: std::sync::Mutex<Option<String>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StoreHandle,
        pool: Arc<WorkspacePool>,
        git: Arc<GitManager>,
        merge_queue: Arc<MergeQueue>,
        runner: Arc<dyn AgentRunner>,
        refine: Arc<RefinementEngine>,
        bus: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.scheduler.max_parallel_agents));
        Self {
            inner: Arc::new(Inner {
                store,
                pool,
                git,
                merge_queue,
                runner,
                refine,
                bus,
                config,
                workers,
                tracker: TaskTracker::new(),
                metrics: Arc::new(Metrics::default()),
                busy: std::sync::Mutex::new(HashSet::new()),
                last_health: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Spawned tasks not yet finished. Lets callers step cycles
    /// deterministically.
    pub fn inflight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Startup reconciliation: orphaned runs are failed with a sentinel
    /// note and the pool is flushed of stale cleanup entries.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let recovered = self.inner.store.call(|s| s.recover_orphan_runs()).await?;
        if recovered > 0 {
            tracing::warn!(recovered, "recovered orphaned runs from previous session");
        }
        self.inner
            .pool
            .reconcile(self.inner.config.workspace.cleanup_worktree_on_merge)
            .await?;
        Ok(recovered)
    }

    /// The supervising loop. Ticks until cancelled, then waits bounded for
    /// in-flight tasks to observe cancellation.
    pub async fn run(&self, cancel: CancellationToken) -> Result<MetricsSnapshot, SchedulerError> {
        self.recover().await?;
        let mut interval = tokio::time::interval(self.inner.config.cycle_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.tick(&cancel).await {
                tracing::error!(error = %e, "cycle failed, retrying next tick");
            }
        }
        self.inner.tracker.close();
        let drain = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            self.inner.tracker.wait(),
        );
        if drain.await.is_err() {
            tracing::warn!("in-flight agent tasks did not finish within the shutdown bound");
        }
        Ok(self.inner.metrics.snapshot())
    }

    /// One scheduling cycle. Public so tests can drive cycles directly.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        inner.metrics.cycles.fetch_add(1, Ordering::Relaxed);

        self.housekeeping().await?;
        self.process_merges().await?;
        self.refinement_sweep(cancel).await?;
        self.breakdown_sweep(cancel).await?;
        self.stage_sweep(cancel).await?;
        self.admission_sweep(cancel).await?;
        self.pm_review_sweep(cancel).await?;
        self.publish_health().await?;
        Ok(())
    }

    async fn housekeeping(&self) -> Result<(), SchedulerError> {
        let retention = chrono::Duration::hours(self.inner.config.scheduler.run_retention_hours as i64);
        let stale_age = self.inner.config.stale_run_age();
        let (purged, stale) = self
            .inner
            .store
            .call(move |s| {
                let purged = s.purge_finished_runs(retention)?;
                let stale = s.fail_stale_runs(stale_age)?;
                Ok((purged, stale))
            })
            .await?;
        if purged > 0 || stale > 0 {
            tracing::debug!(purged, stale, "housekeeping");
        }
        self.inner
            .pool
            .reconcile(self.inner.config.workspace.cleanup_worktree_on_merge)
            .await?;
        Ok(())
    }

    /// Drain the merge queue and reconcile outcomes onto tickets.
    async fn process_merges(&self) -> Result<(), SchedulerError> {
        for outcome in self.inner.merge_queue.drain().await {
            match outcome {
                MergeOutcome::Completed { ticket_id } => {
                    self.transition(&ticket_id, TicketStatus::Done, Some("merge completed"))
                        .await?;
                    self.inner
                        .pool
                        .cleanup(
                            &ticket_id,
                            self.inner.config.workspace.cleanup_worktree_on_merge,
                        )
                        .await?;
                    self.inner
                        .metrics
                        .tickets_completed
                        .fetch_add(1, Ordering::Relaxed);
                    self.inner.bus.publish(OrchestratorEvent::TicketCompleted {
                        ticket_id: ticket_id.clone(),
                    });
                    self.complete_parent_if_ready(&ticket_id).await?;
                }
                MergeOutcome::Retrying { ticket_id, attempts } => {
                    tracing::info!(ticket_id, attempts, "merge will retry next cycle");
                }
                MergeOutcome::Failed { ticket_id, error } => {
                    self.rework(
                        &ticket_id,
                        AgentRole::Pm,
                        &format!("merge failed terminally: {}", error),
                        "critical",
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// When a child finishes, check whether its parent's brood is done.
    async fn complete_parent_if_ready(&self, child_id: &str) -> Result<(), SchedulerError> {
        let child = {
            let id = child_id.to_string();
            self.inner.store.call(move |s| s.get_ticket(&id)).await?
        };
        let Some(parent_id) = child.and_then(|c| c.parent_id) else {
            return Ok(());
        };
        let (parent, children) = {
            let parent_id = parent_id.clone();
            self.inner
                .store
                .call(move |s| {
                    let parent = s.get_ticket(&parent_id)?;
                    let children = s.list_by_parent(&parent_id)?;
                    Ok((parent, children))
                })
                .await?
        };
        if let Some(parent) = parent
            && parent.status == TicketStatus::BreakingDown
            && !children.is_empty()
            && children.iter().all(|c| c.status == TicketStatus::Done)
        {
            self.transition(&parent.id, TicketStatus::PmReview, Some("all children done"))
                .await?;
        }
        Ok(())
    }

    async fn refinement_sweep(&self, cancel: &CancellationToken) -> Result<(), SchedulerError> {
        // APPROVED tickets enter refinement.
        let approved = self
            .inner
            .store
            .call(|s| s.list_by_status(&TicketStatus::Approved))
            .await?;
        for ticket in approved {
            self.transition(&ticket.id, TicketStatus::Refining, Some("refinement begins"))
                .await?;
        }

        let mut refining = self
            .inner
            .store
            .call(|s| s.list_by_status(&TicketStatus::Refining))
            .await?;
        refining.extend(self.inner.store.call(|s| s.list_refining_rounds()).await?);
        // Expert-consultation tickets rejoin the round loop.
        refining.extend(
            self.inner
                .store
                .call(|s| s.list_by_status(&TicketStatus::NeedsExpert))
                .await?,
        );

        for ticket in refining {
            if !self.claim(&ticket.id) {
                continue;
            }
            let Some(permit) = self.try_permit(&ticket.id) else {
                self.release(&ticket.id);
                break;
            };
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            self.inner.tracker.spawn(async move {
                let _permit = permit;
                let outcome = inner.refine.run_round(&ticket, &cancel).await;
                let next = match outcome {
                    Ok(RoundOutcome::Consensus) => {
                        Some((TicketStatus::PrdComplete, "experts reached consensus".to_string()))
                    }
                    Ok(RoundOutcome::ReadyDirect) => {
                        Some((TicketStatus::Ready, "fully specified".to_string()))
                    }
                    Ok(RoundOutcome::NeedsExpert) => Some((
                        TicketStatus::NeedsExpert,
                        "domain consultation required".to_string(),
                    )),
                    Ok(RoundOutcome::NextRound(n)) => {
                        Some((TicketStatus::RefiningRound(n), format!("no consensus, round {}", n)))
                    }
                    Ok(RoundOutcome::UserQuestion(q)) => {
                        Some((TicketStatus::AwaitingUser, format!("user question: {}", q)))
                    }
                    Ok(RoundOutcome::RoundCapReached) => Some((
                        TicketStatus::AwaitingUser,
                        "refinement round cap reached".to_string(),
                    )),
                    Err(e) => {
                        tracing::warn!(ticket = %ticket.id, error = %e, "refinement round failed");
                        None
                    }
                };
                if let Some((status, note)) = next {
                    if let Err(e) =
                        Inner::transition_on(&inner, &ticket.id, status, Some(note.as_str())).await
                    {
                        tracing::error!(ticket = %ticket.id, error = %e, "refinement transition failed");
                    }
                }
                inner.release_ticket(&ticket.id);
            });
        }
        Ok(())
    }

    async fn breakdown_sweep(&self, cancel: &CancellationToken) -> Result<(), SchedulerError> {
        let complete = self
            .inner
            .store
            .call(|s| s.list_by_status(&TicketStatus::PrdComplete))
            .await?;
        for ticket in complete {
            self.transition(&ticket.id, TicketStatus::BreakingDown, Some("breaking down PRD"))
                .await?;
        }

        let breaking = self
            .inner
            .store
            .call(|s| s.list_by_status(&TicketStatus::BreakingDown))
            .await?;
        for ticket in breaking {
            let children = {
                let id = ticket.id.clone();
                self.inner.store.call(move |s| s.list_by_parent(&id)).await?
            };
            if !children.is_empty() {
                if children.iter().all(|c| c.status == TicketStatus::Done) {
                    self.transition(&ticket.id, TicketStatus::PmReview, Some("all children done"))
                        .await?;
                }
                continue;
            }
            if !self.claim(&ticket.id) {
                continue;
            }
            let Some(permit) = self.try_permit(&ticket.id) else {
                self.release(&ticket.id);
                break;
            };
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            self.inner.tracker.spawn(async move {
                let _permit = permit;
                if let Err(e) = inner.refine.breakdown(&ticket, &cancel).await {
                    tracing::warn!(ticket = %ticket.id, error = %e, "breakdown failed");
                }
                inner.release_ticket(&ticket.id);
            });
        }
        Ok(())
    }

    /// Re-dispatch stage agents for tickets sitting in a build or review
    /// stage without a run in flight. Covers both normal advancement and
    /// orphan recovery.
    async fn stage_sweep(&self, cancel: &CancellationToken) -> Result<(), SchedulerError> {
        let stages = [
            (TicketStatus::InDev, None),
            (TicketStatus::InQa, Some(AgentRole::Qa)),
            (TicketStatus::InUx, Some(AgentRole::Ux)),
            (TicketStatus::InSec, Some(AgentRole::Security)),
        ];
        // Snapshot every stage list before dispatching anything, so a task
        // finishing mid-sweep cannot get its ticket a second agent this
        // cycle.
        let mut pending = Vec::new();
        for (status, fixed_role) in stages {
            let tickets = self
                .inner
                .store
                .call(move |s| s.list_by_status(&status))
                .await?;
            for ticket in tickets {
                let role = fixed_role.unwrap_or_else(|| ticket.domain.dev_role());
                pending.push((ticket, role));
            }
        }
        for (ticket, role) in pending {
            let running = {
                let id = ticket.id.clone();
                self.inner
                    .store
                    .call(move |s| s.is_agent_running(&id, role))
                    .await?
            };
            if running {
                continue;
            }
            self.spawn_stage(ticket, role, Purpose::Stage, cancel).await?;
        }
        Ok(())
    }

    /// Admission: READY tickets move to IN_DEV when dependencies are done,
    /// no file pattern overlaps an IN_DEV ticket, the in-progress bound has
    /// room, and the workspace pool admits them.
    async fn admission_sweep(&self, cancel: &CancellationToken) -> Result<(), SchedulerError> {
        let mut ready = self.inner.store.call(|s| s.list_ready()).await?;
        if ready.is_empty() {
            return Ok(());
        }
        // Sub-tickets carry a parallel-group hint: lower groups dispatch
        // first, and conflict detection keeps same-group members apart
        // when the planner got it wrong.
        ready.sort_by_key(|t| (t.priority, t.parallel_group.unwrap_or(0), t.created_at));
        for ticket in ready {
            let in_progress = self.inner.store.call(|s| s.in_progress_count()).await?;
            if in_progress >= self.inner.config.scheduler.max_parallel_agents as i64 {
                break;
            }
            let admissible = {
                let candidate = ticket.clone();
                self.inner
                    .store
                    .call(move |s| {
                        if !s.dependencies_done(&candidate)? {
                            return Ok(false);
                        }
                        let in_dev = s.list_by_status(&TicketStatus::InDev)?;
                        Ok(!in_dev
                            .iter()
                            .any(|t| crate::conflict::tickets_conflict(&candidate.files, &t.files)))
                    })
                    .await?
            };
            if !admissible {
                continue;
            }
            let role = ticket.domain.dev_role();
            let dev_running = {
                let id = ticket.id.clone();
                self.inner
                    .store
                    .call(move |s| s.is_agent_running(&id, role))
                    .await?
            };
            if dev_running {
                continue;
            }

            // Reserve a workspace slot; a full pool leaves the ticket in
            // READY for the next cycle without consuming this one.
            let entry = match self.inner.pool.allocate(&ticket.id, &ticket.title, role).await {
                Ok(entry) => entry,
                Err(e) if e.category() == ErrorCategory::Capacity => continue,
                Err(e) => return Err(e.into()),
            };
            {
                let id = ticket.id.clone();
                let path = entry.path.clone();
                let branch = entry.branch.clone();
                self.inner
                    .store
                    .call(move |s| {
                        s.set_workspace(&id, Some(&path), Some(&branch))?;
                        s.assign_agent(&id, Some(role))
                    })
                    .await?;
            }
            self.transition(&ticket.id, TicketStatus::InDev, Some("admitted to development"))
                .await?;
            let mut admitted = ticket;
            admitted.status = TicketStatus::InDev;
            admitted.workspace_path = Some(entry.path.clone());
            admitted.branch = Some(entry.branch.clone());
            self.spawn_stage(admitted, role, Purpose::Stage, cancel).await?;
        }
        Ok(())
    }

    /// PM verification for tickets whose review chain is complete, then the
    /// handoff to the merge queue.
    async fn pm_review_sweep(&self, cancel: &CancellationToken) -> Result<(), SchedulerError> {
        let tickets = self
            .inner
            .store
            .call(|s| s.list_by_status(&TicketStatus::PmReview))
            .await?;
        for ticket in tickets {
            // A branch already handed to the queue is past verification;
            // the merge outcome drives the next transition. This covers
            // both PM-approved tickets and the merge_after_dev_signoff
            // fast path, which parks tickets here while the queue works.
            let merges = {
                let id = ticket.id.clone();
                self.inner
                    .store
                    .call(move |s| s.merge_entries_for_ticket(&id))
                    .await?
            };
            if merges.iter().any(|e| !e.status.is_terminal()) {
                continue;
            }
            let skipped = self.skipped_stages();
            let pre_pm_signed = Stage::ALL
                .iter()
                .filter(|s| **s != Stage::Pm && !skipped.contains(s))
                .all(|s| ticket.signoffs.get(*s).is_some());
            if self.inner.config.scheduler.require_all_signoffs && !pre_pm_signed {
                tracing::warn!(ticket = %ticket.id, "in PM review without complete signoffs");
                continue;
            }
            if ticket.signoffs.pm.is_some() {
                // Signed off; waiting on the merge queue. Parents without a
                // branch complete directly.
                if ticket.branch.is_none() {
                    self.transition(&ticket.id, TicketStatus::Done, Some("pm approved, no branch"))
                        .await?;
                    self.inner
                        .metrics
                        .tickets_completed
                        .fetch_add(1, Ordering::Relaxed);
                    self.inner.bus.publish(OrchestratorEvent::TicketCompleted {
                        ticket_id: ticket.id.clone(),
                    });
                }
                continue;
            }
            let running = {
                let id = ticket.id.clone();
                self.inner
                    .store
                    .call(move |s| s.is_agent_running(&id, AgentRole::Pm))
                    .await?
            };
            if running {
                continue;
            }
            self.spawn_stage(ticket, AgentRole::Pm, Purpose::PmVerify, cancel)
                .await?;
        }
        Ok(())
    }

    async fn publish_health(&self) -> Result<(), SchedulerError> {
        let tickets = self.inner.store.call(|s| s.list_all()).await?;
        let health = system_health(&tickets).as_str().to_string();
        let changed = {
            let mut last = self
                .inner
                .last_health
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if last.as_deref() != Some(&health) {
                *last = Some(health.clone());
                true
            } else {
                false
            }
        };
        if changed {
            self.inner
                .bus
                .publish(OrchestratorEvent::HealthChanged { health });
        }
        Ok(())
    }

    // ── Dispatch ──────────────────────────────────────────────────────

    fn try_permit(&self, ticket_id: &str) -> Option<tokio::sync::OwnedSemaphorePermit> {
        match Arc::clone(&self.inner.workers).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                tracing::debug!(ticket_id, "worker pool saturated, skipping this cycle");
                None
            }
        }
    }

    fn claim(&self, ticket_id: &str) -> bool {
        self.inner
            .busy
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(ticket_id.to_string())
    }

    fn release(&self, ticket_id: &str) {
        self.inner.release_ticket(ticket_id);
    }

    async fn spawn_stage(
        &self,
        ticket: Ticket,
        role: AgentRole,
        purpose: Purpose,
        cancel: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let Some(permit) = self.try_permit(&ticket.id) else {
            return Ok(());
        };
        let run = AgentRun {
            id: Uuid::new_v4(),
            agent: role,
            ticket_id: ticket.id.clone(),
            workspace_path: ticket.workspace_path.clone(),
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Running,
            output: None,
        };
        {
            let run = run.clone();
            self.inner.store.call(move |s| s.add_run(&run)).await?;
        }
        self.inner.metrics.spawned.fetch_add(1, Ordering::Relaxed);
        self.inner.bus.publish(OrchestratorEvent::RunStarted {
            ticket_id: ticket.id.clone(),
            agent: role,
            run_id: run.id.to_string(),
        });

        let inner = Arc::clone(&self.inner);
        let cancel = cancel.clone();
        self.inner.tracker.spawn(async move {
            let _permit = permit;
            Inner::execute_stage(inner, ticket, role, purpose, run.id, cancel).await;
        });
        Ok(())
    }

    async fn transition(
        &self,
        ticket_id: &str,
        status: TicketStatus,
        note: Option<&str>,
    ) -> Result<(), SchedulerError> {
        Inner::transition_on(&self.inner, ticket_id, status, note).await
    }

    async fn rework(
        &self,
        ticket_id: &str,
        found_by: AgentRole,
        description: &str,
        severity: &str,
    ) -> Result<(), SchedulerError> {
        Inner::rework_on(&self.inner, ticket_id, found_by, description, severity).await
    }

    fn skipped_stages(&self) -> Vec<Stage> {
        self.inner.config.scheduler.skip_stages.clone()
    }
}

impl Inner {
    fn release_ticket(&self, ticket_id: &str) {
        self.busy
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(ticket_id);
    }

    /// Status for the stage after `stage`, honouring skipped stages.
    fn next_status_after(&self, stage: Stage) -> TicketStatus {
        let chain = [
            (Stage::Qa, TicketStatus::InQa),
            (Stage::Ux, TicketStatus::InUx),
            (Stage::Security, TicketStatus::InSec),
        ];
        let start = match stage {
            Stage::Dev => 0,
            Stage::Qa => 1,
            Stage::Ux => 2,
            Stage::Security | Stage::Pm => 3,
        };
        for (candidate, status) in chain.iter().skip(start) {
            if !self.config.stage_skipped(*candidate) {
                return status.clone();
            }
        }
        TicketStatus::PmReview
    }

    async fn transition_on(
        inner: &Arc<Inner>,
        ticket_id: &str,
        status: TicketStatus,
        note: Option<&str>,
    ) -> Result<(), SchedulerError> {
        let from = {
            let id = ticket_id.to_string();
            inner
                .store
                .call(move |s| s.get_ticket(&id))
                .await?
                .map(|t| t.status)
        };
        {
            let id = ticket_id.to_string();
            let status = status.clone();
            let note = note.map(String::from);
            inner
                .store
                .call(move |s| s.update_status(&id, &status, ACTOR, note.as_deref()))
                .await?;
        }
        if let Some(from) = from {
            inner.bus.publish(OrchestratorEvent::TicketTransitioned {
                ticket_id: ticket_id.to_string(),
                from,
                to: status.clone(),
                actor: ACTOR.to_string(),
            });
        }
        tracing::info!(ticket_id, status = %status, "ticket transitioned");
        Ok(())
    }

    /// Route a ticket back to IN_DEV: record the bug and clear the dev
    /// signoff along with everything downstream of it.
    async fn rework_on(
        inner: &Arc<Inner>,
        ticket_id: &str,
        found_by: AgentRole,
        description: &str,
        severity: &str,
    ) -> Result<(), SchedulerError> {
        {
            let id = ticket_id.to_string();
            let bug = Bug {
                description: description.to_string(),
                severity: severity.to_string(),
                found_by: found_by.as_str().to_string(),
                created_at: Utc::now(),
            };
            inner
                .store
                .call(move |s| {
                    s.add_bug(&id, bug)?;
                    s.clear_signoff(&id, Stage::Dev)?;
                    for stage in Stage::Dev.downstream() {
                        s.clear_signoff(&id, *stage)?;
                    }
                    Ok(())
                })
                .await?;
        }
        Inner::transition_on(
            inner,
            ticket_id,
            TicketStatus::InDev,
            Some(&format!("rework: {}", description)),
        )
        .await
    }

    /// Body of a spawned stage task: invoke the agent, then reconcile the
    /// outcome onto the run record and the ticket.
    async fn execute_stage(
        inner: Arc<Inner>,
        ticket: Ticket,
        role: AgentRole,
        purpose: Purpose,
        run_id: Uuid,
        cancel: CancellationToken,
    ) {
        let workspace = ticket.workspace_path.as_ref().map(std::path::PathBuf::from);
        if workspace.is_some() {
            let _ = inner.pool.touch(&ticket.id).await;
        }
        let invocation = AgentInvocation {
            run_id,
            ticket: &ticket,
            role,
            purpose: purpose.clone(),
            workspace,
            extra_context: String::new(),
        };
        let result = inner.runner.invoke(invocation, &cancel).await;

        let run_status = match &result {
            Ok(outcome) if outcome.verdict != OutputVerdict::Failed => RunStatus::Success,
            _ => RunStatus::Failed,
        };
        {
            let output = match &result {
                Ok(outcome) => Some(outcome.output.clone()),
                Err(e) => Some(e.to_string()),
            };
            let store_result = inner
                .store
                .call(move |s| s.complete_run(run_id, run_status, output.as_deref()))
                .await;
            if let Err(e) = store_result {
                tracing::error!(ticket = %ticket.id, error = %e, "failed to record run completion");
            }
        }
        match run_status {
            RunStatus::Success => inner.metrics.succeeded.fetch_add(1, Ordering::Relaxed),
            _ => inner.metrics.failed.fetch_add(1, Ordering::Relaxed),
        };
        inner.bus.publish(OrchestratorEvent::RunFinished {
            ticket_id: ticket.id.clone(),
            agent: role,
            run_id: run_id.to_string(),
            status: run_status,
        });

        let applied = match result {
            Ok(outcome) => Inner::apply_outcome(&inner, &ticket, role, &purpose, outcome).await,
            Err(e) => Inner::apply_error(&inner, &ticket, role, e).await,
        };
        if let Err(e) = applied {
            tracing::error!(ticket = %ticket.id, error = %e, "failed to apply agent outcome");
        }
    }

    async fn apply_outcome(
        inner: &Arc<Inner>,
        ticket: &Ticket,
        role: AgentRole,
        purpose: &Purpose,
        outcome: AgentOutcome,
    ) -> Result<(), SchedulerError> {
        match outcome.verdict {
            OutputVerdict::Failed => {
                let severity = crate::refine::extract_json(&outcome.output)
                    .and_then(|v| v.get("severity").and_then(|s| s.as_str()).map(String::from))
                    .unwrap_or_else(|| "high".to_string());
                let description = format!("{} stage reported failure", role.as_str());
                if severity == "critical" {
                    // Critical findings stop the line rather than loop it.
                    {
                        let id = ticket.id.clone();
                        let bug = Bug {
                            description: description.clone(),
                            severity,
                            found_by: role.as_str().to_string(),
                            created_at: Utc::now(),
                        };
                        inner.store.call(move |s| s.add_bug(&id, bug)).await?;
                    }
                    return Inner::transition_on(
                        inner,
                        &ticket.id,
                        TicketStatus::Blocked,
                        Some(&description),
                    )
                    .await;
                }
                Inner::rework_on(inner, &ticket.id, role, &description, &severity).await
            }
            OutputVerdict::NeedsReview => {
                Inner::transition_on(
                    inner,
                    &ticket.id,
                    TicketStatus::AwaitingUser,
                    Some("agent requested human review"),
                )
                .await
            }
            OutputVerdict::Unknown => {
                // No marker means no verdict; the run stands recorded and
                // the next cycle re-dispatches the stage.
                tracing::debug!(ticket = %ticket.id, role = %role, "output carried no status marker");
                Ok(())
            }
            OutputVerdict::Promised => Inner::apply_stage_pass(inner, ticket, role, purpose).await,
        }
    }

    async fn apply_stage_pass(
        inner: &Arc<Inner>,
        ticket: &Ticket,
        role: AgentRole,
        purpose: &Purpose,
    ) -> Result<(), SchedulerError> {
        let Some(stage) = role.signoff_stage() else {
            return Ok(());
        };
        {
            let id = ticket.id.clone();
            inner
                .store
                .call(move |s| s.add_signoff(&id, stage, Utc::now()))
                .await?;
        }

        match stage {
            Stage::Dev => {
                // Persist the agent's work before leaving the dev stage:
                // commit, bring the branch up to date with trunk, push. The
                // ticket must not advance past dev on an unpersisted branch.
                if let (Some(path), Some(branch)) = (&ticket.workspace_path, &ticket.branch) {
                    let path = std::path::PathBuf::from(path);
                    let message = format!("{}: {}", ticket.id, ticket.title);
                    let persisted = async {
                        inner.git.commit(&path, &message).await?;
                        inner.git.update_worktree(&path).await?;
                        inner.git.push(&path, branch).await
                    }
                    .await;
                    if let Err(e) = persisted {
                        // Dirty tree or failed rebase needs a human before
                        // this branch can move.
                        if e.category() == ErrorCategory::Conflict {
                            return Inner::transition_on(
                                inner,
                                &ticket.id,
                                TicketStatus::Blocked,
                                Some(&format!("workspace conflict: {}", e)),
                            )
                            .await;
                        }
                        // Transient git failure: stay in IN_DEV and let the
                        // next cycle re-run the dev stage.
                        tracing::warn!(
                            ticket = %ticket.id,
                            error = %e,
                            "failed to persist dev work, retrying next cycle"
                        );
                        return Ok(());
                    }
                }
                if inner.config.scheduler.merge_after_dev_signoff {
                    if let Some(branch) = &ticket.branch {
                        Inner::submit_merge(inner, &ticket.id, branch).await?;
                        return Inner::transition_on(
                            inner,
                            &ticket.id,
                            TicketStatus::PmReview,
                            Some("dev signoff, fast-path merge"),
                        )
                        .await;
                    }
                }
                let next = inner.next_status_after(Stage::Dev);
                Inner::transition_on(inner, &ticket.id, next, Some("dev signed off")).await
            }
            Stage::Qa | Stage::Ux | Stage::Security => {
                let next = inner.next_status_after(stage);
                Inner::transition_on(
                    inner,
                    &ticket.id,
                    next,
                    Some(&format!("{} signed off", stage.as_str())),
                )
                .await
            }
            Stage::Pm => {
                debug_assert!(matches!(purpose, Purpose::PmVerify | Purpose::Stage));
                match (&ticket.branch, inner.config.scheduler.auto_merge) {
                    (Some(branch), true) => {
                        Inner::submit_merge(inner, &ticket.id, branch).await?;
                        // DONE lands when the merge completes.
                        Ok(())
                    }
                    (Some(_), false) => {
                        tracing::info!(ticket = %ticket.id, "pm approved, waiting for operator merge");
                        Ok(())
                    }
                    (None, _) => {
                        // Parent tickets have no branch of their own.
                        Ok(())
                    }
                }
            }
        }
    }

    async fn submit_merge(
        inner: &Arc<Inner>,
        ticket_id: &str,
        branch: &str,
    ) -> Result<(), SchedulerError> {
        match inner.merge_queue.submit(ticket_id, branch).await {
            Ok(_) => Ok(()),
            Err(crate::errors::WorkspaceError::MergeAlreadyQueued { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_error(
        inner: &Arc<Inner>,
        ticket: &Ticket,
        role: AgentRole,
        error: crate::errors::ProviderError,
    ) -> Result<(), SchedulerError> {
        match error.category() {
            ErrorCategory::Conflict => {
                Inner::transition_on(
                    inner,
                    &ticket.id,
                    TicketStatus::Blocked,
                    Some(&format!("workspace conflict: {}", error)),
                )
                .await
            }
            ErrorCategory::Content => {
                Inner::rework_on(inner, &ticket.id, role, &error.to_string(), "high").await
            }
            ErrorCategory::Timeout | ErrorCategory::Transient => {
                // Run is failed; the next cycle reconsiders the ticket.
                tracing::warn!(ticket = %ticket.id, error = %error, "run failed, will retry");
                Ok(())
            }
            ErrorCategory::ProviderUnavailable => {
                tracing::error!(ticket = %ticket.id, error = %error, "provider unavailable, operator action required");
                Ok(())
            }
            _ => {
                tracing::error!(ticket = %ticket.id, error = %error, "invocation failed");
                Ok(())
            }
        }
    }
}
