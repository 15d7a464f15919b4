//! External control surface: start, stop, and inspect the running
//! orchestrator. Start is idempotent-hostile by contract - a second start
//! while running is an error, not a restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentRunner;
use crate::board::store::StoreHandle;
use crate::config::OrchestratorConfig;
use crate::errors::SchedulerError;
use crate::events::EventBus;
use crate::refine::RefinementEngine;
use crate::scheduler::engine::{Metrics, MetricsSnapshot, Scheduler};
use crate::workspace::git::GitManager;
use crate::workspace::merge::MergeQueue;
use crate::workspace::pool::WorkspacePool;

#[derive(Debug, Clone, serde::Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub total_runtime_secs: u64,
    pub metrics: MetricsSnapshot,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<Result<MetricsSnapshot, SchedulerError>>,
    started_at: DateTime<Utc>,
    metrics: Arc<Metrics>,
}

struct ControlState {
    running: Option<Running>,
    last_metrics: MetricsSnapshot,
    total_runtime: Duration,
}

/// Composition root handle over the orchestrator lifecycle.
pub struct Orchestrator {
    store: StoreHandle,
    pool: Arc<WorkspacePool>,
    git: Arc<GitManager>,
    merge_queue: Arc<MergeQueue>,
    runner: Arc<dyn AgentRunner>,
    refine: Arc<RefinementEngine>,
    bus: EventBus,
    config: OrchestratorConfig,
    state: tokio::sync::Mutex<ControlState>,
}

impl Orchestrator {
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
        Self {
            store,
            pool,
            git,
            merge_queue,
            runner,
            refine,
            bus,
            config,
            state: tokio::sync::Mutex::new(ControlState {
                running: None,
                last_metrics: MetricsSnapshot::default(),
                total_runtime: Duration::ZERO,
            }),
        }
    }

    /// Start the scheduler loop. Errors if already running.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        if state.running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let scheduler = Scheduler::new(
            self.store.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.git),
            Arc::clone(&self.merge_queue),
            Arc::clone(&self.runner),
            Arc::clone(&self.refine),
            self.bus.clone(),
            self.config.clone(),
        );
        let metrics = scheduler.metrics();
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { scheduler.run(loop_cancel).await });
        state.running = Some(Running {
            cancel,
            handle,
            started_at: Utc::now(),
            metrics,
        });
        tracing::info!("orchestrator started");
        Ok(())
    }

    /// Signal cancellation and join the loop. Errors if not running.
    pub async fn stop(&self) -> Result<MetricsSnapshot, SchedulerError> {
        let mut state = self.state.lock().await;
        let Some(running) = state.running.take() else {
            return Err(SchedulerError::NotRunning);
        };
        running.cancel.cancel();
        let metrics = match running.handle.await {
            Ok(Ok(metrics)) => metrics,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "scheduler loop ended with error");
                running.metrics.snapshot()
            }
            Err(join_err) => {
                tracing::error!(error = %join_err, "scheduler task panicked");
                running.metrics.snapshot()
            }
        };
        let elapsed = (Utc::now() - running.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        state.total_runtime += elapsed;
        state.last_metrics = metrics;
        tracing::info!("orchestrator stopped");
        Ok(metrics)
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let state = self.state.lock().await;
        match &state.running {
            Some(running) => OrchestratorStatus {
                running: true,
                started_at: Some(running.started_at),
                uptime_secs: (Utc::now() - running.started_at).num_seconds().max(0) as u64,
                total_runtime_secs: state.total_runtime.as_secs(),
                metrics: running.metrics.snapshot(),
            },
            None => OrchestratorStatus {
                running: false,
                started_at: None,
                uptime_secs: 0,
                total_runtime_secs: state.total_runtime.as_secs(),
                metrics: state.last_metrics,
            },
        }
    }
}
