//! Serial merge queue: one worker integrates feature branches into trunk.
//!
//! Strictly single-worker so trunk operations never interleave. Entries
//! retry on failure up to a bound; exhausted entries go terminal and the
//! scheduler routes the ticket back to IN_DEV.

use std::sync::Arc;

use crate::board::models::{MergeEntry, MergeStatus};
use crate::board::store::StoreHandle;
use crate::errors::WorkspaceError;
use crate::events::{EventBus, OrchestratorEvent};
use crate::workspace::git::GitManager;
use crate::workspace::pool::WorkspacePool;

/// Result of processing one queue entry.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Completed {
        ticket_id: String,
    },
    Retrying {
        ticket_id: String,
        attempts: u32,
    },
    Failed {
        ticket_id: String,
        error: String,
    },
}

pub struct MergeQueue {
    store: StoreHandle,
    git: Arc<GitManager>,
    pool: Arc<WorkspacePool>,
    bus: EventBus,
    max_attempts: u32,
}

impl MergeQueue {
    pub fn new(
        store: StoreHandle,
        git: Arc<GitManager>,
        pool: Arc<WorkspacePool>,
        bus: EventBus,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            git,
            pool,
            bus,
            max_attempts,
        }
    }

    /// Enqueue a ticket's branch for integration and park its pool entry in
    /// `merging`. At most one non-terminal entry per ticket.
    pub async fn submit(&self, ticket_id: &str, branch: &str) -> Result<MergeEntry, WorkspaceError> {
        let open = {
            let id = ticket_id.to_string();
            self.store
                .call(move |s| s.merge_entries_for_ticket(&id))
                .await?
        };
        if open.iter().any(|e| !e.status.is_terminal()) {
            return Err(WorkspaceError::MergeAlreadyQueued {
                ticket_id: ticket_id.to_string(),
            });
        }
        let entry = {
            let id = ticket_id.to_string();
            let branch = branch.to_string();
            self.store
                .call(move |s| s.enqueue_merge(&id, &branch))
                .await?
        };
        self.pool.mark_merging(ticket_id).await?;
        tracing::info!(ticket_id, branch, "merge queued");
        Ok(entry)
    }

    /// Pop and process the earliest pending entry. Returns `None` when the
    /// queue is empty.
    pub async fn process_next(&self) -> Result<Option<MergeOutcome>, WorkspaceError> {
        let Some(entry) = self.store.call(|s| s.next_pending_merge()).await? else {
            return Ok(None);
        };
        {
            let id = entry.id;
            self.store.call(move |s| s.mark_merge_in_progress(id)).await?;
        }
        {
            let ticket_id = entry.ticket_id.clone();
            let branch = entry.branch.clone();
            self.store
                .call(move |s| s.append_workspace_event(&ticket_id, "merge_started", Some(&branch)))
                .await?;
        }
        self.bus.publish(OrchestratorEvent::MergeStarted {
            ticket_id: entry.ticket_id.clone(),
            branch: entry.branch.clone(),
        });

        let message = self.commit_message(&entry).await;
        let result = self.integrate(&entry, &message).await;
        match result {
            Ok(()) => {
                {
                    let id = entry.id;
                    self.store.call(move |s| s.mark_merge_completed(id)).await?;
                }
                match self.pool.mark_cleanup_pending(&entry.ticket_id).await {
                    Ok(()) | Err(WorkspaceError::NotAllocated { .. }) => {}
                    Err(e) => return Err(e),
                }
                {
                    let ticket_id = entry.ticket_id.clone();
                    let branch = entry.branch.clone();
                    self.store
                        .call(move |s| {
                            s.append_workspace_event(&ticket_id, "merge_completed", Some(&branch))
                        })
                        .await?;
                }
                self.bus.publish(OrchestratorEvent::MergeCompleted {
                    ticket_id: entry.ticket_id.clone(),
                    branch: entry.branch.clone(),
                });
                tracing::info!(ticket_id = %entry.ticket_id, "merge completed");
                Ok(Some(MergeOutcome::Completed {
                    ticket_id: entry.ticket_id,
                }))
            }
            Err(e) => {
                let error = e.to_string();
                let status = {
                    let id = entry.id;
                    let error = error.clone();
                    let max = self.max_attempts;
                    self.store
                        .call(move |s| s.mark_merge_failed(id, &error, max))
                        .await?
                };
                {
                    let ticket_id = entry.ticket_id.clone();
                    let error = error.clone();
                    self.store
                        .call(move |s| {
                            s.append_workspace_event(&ticket_id, "merge_failed", Some(&error))
                        })
                        .await?;
                }
                let refreshed = {
                    let id = entry.id;
                    self.store.call(move |s| s.get_merge_entry(id)).await?
                };
                let attempts = refreshed.map(|e| e.attempts).unwrap_or(entry.attempts + 1);
                self.bus.publish(OrchestratorEvent::MergeFailed {
                    ticket_id: entry.ticket_id.clone(),
                    branch: entry.branch.clone(),
                    error: error.clone(),
                    attempts,
                });
                tracing::warn!(
                    ticket_id = %entry.ticket_id,
                    attempts,
                    error = %error,
                    "merge attempt failed"
                );
                if status == MergeStatus::Failed {
                    Ok(Some(MergeOutcome::Failed {
                        ticket_id: entry.ticket_id,
                        error,
                    }))
                } else {
                    Ok(Some(MergeOutcome::Retrying {
                        ticket_id: entry.ticket_id,
                        attempts,
                    }))
                }
            }
        }
    }

    async fn commit_message(&self, entry: &MergeEntry) -> String {
        let ticket = {
            let id = entry.ticket_id.clone();
            self.store.call(move |s| s.get_ticket(&id)).await.ok().flatten()
        };
        match ticket {
            Some(t) => format!("{}: {}", t.id, t.title),
            None => format!("{}: merge {}", entry.ticket_id, entry.branch),
        }
    }

    async fn integrate(&self, entry: &MergeEntry, message: &str) -> Result<(), WorkspaceError> {
        self.git.squash_merge(&entry.branch, message).await?;
        self.git.push_trunk().await?;
        Ok(())
    }

    /// Drain the queue serially, touching each entry at most once so a
    /// failing entry retries next cycle instead of hot-looping. Called
    /// from a single place per cycle so trunk operations never interleave.
    pub async fn drain(&self) -> Vec<MergeOutcome> {
        let mut outcomes = Vec::new();
        let mut seen = std::collections::HashSet::new();
        loop {
            let next = match self.store.call(|s| s.next_pending_merge()).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(error = %e, "merge worker error");
                    break;
                }
            };
            let Some(next) = next else { break };
            if !seen.insert(next.id) {
                break;
            }
            match self.process_next().await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "merge worker error");
                    break;
                }
            }
        }
        outcomes
    }
}
