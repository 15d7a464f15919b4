//! Bounded pool of isolated ticket workspaces.
//!
//! Admission is serialised through a single async lock so the capacity
//! check and the entry insert are atomic with respect to other allocators.
//! Entries live in the board store's `worktree_pool` table; the pool is the
//! only component that mutates them.

use std::sync::Arc;

use chrono::Utc;

use crate::board::models::{AgentRole, PoolEntry, PoolEntryStatus};
use crate::board::store::StoreHandle;
use crate::errors::WorkspaceError;
use crate::events::{EventBus, OrchestratorEvent};
use crate::workspace::git::{GitManager, branch_name};

pub struct WorkspacePool {
    store: StoreHandle,
    git: Arc<GitManager>,
    bus: EventBus,
    capacity: usize,
    branch_prefix: String,
    admission: tokio::sync::Mutex<()>,
}

impl WorkspacePool {
    pub fn new(
        store: StoreHandle,
        git: Arc<GitManager>,
        bus: EventBus,
        capacity: usize,
        branch_prefix: &str,
    ) -> Self {
        Self {
            store,
            git,
            bus,
            capacity,
            branch_prefix: branch_prefix.to_string(),
            admission: tokio::sync::Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn slots_used(&self) -> Result<usize, WorkspaceError> {
        Ok(self.store.call(|s| s.pool_slots_used()).await?)
    }

    /// Admit a ticket into the pool, creating its worktree. Idempotent: a
    /// ticket that already holds a workspace gets its existing entry back.
    /// A full pool refuses with [`WorkspaceError::PoolFull`] and the ticket
    /// waits in READY for the next cycle.
    pub async fn allocate(
        &self,
        ticket_id: &str,
        title: &str,
        agent: AgentRole,
    ) -> Result<PoolEntry, WorkspaceError> {
        let _guard = self.admission.lock().await;

        let existing = {
            let id = ticket_id.to_string();
            self.store.call(move |s| s.get_pool_entry(&id)).await?
        };
        if let Some(entry) = existing {
            let id = ticket_id.to_string();
            self.store.call(move |s| s.touch_pool_activity(&id)).await?;
            return Ok(entry);
        }

        let used = self.store.call(|s| s.pool_slots_used()).await?;
        if used >= self.capacity {
            self.bus.publish(OrchestratorEvent::WorkspaceLimitEnforced {
                ticket_id: ticket_id.to_string(),
                capacity: self.capacity,
            });
            let id = ticket_id.to_string();
            let capacity = self.capacity;
            self.store
                .call(move |s| {
                    s.append_workspace_event(
                        &id,
                        "limit_enforced",
                        Some(&format!("capacity {}", capacity)),
                    )
                })
                .await?;
            return Err(WorkspaceError::PoolFull {
                capacity: self.capacity,
            });
        }

        let branch = branch_name(&self.branch_prefix, ticket_id, title);
        let path = self.git.create_worktree(ticket_id, &branch).await?;
        let entry = PoolEntry {
            ticket_id: ticket_id.to_string(),
            branch: branch.clone(),
            path: path.to_string_lossy().to_string(),
            agent,
            status: PoolEntryStatus::Active,
            created_at: Utc::now(),
            last_activity: Utc::now(),
        };
        {
            let entry = entry.clone();
            self.store
                .call(move |s| {
                    s.insert_pool_entry(&entry)?;
                    s.append_workspace_event(&entry.ticket_id, "created", Some(&entry.branch))
                })
                .await?;
        }
        self.bus.publish(OrchestratorEvent::WorkspaceCreated {
            ticket_id: ticket_id.to_string(),
            branch,
            path: entry.path.clone(),
        });
        tracing::info!(ticket_id, branch = %entry.branch, "workspace allocated");
        Ok(entry)
    }

    pub async fn entry(&self, ticket_id: &str) -> Result<Option<PoolEntry>, WorkspaceError> {
        let id = ticket_id.to_string();
        Ok(self.store.call(move |s| s.get_pool_entry(&id)).await?)
    }

    pub async fn touch(&self, ticket_id: &str) -> Result<(), WorkspaceError> {
        let id = ticket_id.to_string();
        Ok(self.store.call(move |s| s.touch_pool_activity(&id)).await?)
    }

    pub async fn mark_merging(&self, ticket_id: &str) -> Result<(), WorkspaceError> {
        self.transition(ticket_id, PoolEntryStatus::Merging).await
    }

    pub async fn mark_cleanup_pending(&self, ticket_id: &str) -> Result<(), WorkspaceError> {
        self.transition(ticket_id, PoolEntryStatus::CleanupPending)
            .await
    }

    async fn transition(
        &self,
        ticket_id: &str,
        status: PoolEntryStatus,
    ) -> Result<(), WorkspaceError> {
        let _guard = self.admission.lock().await;
        let id = ticket_id.to_string();
        let existing = {
            let id = id.clone();
            self.store.call(move |s| s.get_pool_entry(&id)).await?
        };
        if existing.is_none() {
            return Err(WorkspaceError::NotAllocated {
                ticket_id: ticket_id.to_string(),
            });
        }
        self.store
            .call(move |s| s.update_pool_status(&id, status))
            .await?;
        Ok(())
    }

    /// Drop a pool entry, removing the worktree and branch when asked.
    /// Worktree removal is best-effort: a failure is logged and the entry
    /// is removed regardless.
    pub async fn cleanup(
        &self,
        ticket_id: &str,
        remove_worktree: bool,
    ) -> Result<(), WorkspaceError> {
        let _guard = self.admission.lock().await;
        let entry = {
            let id = ticket_id.to_string();
            self.store.call(move |s| s.get_pool_entry(&id)).await?
        };
        let Some(entry) = entry else {
            return Ok(());
        };
        if remove_worktree {
            let path = std::path::PathBuf::from(&entry.path);
            if let Err(e) = self.git.remove_worktree(&path, Some(&entry.branch)).await {
                tracing::warn!(
                    ticket_id,
                    error = %e,
                    "worktree removal failed, dropping pool entry anyway"
                );
            }
        }
        {
            let id = ticket_id.to_string();
            self.store
                .call(move |s| {
                    s.remove_pool_entry(&id)?;
                    s.append_workspace_event(&id, "cleaned_up", None)
                })
                .await?;
        }
        self.bus.publish(OrchestratorEvent::WorkspaceCleaned {
            ticket_id: ticket_id.to_string(),
        });
        Ok(())
    }

    /// Housekeeping: flush entries parked in cleanup_pending.
    pub async fn reconcile(&self, remove_worktrees: bool) -> Result<usize, WorkspaceError> {
        let entries = self.store.call(|s| s.list_pool_entries()).await?;
        let mut cleaned = 0;
        for entry in entries {
            if entry.status == PoolEntryStatus::CleanupPending {
                self.cleanup(&entry.ticket_id, remove_worktrees).await?;
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }
}
