//! Typed error hierarchy for the Conveyor orchestrator.
//!
//! Four top-level enums cover the four subsystems:
//! - `StoreError` - board store precondition and persistence failures
//! - `WorkspaceError` - worktree and merge-queue failures
//! - `ProviderError` - LLM provider and invocation failures
//! - `SchedulerError` - cycle-engine and control-surface failures
//!
//! Every error maps onto an [`ErrorCategory`] which the scheduler uses to
//! decide between retry, skip, and escalation to BLOCKED.

use thiserror::Error;

/// Semantic failure categories driving scheduler policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network or subprocess failure; retry next cycle.
    Transient,
    /// Deadline exceeded; run marked failed, ticket reconsidered next cycle.
    Timeout,
    /// Credentials missing or non-retryable endpoint error; operator action.
    ProviderUnavailable,
    /// Store precondition failure (duplicate id, missing ticket, bad stage).
    InvalidState,
    /// Workspace conflict (dirty tree, rebase/merge failure); ticket BLOCKED.
    Conflict,
    /// Agent output indicates structured failure; routes to rework.
    Content,
    /// Pool or worker saturation; not an error, ticket skipped this cycle.
    Capacity,
}

/// Errors from the board store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Ticket {id} not found")]
    TicketNotFound { id: String },

    #[error("Ticket {id} already exists")]
    DuplicateTicket { id: String },

    #[error("Run {id} not found")]
    RunNotFound { id: String },

    #[error("Invalid status '{status}'")]
    InvalidStatus { status: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt row for {entity} {id}: {message}")]
    CorruptRow {
        entity: &'static str,
        id: String,
        message: String,
    },
}

impl StoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StoreError::Database(_) => ErrorCategory::Transient,
            _ => ErrorCategory::InvalidState,
        }
    }
}

/// Errors from the workspace pool, git manager, and merge queue.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Workspace pool at capacity ({capacity})")]
    PoolFull { capacity: usize },

    #[error("Ticket {ticket_id} already holds a workspace")]
    AlreadyAllocated { ticket_id: String },

    #[error("No pool entry for ticket {ticket_id}")]
    NotAllocated { ticket_id: String },

    #[error("Workspace at {path} has uncommitted changes")]
    Uncommitted { path: String },

    #[error("Rebase onto trunk failed in {path}: {message}")]
    RebaseFailed { path: String, message: String },

    #[error("Merge of branch {branch} failed: {message}")]
    MergeFailed { branch: String, message: String },

    #[error("Ticket {ticket_id} already has a pending merge entry")]
    MergeAlreadyQueued { ticket_id: String },

    #[error("Git command failed: {command}: {stderr}")]
    GitCommand { command: String, stderr: String },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Store error during workspace operation: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WorkspaceError::PoolFull { .. } => ErrorCategory::Capacity,
            WorkspaceError::Uncommitted { .. }
            | WorkspaceError::RebaseFailed { .. }
            | WorkspaceError::MergeFailed { .. } => ErrorCategory::Conflict,
            WorkspaceError::GitCommand { .. }
            | WorkspaceError::Git(_)
            | WorkspaceError::Io(_) => ErrorCategory::Transient,
            WorkspaceError::Store(e) => e.category(),
            _ => ErrorCategory::InvalidState,
        }
    }
}

/// Errors from the agent-invocation layer.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider {name} is not available: {reason}")]
    NotAvailable { name: String, reason: String },

    #[error("Provider {name} request failed: {message}")]
    Request { name: String, message: String },

    #[error("Provider {name} returned malformed response: {message}")]
    MalformedResponse { name: String, message: String },

    #[error("Agent invocation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Agent invocation cancelled")]
    Cancelled,

    #[error("Agent reported failure: {detail}")]
    AgentFailed { detail: String },

    #[error("Failed to spawn fallback CLI '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Fallback CLI exited with non-zero code {exit_code}")]
    CliNonZeroExit { exit_code: i32 },
}

impl ProviderError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProviderError::NotAvailable { .. } => ErrorCategory::ProviderUnavailable,
            ProviderError::Timeout { .. } | ProviderError::Cancelled => ErrorCategory::Timeout,
            ProviderError::AgentFailed { .. } => ErrorCategory::Content,
            ProviderError::Request { .. }
            | ProviderError::SpawnFailed { .. }
            | ProviderError::CliNonZeroExit { .. } => ErrorCategory::Transient,
            ProviderError::MalformedResponse { .. } => ErrorCategory::InvalidState,
        }
    }
}

/// Errors from the scheduler and control surface.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Orchestrator is already running")]
    AlreadyRunning,

    #[error("Orchestrator is not running")]
    NotRunning,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_full_categorised_as_capacity() {
        let err = WorkspaceError::PoolFull { capacity: 3 };
        assert_eq!(err.category(), ErrorCategory::Capacity);
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn workspace_preconditions_categorised_as_conflict() {
        let err = WorkspaceError::Uncommitted {
            path: "/tmp/ws".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Conflict);
        let err = WorkspaceError::RebaseFailed {
            path: "/tmp/ws".into(),
            message: "could not apply abc123".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Conflict);
        let err = WorkspaceError::MergeFailed {
            branch: "feat/T-1".into(),
            message: "conflict in api/users.rs".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Conflict);
    }

    #[test]
    fn missing_credential_categorised_as_provider_unavailable() {
        let err = ProviderError::NotAvailable {
            name: "anthropic".into(),
            reason: "ANTHROPIC_API_KEY not set".into(),
        };
        assert_eq!(err.category(), ErrorCategory::ProviderUnavailable);
    }

    #[test]
    fn timeout_and_cancel_share_a_category() {
        assert_eq!(
            ProviderError::Timeout { seconds: 1800 }.category(),
            ErrorCategory::Timeout
        );
        assert_eq!(ProviderError::Cancelled.category(), ErrorCategory::Timeout);
    }

    #[test]
    fn store_precondition_failures_are_invalid_state() {
        let err = StoreError::TicketNotFound { id: "T-9".into() };
        assert_eq!(err.category(), ErrorCategory::InvalidState);
        assert!(err.to_string().contains("T-9"));
    }

    #[test]
    fn scheduler_error_converts_from_subsystem_errors() {
        let inner = StoreError::TicketNotFound { id: "T-1".into() };
        let err: SchedulerError = inner.into();
        assert!(matches!(err, SchedulerError::Store(_)));
    }

    #[test]
    fn all_error_types_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::InvalidStatus { status: "x".into() });
        assert_std_error(&WorkspaceError::PoolFull { capacity: 1 });
        assert_std_error(&ProviderError::Cancelled);
        assert_std_error(&SchedulerError::AlreadyRunning);
    }
}
