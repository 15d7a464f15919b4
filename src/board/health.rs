//! Derived board aggregates: the system-health indicator and the
//! human-readable reason a ticket sits in BLOCKED.

use serde::{Deserialize, Serialize};

use crate::board::models::{Ticket, TicketStatus};
use crate::board::store::BoardStore;
use crate::errors::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemHealth {
    Stable,
    /// Tickets bouncing between the same statuses.
    Thrashing,
    /// A large share of tickets moved backwards in the pipeline.
    Reworking,
    /// Blocked tickets dominate the active set.
    Accumulating,
    /// Nothing active while work sits blocked.
    Stalled,
}

impl SystemHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Thrashing => "thrashing",
            Self::Reworking => "reworking",
            Self::Accumulating => "accumulating",
            Self::Stalled => "stalled",
        }
    }
}

/// Rank of a status in the forward pipeline. Statuses outside the build
/// chain have no rank and never count as backward motion.
fn pipeline_rank(status: &TicketStatus) -> Option<u8> {
    match status {
        TicketStatus::Ready => Some(0),
        TicketStatus::InDev => Some(1),
        TicketStatus::InQa => Some(2),
        TicketStatus::InUx => Some(3),
        TicketStatus::InSec => Some(4),
        TicketStatus::PmReview => Some(5),
        TicketStatus::Done => Some(6),
        _ => None,
    }
}

/// A status repeated ≥3 times within the ticket's last 10 history entries.
fn is_thrashing(ticket: &Ticket) -> bool {
    let recent: Vec<_> = ticket.history.iter().rev().take(10).collect();
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for entry in recent {
        *counts.entry(entry.status.as_str()).or_insert(0) += 1;
    }
    counts.values().any(|&c| c >= 3)
}

/// Any consecutive history pair that decreases pipeline rank.
fn moved_backwards(ticket: &Ticket) -> bool {
    ticket
        .history
        .windows(2)
        .any(|pair| match (pipeline_rank(&pair[0].status), pipeline_rank(&pair[1].status)) {
            (Some(a), Some(b)) => b < a,
            _ => false,
        })
}

/// Classify board health from ticket aggregates.
pub fn system_health(tickets: &[Ticket]) -> SystemHealth {
    let active = tickets.iter().filter(|t| t.status.is_in_progress()).count();
    let blocked = tickets
        .iter()
        .filter(|t| t.status == TicketStatus::Blocked)
        .count();

    if active == 0 && blocked > 0 {
        return SystemHealth::Stalled;
    }
    if active + blocked > 0 && (blocked as f64) / ((active + blocked) as f64) > 0.5 {
        return SystemHealth::Accumulating;
    }
    if tickets.iter().filter(|t| is_thrashing(t)).count() >= 3 {
        return SystemHealth::Thrashing;
    }
    if !tickets.is_empty() {
        let reworked = tickets.iter().filter(|t| moved_backwards(t)).count();
        if (reworked as f64) / (tickets.len() as f64) > 0.3 {
            return SystemHealth::Reworking;
        }
    }
    SystemHealth::Stable
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedKind {
    CriticalBugs,
    Dependency,
    Policy,
    Confidence,
    Ambiguous,
    Issue,
    Unknown,
}

/// Why a ticket is blocked, derived from board signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedReason {
    pub kind: BlockedKind,
    pub detail: String,
}

/// Derive a [`BlockedReason`] for `ticket`. Signals are checked in
/// severity order: critical bugs, unmet dependencies, then review-note
/// keywords from recent history.
pub fn blocked_reason(store: &BoardStore, ticket: &Ticket) -> Result<BlockedReason, StoreError> {
    let critical = ticket
        .bugs
        .iter()
        .filter(|b| b.severity == "critical")
        .count();
    if critical > 0 {
        return Ok(BlockedReason {
            kind: BlockedKind::CriticalBugs,
            detail: format!("{} critical bug(s) open", critical),
        });
    }

    for dep in &ticket.dependencies {
        match store.resolve_dependency(dep)? {
            Some(t) if t.status == TicketStatus::Done => {}
            Some(t) => {
                return Ok(BlockedReason {
                    kind: BlockedKind::Dependency,
                    detail: format!("waiting on '{}'", t.title),
                });
            }
            None => {
                return Ok(BlockedReason {
                    kind: BlockedKind::Dependency,
                    detail: format!("unknown dependency '{}'", dep),
                });
            }
        }
    }

    let recent_notes: Vec<&str> = ticket
        .history
        .iter()
        .rev()
        .take(10)
        .filter_map(|h| h.note.as_deref())
        .collect();
    for note in &recent_notes {
        let lower = note.to_lowercase();
        if lower.contains("security") {
            return Ok(BlockedReason {
                kind: BlockedKind::Policy,
                detail: note.to_string(),
            });
        }
        if lower.contains("confidence") || lower.contains("unclear") {
            return Ok(BlockedReason {
                kind: BlockedKind::Confidence,
                detail: note.to_string(),
            });
        }
        if lower.contains("ambiguous") || lower.contains("requirement") {
            return Ok(BlockedReason {
                kind: BlockedKind::Ambiguous,
                detail: note.to_string(),
            });
        }
    }

    if let Some(note) = recent_notes.first() {
        return Ok(BlockedReason {
            kind: BlockedKind::Issue,
            detail: note.to_string(),
        });
    }
    Ok(BlockedReason {
        kind: BlockedKind::Unknown,
        detail: "no blocking signal recorded".to_string(),
    })
}
