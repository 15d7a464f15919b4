//! Broadcast event bus for dashboard consumers.
//!
//! Events fan out over `tokio::sync::broadcast`: publishers never block,
//! and a subscriber that falls behind loses oldest events (`Lagged`)
//! instead of stalling the scheduler.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::board::models::{AgentRole, RunStatus, TicketStatus};

/// Default ring-buffer capacity per subscriber.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrchestratorEvent {
    TicketTransitioned {
        ticket_id: String,
        from: TicketStatus,
        to: TicketStatus,
        actor: String,
    },
    RunStarted {
        ticket_id: String,
        agent: AgentRole,
        run_id: String,
    },
    RunFinished {
        ticket_id: String,
        agent: AgentRole,
        run_id: String,
        status: RunStatus,
    },
    WorkspaceCreated {
        ticket_id: String,
        branch: String,
        path: String,
    },
    WorkspaceLimitEnforced {
        ticket_id: String,
        capacity: usize,
    },
    MergeStarted {
        ticket_id: String,
        branch: String,
    },
    MergeCompleted {
        ticket_id: String,
        branch: String,
    },
    MergeFailed {
        ticket_id: String,
        branch: String,
        error: String,
        attempts: u32,
    },
    WorkspaceCleaned {
        ticket_id: String,
    },
    TicketCompleted {
        ticket_id: String,
    },
    HealthChanged {
        health: String,
    },
}

/// Many-to-many publish handle. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. A send with no live subscribers is not an error.
    pub fn publish(&self, event: OrchestratorEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::trace!("event dropped, no subscribers: {}", e);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(OrchestratorEvent::TicketCompleted {
            ticket_id: "T-1".to_string(),
        });
        assert!(matches!(
            rx1.recv().await.unwrap(),
            OrchestratorEvent::TicketCompleted { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            OrchestratorEvent::TicketCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(OrchestratorEvent::HealthChanged {
            health: "stable".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking_publisher() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(OrchestratorEvent::TicketCompleted {
                ticket_id: format!("T-{}", i),
            });
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped >= 3),
            other => panic!("expected Lagged, got {:?}", other),
        }
    }

    #[test]
    fn events_serialize_with_tagged_shape() {
        let event = OrchestratorEvent::MergeFailed {
            ticket_id: "T-1".to_string(),
            branch: "feat/T-1".to_string(),
            error: "conflict".to_string(),
            attempts: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "MergeFailed");
        assert_eq!(json["data"]["attempts"], 2);
    }
}
