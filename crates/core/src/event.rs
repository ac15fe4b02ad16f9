//! Session events: what a running session reports about itself.
//!
//! Each session owns its own bus, so several sessions in one process never
//! see each other's events. Subscribers filter for what they care about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Everything a session publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The model finished a turn and control returned to the caller.
    TurnCompleted {
        tokens_generated: usize,
        timestamp: DateTime<Utc>,
    },

    /// Input longer than the usable context was cut down.
    InputTruncated {
        skipped: usize,
        timestamp: DateTime<Utc>,
    },

    /// The oldest half of the shiftable context was evicted.
    ContextShifted {
        discarded: i32,
        n_past: i32,
        timestamp: DateTime<Utc>,
    },

    /// Cache positions were remapped by grouped attention.
    SelfExtended {
        ga_i: i32,
        n_past: i32,
        timestamp: DateTime<Utc>,
    },

    /// The session cache was written to disk.
    SessionCacheSaved {
        path: String,
        tokens: usize,
        timestamp: DateTime<Utc>,
    },

    /// A tool call was executed
    ToolExecuted {
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The generation loop exited.
    SessionStopped {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for session events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Cloning the bus
/// shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<SessionEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SessionEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::ContextShifted {
            discarded: 10,
            n_past: 12,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            SessionEvent::ContextShifted { discarded, n_past, .. } => {
                assert_eq!(*discarded, 10);
                assert_eq!(*n_past, 12);
            }
            _ => panic!("Expected ContextShifted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(SessionEvent::SessionStopped {
            reason: "test".into(),
            timestamp: Utc::now(),
        });
    }

    #[tokio::test]
    async fn cloned_bus_shares_channel() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.clone().publish(SessionEvent::InputTruncated {
            skipped: 3,
            timestamp: Utc::now(),
        });
        assert!(matches!(
            rx.recv().await.unwrap().as_ref(),
            SessionEvent::InputTruncated { skipped: 3, .. }
        ));
    }
}
