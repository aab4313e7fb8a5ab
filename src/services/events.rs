//! Domain event system for the sync engine
//!
//! Provides an event bus for notifying listeners about sync side effects.
//! Useful for:
//! - Revision snapshot scheduling
//! - Duplicate-item bookkeeping
//! - Migration progress monitoring
//! - Audit logging

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::transition::TransitionState;

/// Domain events emitted by the sync engine
#[derive(Debug, Clone)]
pub enum DomainEvent {
    /// A saved Note or File crossed the revision threshold
    ItemRevisionCreationRequested {
        item_uuid: String,
        user_uuid: String,
    },
    /// An item carrying `duplicate_of` was persisted
    DuplicateItemSynced {
        item_uuid: String,
        user_uuid: String,
    },
    /// The transition runner changed phase for a user
    TransitionStatusUpdated {
        user_uuid: String,
        status: TransitionState,
        transition_type: String,
        transition_timestamp: i64,
    },
    /// An item left a shared vault (mirrored as a durable user event)
    ItemRemovedFromSharedVault {
        item_uuid: String,
        user_uuid: String,
        shared_vault_uuid: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    /// Handle an event
    fn on_event(&self, event: &DomainEvent);
}

/// Event bus for broadcasting domain events
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. A sync must never fail because a
    /// side effect could not be queued, so send errors are ignored.
    pub fn emit(&self, event: DomainEvent) {
        trace!(event = ?event, "Emitting domain event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &DomainEvent) {
        match event {
            DomainEvent::ItemRevisionCreationRequested {
                item_uuid,
                user_uuid,
            } => {
                debug!(item = %item_uuid, user = %user_uuid, "Revision requested");
            }
            DomainEvent::DuplicateItemSynced {
                item_uuid,
                user_uuid,
            } => {
                debug!(item = %item_uuid, user = %user_uuid, "Duplicate item synced");
            }
            DomainEvent::TransitionStatusUpdated {
                user_uuid, status, ..
            } => {
                debug!(user = %user_uuid, status = %status.as_str(), "Transition status updated");
            }
            DomainEvent::ItemRemovedFromSharedVault {
                item_uuid,
                shared_vault_uuid,
                ..
            } => {
                debug!(
                    item = %item_uuid,
                    vault = %shared_vault_uuid,
                    "Item removed from shared vault"
                );
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(DomainEvent::ItemRevisionCreationRequested {
            item_uuid: "a-1".into(),
            user_uuid: "u-1".into(),
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            DomainEvent::ItemRevisionCreationRequested {
                item_uuid,
                user_uuid,
            } => {
                assert_eq!(item_uuid, "a-1");
                assert_eq!(user_uuid, "u-1");
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        // Should not panic even with no subscribers
        bus.emit(DomainEvent::DuplicateItemSynced {
            item_uuid: "a-1".into(),
            user_uuid: "u-1".into(),
        });
    }
}
