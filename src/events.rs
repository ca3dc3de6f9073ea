//! Notification bus for routine lifecycle events.
//!
//! The engine only publishes. Whoever cares (the demo binary, a UI, tests)
//! subscribes with [`EventBus::subscribe`]. Publishing with no subscribers is
//! not an error.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// How a routine run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RoutineOutcome {
    /// Every slot ran.
    Completed,
    /// A stop was requested before the last slot finished.
    Stopped,
    /// The run could not continue, e.g. a slot had no result destinations.
    Aborted(String),
}

/// Notifications published while a routine runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RoutineEvent {
    /// A slot started; its settings are applied and gates are open.
    SlotProgressed {
        /// Routine name.
        routine: String,
        /// Slot uid.
        slot: Uuid,
        /// Slot name.
        name: String,
    },
    /// A slot with a stop-and-wait interaction is waiting for the operator.
    AwaitingOperator {
        /// Routine name.
        routine: String,
        /// Slot uid.
        slot: Uuid,
        /// Slot name.
        name: String,
    },
    /// Emitted exactly once per run.
    RoutineEnded {
        /// Routine name.
        routine: String,
        /// How the run ended.
        outcome: RoutineOutcome,
    },
}

/// Cloneable handle to a broadcast channel of [`RoutineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RoutineEvent>,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Sends to current subscribers. Having none is not an error.
    pub fn publish(&self, event: RoutineEvent) {
        if self.sender.send(event).is_err() {
            trace!("No subscribers for routine event");
        }
    }

    /// Receives events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RoutineEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(RoutineEvent::RoutineEnded {
            routine: "r".into(),
            outcome: RoutineOutcome::Completed,
        });
    }

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let slot = Uuid::new_v4();

        bus.publish(RoutineEvent::SlotProgressed {
            routine: "r".into(),
            slot,
            name: "warmup".into(),
        });
        bus.publish(RoutineEvent::RoutineEnded {
            routine: "r".into(),
            outcome: RoutineOutcome::Stopped,
        });

        assert!(matches!(rx.recv().await.unwrap(), RoutineEvent::SlotProgressed { slot: s, .. } if s == slot));
        assert_eq!(
            rx.recv().await.unwrap(),
            RoutineEvent::RoutineEnded {
                routine: "r".into(),
                outcome: RoutineOutcome::Stopped
            }
        );
    }
}
