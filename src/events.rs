use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Which path performed a transition.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EventSource {
    Foreground,
    Schedule,
    Recovery,
    Reconciliation,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DomainEvent {
    SessionStarted {
        session_id: String,
        profile_id: String,
    },
    Paused {
        session_id: String,
        profile_id: String,
    },
    PauseEnded {
        profile_id: String,
        source: EventSource,
    },
    BreakStarted {
        session_id: String,
    },
    BreakEnded {
        session_id: String,
    },
    SessionEnded {
        profile_id: String,
        source: EventSource,
    },
}

/// Fan-out of domain events within one execution context.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: DomainEvent) {
        log::debug!("event: {event:?}");
        // No subscribers is fine; nobody is watching this context right now.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}
