use serde_json::Value;
use tokio::sync::broadcast;

/// Where a hub event is delivered: one peer's stream, or every participant
/// of a room (optionally skipping the emitting peer).
#[derive(Debug, Clone)]
pub enum EventTarget {
    Peer(String),
    Room { room: String, skip: Option<String> },
}

/// An event on its way to signaling clients. `event` is the stream event
/// name (`user-list`, `user-connect`, `user-disconnect`, `data`, …).
#[derive(Debug, Clone)]
pub struct HubEvent {
    pub target: EventTarget,
    pub event: String,
    pub data: Value,
}

pub struct EventBus {
    pub sender: broadcast::Sender<HubEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    pub fn publish(&self, target: EventTarget, event: &str, data: Value) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(HubEvent {
            target,
            event: event.to_string(),
            data,
        });
    }
}
