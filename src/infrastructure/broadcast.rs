use crate::domain::event::BroadcastEvent;
use crate::domain::repository::EventBroadcaster;
use tokio::sync::broadcast;
use tracing::trace;

/// In-process fan-out over a tokio broadcast channel. Observers that are not
/// subscribed when an event is sent never see it; slow observers lag and lose
/// the oldest events.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<BroadcastEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.sender.subscribe()
    }
}

impl EventBroadcaster for ChannelBroadcaster {
    fn broadcast(&self, event_key: &str, payload: serde_json::Value) {
        let event = BroadcastEvent {
            key: event_key.to_string(),
            payload,
        };
        if self.sender.send(event).is_err() {
            trace!(event_key, "No observers for event");
        }
    }
}
