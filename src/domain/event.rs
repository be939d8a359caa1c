use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pushed to observers every time an instance persists a message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceived {
    pub consumer_id: String,
    pub group_id: String,
    pub topic: String,
    pub partition: i32,
    pub offset: String,
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageReceived {
    /// `<consumerId>-<offset>`, unique per delivery of a given instance.
    pub fn event_key(&self) -> String {
        format!("{}-{}", self.consumer_id, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    pub key: String,
    pub payload: serde_json::Value,
}
