use crate::domain::broker::BrokerMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// Status column of a stored log. This process only writes `Processed`, since
/// failed persistence is logged rather than recorded; `Failed` rows written by
/// other producers of the same table are still read back.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Processed,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Processed => "processed",
            LogStatus::Failed => "failed",
        }
    }
}

impl FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "processed" => Ok(LogStatus::Processed),
            "failed" => Ok(LogStatus::Failed),
            other => Err(format!("unknown log status '{}'", other)),
        }
    }
}

/// One consumed message, as persisted by the instance that received it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLog {
    pub id: Uuid,
    pub consumer_id: String,
    pub group_id: String,
    pub original_log_id: String,
    pub topic: String,
    pub partition: i32,
    pub offset: String,
    pub data: String,
    pub status: LogStatus,
    pub received_at: DateTime<Utc>,
}

impl ConsumerLog {
    pub fn processed(
        consumer_id: &str,
        group_id: &str,
        message: &BrokerMessage,
        received_at: DateTime<Utc>,
    ) -> Self {
        let original_log_id = extract_original_log_id(&message.value)
            .unwrap_or_else(|| format!("unknown-{}", received_at.timestamp_millis()));

        Self {
            id: Uuid::new_v4(),
            consumer_id: consumer_id.to_string(),
            group_id: group_id.to_string(),
            original_log_id,
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset.clone(),
            data: message.value.clone(),
            status: LogStatus::Processed,
            received_at,
        }
    }
}

/// Looks for an upstream identifier in a JSON object payload: `id` first, then
/// `transactionId`. Anything that is not a JSON object yields `None`.
pub fn extract_original_log_id(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let object = value.as_object()?;
    object
        .get("id")
        .and_then(identifier_text)
        .or_else(|| object.get("transactionId").and_then(identifier_text))
}

// Empty strings and zero are treated as absent.
fn identifier_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}
