use crate::domain::error::StoreError;
use crate::domain::instance::ConsumerInstance;
use crate::domain::log::ConsumerLog;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable home of instance records and message logs.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn find_instance(&self, id: &str) -> Result<Option<ConsumerInstance>, StoreError>;

    /// Create-or-update by id. `created_at` of an existing row is kept.
    async fn upsert_instance(&self, instance: &ConsumerInstance) -> Result<(), StoreError>;

    async fn insert_log(&self, log: &ConsumerLog) -> Result<(), StoreError>;

    async fn list_instances(&self, group_id: &str) -> Result<Vec<ConsumerInstance>, StoreError>;

    /// Most recently inserted first.
    async fn list_logs(&self, consumer_id: &str, limit: u32) -> Result<Vec<ConsumerLog>, StoreError>;

    async fn touch_heartbeats(&self, ids: &[String], at: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Marks every record still claiming `active` as `inactive`.
    async fn deactivate_stale_instances(&self, at: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Fire-and-forget fan-out to whoever is listening right now.
pub trait EventBroadcaster: Send + Sync {
    fn broadcast(&self, event_key: &str, payload: serde_json::Value);
}
