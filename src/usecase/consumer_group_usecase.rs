use crate::domain::broker::{BrokerClient, ConsumerHandle};
use crate::domain::error::BrokerError;
use crate::domain::instance::{instance_id, normalize_topics, ConsumerInstance, InstanceStatus};
use crate::domain::log::ConsumerLog;
use crate::domain::repository::{EventBroadcaster, StateStore};
use crate::usecase::consume_loop::InstanceWorker;
use crate::usecase::registry::{InstanceRegistry, RegistryEntry};
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupResult {
    pub success: bool,
    pub started_count: usize,
    pub requested_count: u32,
    pub instance_ids: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StopGroupResult {
    pub success: bool,
    pub stopped_count: usize,
    pub message: String,
}

/// Starts, tracks and stops groups of consumer instances at runtime.
///
/// The registry lock is held for the whole of every control operation, so
/// overlapping create/stop calls run one after another and never observe a
/// half-registered instance.
pub struct ConsumerGroupUsecase {
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn StateStore>,
    broadcaster: Arc<dyn EventBroadcaster>,
    registry: Mutex<InstanceRegistry>,
    stop_grace: Duration,
    pid: u32,
}

impl ConsumerGroupUsecase {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn StateStore>,
        broadcaster: Arc<dyn EventBroadcaster>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            broker,
            store,
            broadcaster,
            registry: Mutex::new(InstanceRegistry::default()),
            stop_grace,
            pid: std::process::id(),
        }
    }

    pub async fn create_group(
        &self,
        group_id: &str,
        topics: &[String],
        instance_count: u32,
    ) -> CreateGroupResult {
        let topics = normalize_topics(topics);
        if group_id.trim().is_empty() || topics.is_empty() {
            warn!(group_id, "Rejected group creation without a group id or topics");
            return CreateGroupResult {
                success: false,
                started_count: 0,
                requested_count: instance_count,
                instance_ids: Vec::new(),
                message: "A group id and at least one topic are required.".to_string(),
            };
        }

        info!(group_id, ?topics, instance_count, "Creating consumer group");
        let mut registry = self.registry.lock().await;
        let mut started = Vec::new();

        for index in 0..instance_count {
            let id = instance_id(group_id, index);

            if registry.contains(&id) {
                warn!(instance_id = %id, "Instance already running, refreshing its record");
                self.save_instance(&id, group_id, &topics, InstanceStatus::Active)
                    .await;
                continue;
            }

            match self.open_consumer(&id, group_id, &topics).await {
                Ok(handle) => {
                    let entry = RegistryEntry::new(handle.clone());
                    let cancel = entry.cancel.clone();
                    // registered before the loop exists so a stop always finds it
                    registry.insert(id.clone(), entry);
                    self.save_instance(&id, group_id, &topics, InstanceStatus::Active)
                        .await;

                    let worker = InstanceWorker {
                        instance_id: id.clone(),
                        group_id: group_id.to_string(),
                        handle,
                        store: self.store.clone(),
                        broadcaster: self.broadcaster.clone(),
                    };
                    registry.attach_task(&id, worker.spawn(cancel));
                    started.push(id);
                }
                Err(e) => {
                    error!(instance_id = %id, error = %e, "Failed to start instance");
                    self.save_instance(&id, group_id, &topics, InstanceStatus::Error)
                        .await;
                }
            }
        }

        info!(
            group_id,
            started = started.len(),
            requested = instance_count,
            "Consumer group created"
        );
        CreateGroupResult {
            success: true,
            started_count: started.len(),
            requested_count: instance_count,
            message: format!("Started {}/{} instances.", started.len(), instance_count),
            instance_ids: started,
        }
    }

    pub async fn stop_group(&self, group_id: &str) -> StopGroupResult {
        info!(group_id, "Stopping consumer group");
        let mut registry = self.registry.lock().await;
        let keys = registry.matching_group(group_id);

        if keys.is_empty() {
            warn!(group_id, "No running instances found for group");
            return StopGroupResult {
                success: false,
                stopped_count: 0,
                message: "No running instances found.".to_string(),
            };
        }

        for key in &keys {
            if let Some(entry) = registry.get_mut(key) {
                self.teardown(key, entry).await;
            }
            self.mark_stopped(key).await;
        }

        for key in &keys {
            registry.remove(key);
            info!(instance_id = %key, "Removed instance from registry");
        }

        StopGroupResult {
            success: true,
            stopped_count: keys.len(),
            message: format!("Stopped {} instances.", keys.len()),
        }
    }

    /// Stops one instance by exact id. Its durable record is left as it is.
    pub async fn stop_instance(&self, instance_id: &str) {
        info!(instance_id, "Stopping instance");
        let mut registry = self.registry.lock().await;

        let Some(entry) = registry.get_mut(instance_id) else {
            warn!(instance_id, "No running instance found");
            return;
        };
        self.teardown(instance_id, entry).await;
        registry.remove(instance_id);
        info!(instance_id, "Instance stopped");
    }

    pub async fn running_instances(&self) -> Vec<String> {
        self.registry.lock().await.ids()
    }

    pub async fn is_running(&self, instance_id: &str) -> bool {
        self.registry.lock().await.contains(instance_id)
    }

    /// Refreshes `last_heartbeat` of every registered instance.
    pub async fn heartbeat(&self) -> u64 {
        let ids = self.registry.lock().await.ids();
        if ids.is_empty() {
            return 0;
        }
        match self.store.touch_heartbeats(&ids, Utc::now()).await {
            Ok(touched) => {
                debug!(touched, "Heartbeat recorded");
                touched
            }
            Err(e) => {
                error!(error = %e, "Failed to record heartbeat");
                0
            }
        }
    }

    /// Records left `active` by a previous process no longer have a consumer
    /// behind them. Must run before the first create.
    pub async fn reconcile_stale_instances(&self) -> u64 {
        match self.store.deactivate_stale_instances(Utc::now()).await {
            Ok(0) => 0,
            Ok(count) => {
                info!(count, "Marked instances from a previous run inactive");
                count
            }
            Err(e) => {
                error!(error = %e, "Failed to reconcile stale instances");
                0
            }
        }
    }

    /// Tears down every instance, e.g. on process exit.
    pub async fn shutdown(&self) -> usize {
        let mut registry = self.registry.lock().await;
        let count = registry.len();
        let entries = registry.drain();

        for (id, mut entry) in entries {
            self.teardown(&id, &mut entry).await;
            self.update_status(&id, InstanceStatus::Inactive, false).await;
        }

        info!(count, "All instances shut down");
        count
    }

    pub async fn list_group_instances(&self, group_id: &str) -> Result<Vec<ConsumerInstance>> {
        Ok(self.store.list_instances(group_id).await?)
    }

    pub async fn recent_logs(&self, instance_id: &str, limit: u32) -> Result<Vec<ConsumerLog>> {
        Ok(self.store.list_logs(instance_id, limit).await?)
    }

    async fn open_consumer(
        &self,
        instance_id: &str,
        group_id: &str,
        topics: &[String],
    ) -> Result<Arc<dyn ConsumerHandle>, BrokerError> {
        let handle = self.broker.connect(group_id, instance_id).await?;
        // Groups are short-lived, so every (re)subscribe replays retained history.
        if let Err(e) = handle.subscribe(topics, true).await {
            if let Err(stop_err) = handle.stop().await {
                debug!(instance_id, error = %stop_err, "Failed to release unsubscribed consumer");
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Cancel, disconnect, wait for the loop to exit, then stop. Each step is
    /// attempted regardless of the previous one failing. The loop is joined
    /// before `stop` so it no longer holds the consumer when it is closed.
    async fn teardown(&self, instance_id: &str, entry: &mut RegistryEntry) {
        entry.cancel.cancel();

        if let Err(e) = entry.handle.disconnect().await {
            error!(instance_id, error = %e, "Failed to disconnect consumer");
        }
        self.join_loop(instance_id, entry).await;
        if let Err(e) = entry.handle.stop().await {
            error!(instance_id, error = %e, "Failed to stop consumer");
        }
    }

    async fn join_loop(&self, instance_id: &str, entry: &mut RegistryEntry) {
        if let Some(task) = entry.task.take() {
            match tokio::time::timeout(self.stop_grace, task).await {
                Ok(Ok(())) => debug!(instance_id, "Consume loop exited"),
                Ok(Err(e)) => warn!(instance_id, error = %e, "Consume loop ended abnormally"),
                Err(_) => warn!(
                    instance_id,
                    grace_ms = self.stop_grace.as_millis() as u64,
                    "Consume loop still running after grace period, detaching"
                ),
            }
        }
    }

    async fn mark_stopped(&self, instance_id: &str) {
        self.update_status(instance_id, InstanceStatus::Inactive, true)
            .await;
    }

    async fn update_status(&self, instance_id: &str, status: InstanceStatus, should_stop: bool) {
        let result = match self.store.find_instance(instance_id).await {
            Ok(Some(mut instance)) => {
                instance.status = status;
                instance.should_stop = should_stop;
                instance.updated_at = Utc::now();
                self.store.upsert_instance(&instance).await
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(instance_id, error = %e, "Failed to update instance status");
        }
    }

    async fn save_instance(
        &self,
        instance_id: &str,
        group_id: &str,
        topics: &[String],
        status: InstanceStatus,
    ) {
        let now = Utc::now();
        let mut record = ConsumerInstance::new(instance_id, group_id, topics, status, self.pid, now);

        match self.store.find_instance(instance_id).await {
            Ok(Some(existing)) => record.created_at = existing.created_at,
            Ok(None) => {}
            Err(e) => warn!(instance_id, error = %e, "Failed to look up instance record"),
        }

        if let Err(e) = self.store.upsert_instance(&record).await {
            error!(instance_id, error = %e, "Failed to save instance record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::StoreError;
    use crate::infrastructure::broadcast::ChannelBroadcaster;
    use crate::infrastructure::persistence::sqlite_state_store::SqliteStateStore;
    use crate::test_util::{wait_for_logs, FakeBroker, FlakyStore};
    use chrono::DateTime;
    use std::time::Duration;

    struct Harness {
        broker: Arc<FakeBroker>,
        store: Arc<FlakyStore>,
        events: ChannelBroadcaster,
        usecase: ConsumerGroupUsecase,
    }

    async fn harness() -> Harness {
        let broker = Arc::new(FakeBroker::default());
        let store = Arc::new(FlakyStore::new(SqliteStateStore::new_in_memory().await.unwrap()));
        let events = ChannelBroadcaster::new(64);
        let usecase = ConsumerGroupUsecase::new(
            broker.clone(),
            store.clone(),
            Arc::new(events.clone()),
            Duration::from_secs(1),
        );
        Harness {
            broker,
            store,
            events,
            usecase,
        }
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn create_registers_and_persists_every_instance() {
        let h = harness().await;

        let result = h
            .usecase
            .create_group("orders", &topics(&["orders-topic"]), 2)
            .await;

        assert!(result.success);
        assert_eq!(result.started_count, 2);
        assert_eq!(result.instance_ids, vec!["orders-inst-0", "orders-inst-1"]);
        for id in &result.instance_ids {
            assert!(h.usecase.is_running(id).await);
            let record = h.store.find_instance(id).await.unwrap().unwrap();
            assert_eq!(record.status, InstanceStatus::Active);
            assert_eq!(record.topics, topics(&["orders-topic"]));
            assert!(!record.should_stop);

            let consumer = h.broker.consumer(id).unwrap();
            assert_eq!(consumer.subscribed_topics(), topics(&["orders-topic"]));
            assert!(consumer.from_beginning());
        }
    }

    #[tokio::test]
    async fn create_with_zero_instances_starts_nothing() {
        let h = harness().await;
        let result = h.usecase.create_group("orders", &topics(&["t"]), 0).await;

        assert!(result.success);
        assert!(result.instance_ids.is_empty());
        assert!(h.usecase.running_instances().await.is_empty());
    }

    #[tokio::test]
    async fn create_without_topics_is_rejected() {
        let h = harness().await;
        let result = h.usecase.create_group("orders", &topics(&[" "]), 3).await;

        assert!(!result.success);
        assert_eq!(result.started_count, 0);
        assert_eq!(h.broker.connect_count("orders-inst-0"), 0);
        assert!(h.store.find_instance("orders-inst-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_create_refreshes_records_without_restarting() {
        let h = harness().await;
        h.usecase.create_group("orders", &topics(&["a"]), 2).await;

        let again = h.usecase.create_group("orders", &topics(&["a", "b"]), 3).await;

        assert!(again.success);
        assert_eq!(again.instance_ids, vec!["orders-inst-2"]);
        assert_eq!(h.broker.connect_count("orders-inst-0"), 1);
        assert_eq!(h.broker.connect_count("orders-inst-1"), 1);
        assert_eq!(h.usecase.running_instances().await.len(), 3);

        let refreshed = h.store.find_instance("orders-inst-0").await.unwrap().unwrap();
        assert_eq!(refreshed.topics, topics(&["a", "b"]));
        assert_eq!(refreshed.status, InstanceStatus::Active);
    }

    #[tokio::test]
    async fn connect_failure_marks_error_and_continues() {
        let h = harness().await;
        h.broker.fail_connect("pay-inst-1");

        let result = h.usecase.create_group("pay", &topics(&["p"]), 3).await;

        assert!(result.success);
        assert_eq!(result.instance_ids, vec!["pay-inst-0", "pay-inst-2"]);
        assert!(!h.usecase.is_running("pay-inst-1").await);
        let failed = h.store.find_instance("pay-inst-1").await.unwrap().unwrap();
        assert_eq!(failed.status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn subscribe_failure_releases_the_handle() {
        let h = harness().await;
        h.broker.fail_subscribe("pay-inst-0");

        let result = h.usecase.create_group("pay", &topics(&["p"]), 1).await;

        assert_eq!(result.started_count, 0);
        assert!(h.broker.consumer("pay-inst-0").unwrap().is_stopped());
        let failed = h.store.find_instance("pay-inst-0").await.unwrap().unwrap();
        assert_eq!(failed.status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn stop_group_tears_down_and_marks_inactive() {
        let h = harness().await;
        h.usecase.create_group("orders", &topics(&["orders-topic"]), 2).await;
        h.usecase.create_group("orders2", &topics(&["other"]), 1).await;

        let result = h.usecase.stop_group("orders").await;

        assert!(result.success);
        assert_eq!(result.stopped_count, 2);
        assert_eq!(h.usecase.running_instances().await, vec!["orders2-inst-0"]);
        for id in ["orders-inst-0", "orders-inst-1"] {
            let consumer = h.broker.consumer(id).unwrap();
            assert!(consumer.is_disconnected());
            assert!(consumer.is_stopped());
            let record = h.store.find_instance(id).await.unwrap().unwrap();
            assert_eq!(record.status, InstanceStatus::Inactive);
            assert!(record.should_stop);
        }
    }

    #[tokio::test]
    async fn consumer_is_stopped_only_after_its_loop_exits() {
        let h = harness().await;
        h.usecase.create_group("orders", &topics(&["t"]), 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.usecase.stop_group("orders").await;
        let first = h.broker.consumer("orders-inst-0").unwrap();
        assert!(first.is_stopped());
        assert!(!first.stopped_while_receiving());

        h.usecase.create_group("orders", &topics(&["t"]), 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.usecase.stop_instance("orders-inst-1").await;
        let second = h.broker.consumer("orders-inst-1").unwrap();
        assert!(second.is_stopped());
        assert!(!second.stopped_while_receiving());
    }

    /// Panics on log writes for one instance.
    struct PanickingStore {
        inner: SqliteStateStore,
        poisoned: &'static str,
    }

    #[async_trait::async_trait]
    impl StateStore for PanickingStore {
        async fn find_instance(&self, id: &str) -> Result<Option<ConsumerInstance>, StoreError> {
            self.inner.find_instance(id).await
        }

        async fn upsert_instance(&self, instance: &ConsumerInstance) -> Result<(), StoreError> {
            self.inner.upsert_instance(instance).await
        }

        async fn insert_log(&self, log: &ConsumerLog) -> Result<(), StoreError> {
            if log.consumer_id == self.poisoned {
                panic!("log write exploded for {}", log.consumer_id);
            }
            self.inner.insert_log(log).await
        }

        async fn list_instances(&self, group_id: &str) -> Result<Vec<ConsumerInstance>, StoreError> {
            self.inner.list_instances(group_id).await
        }

        async fn list_logs(&self, consumer_id: &str, limit: u32) -> Result<Vec<ConsumerLog>, StoreError> {
            self.inner.list_logs(consumer_id, limit).await
        }

        async fn touch_heartbeats(&self, ids: &[String], at: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.touch_heartbeats(ids, at).await
        }

        async fn deactivate_stale_instances(&self, at: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.deactivate_stale_instances(at).await
        }
    }

    #[tokio::test]
    async fn panic_in_one_loop_leaves_siblings_running() {
        let broker = Arc::new(FakeBroker::default());
        let store = Arc::new(PanickingStore {
            inner: SqliteStateStore::new_in_memory().await.unwrap(),
            poisoned: "g-inst-0",
        });
        let usecase = ConsumerGroupUsecase::new(
            broker.clone(),
            store.clone(),
            Arc::new(ChannelBroadcaster::new(16)),
            Duration::from_secs(1),
        );
        usecase.create_group("g", &topics(&["t"]), 2).await;

        broker.consumer("g-inst-0").unwrap().deliver("t", 0, "1", "boom");
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.consumer("g-inst-1").unwrap().deliver("t", 0, "1", "fine");

        let logs = wait_for_logs(store.as_ref(), "g-inst-1", 1).await;
        assert_eq!(logs[0].data, "fine");
        assert!(usecase.is_running("g-inst-0").await);

        let stopped = usecase.stop_group("g").await;
        assert_eq!(stopped.stopped_count, 2);
        assert!(usecase.running_instances().await.is_empty());
        let record = store.find_instance("g-inst-0").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Inactive);
    }

    #[tokio::test]
    async fn stop_group_without_matches_reports_failure() {
        let h = harness().await;
        let result = h.usecase.stop_group("ghost").await;

        assert!(!result.success);
        assert_eq!(result.stopped_count, 0);
    }

    #[tokio::test]
    async fn stop_failures_still_remove_the_entry() {
        let h = harness().await;
        h.usecase.create_group("orders", &topics(&["t"]), 1).await;
        let consumer = h.broker.consumer("orders-inst-0").unwrap();
        consumer.fail_teardown();

        let result = h.usecase.stop_group("orders").await;

        assert!(result.success);
        assert!(!h.usecase.is_running("orders-inst-0").await);
    }

    #[tokio::test]
    async fn stop_instance_leaves_durable_record_untouched() {
        let h = harness().await;
        h.usecase.create_group("orders", &topics(&["t"]), 2).await;

        h.usecase.stop_instance("orders-inst-0").await;

        assert!(!h.usecase.is_running("orders-inst-0").await);
        assert!(h.usecase.is_running("orders-inst-1").await);
        assert!(h.broker.consumer("orders-inst-0").unwrap().is_stopped());
        let record = h.store.find_instance("orders-inst-0").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Active);
        assert!(!record.should_stop);
    }

    #[tokio::test]
    async fn stop_instance_requires_exact_id() {
        let h = harness().await;
        h.usecase.create_group("orders", &topics(&["t"]), 1).await;

        h.usecase.stop_instance("orders").await;

        assert!(h.usecase.is_running("orders-inst-0").await);
    }

    #[tokio::test]
    async fn messages_are_persisted_and_broadcast() {
        let h = harness().await;
        let mut rx = h.events.subscribe();
        h.usecase.create_group("orders", &topics(&["orders-topic"]), 1).await;

        let consumer = h.broker.consumer("orders-inst-0").unwrap();
        consumer.deliver("orders-topic", 0, "5", r#"{"id":"tx-42","amount":10}"#);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, "orders-inst-0-5");
        assert_eq!(event.payload["consumerId"], "orders-inst-0");
        assert_eq!(event.payload["groupId"], "orders");
        assert_eq!(event.payload["partition"], 0);
        assert_eq!(event.payload["offset"], "5");

        let logs = wait_for_logs(h.store.as_ref(), "orders-inst-0", 1).await;
        assert_eq!(logs[0].original_log_id, "tx-42");
        assert_eq!(logs[0].data, r#"{"id":"tx-42","amount":10}"#);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_stop_consumption() {
        let h = harness().await;
        let mut rx = h.events.subscribe();
        h.usecase.create_group("orders", &topics(&["t"]), 1).await;
        let consumer = h.broker.consumer("orders-inst-0").unwrap();

        h.store.fail_log_writes(true);
        consumer.deliver("t", 0, "1", "first");
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.key, "orders-inst-0-1");

        h.store.fail_log_writes(false);
        consumer.deliver("t", 0, "2", "second");

        let logs = wait_for_logs(h.store.as_ref(), "orders-inst-0", 1).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].offset, "2");
        assert!(h.usecase.is_running("orders-inst-0").await);
    }

    #[tokio::test]
    async fn loop_failure_leaves_a_stale_entry_that_can_be_stopped() {
        let h = harness().await;
        h.usecase.create_group("orders", &topics(&["t"]), 2).await;
        let broken = h.broker.consumer("orders-inst-0").unwrap();
        broken.fail_recv("broker went away");
        tokio::time::sleep(Duration::from_millis(50)).await;

        // the sibling keeps consuming
        h.broker.consumer("orders-inst-1").unwrap().deliver("t", 0, "1", "ok");
        wait_for_logs(h.store.as_ref(), "orders-inst-1", 1).await;

        assert!(h.usecase.is_running("orders-inst-0").await);
        h.usecase.stop_instance("orders-inst-0").await;
        assert!(!h.usecase.is_running("orders-inst-0").await);
    }

    #[tokio::test]
    async fn no_messages_are_persisted_after_stop() {
        let h = harness().await;
        h.usecase.create_group("orders", &topics(&["t"]), 1).await;
        let consumer = h.broker.consumer("orders-inst-0").unwrap();
        consumer.deliver("t", 0, "1", "before");
        wait_for_logs(h.store.as_ref(), "orders-inst-0", 1).await;

        h.usecase.stop_instance("orders-inst-0").await;
        consumer.deliver("t", 0, "2", "after");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let logs = h.store.list_logs("orders-inst-0", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].data, "before");
    }

    #[tokio::test]
    async fn shutdown_stops_everything_without_stop_flag() {
        let h = harness().await;
        h.usecase.create_group("a", &topics(&["t"]), 1).await;
        h.usecase.create_group("b", &topics(&["t"]), 1).await;

        assert_eq!(h.usecase.shutdown().await, 2);
        assert!(h.usecase.running_instances().await.is_empty());
        let record = h.store.find_instance("b-inst-0").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Inactive);
        assert!(!record.should_stop);
    }

    #[tokio::test]
    async fn heartbeat_touches_running_instances_only() {
        let h = harness().await;
        h.usecase.create_group("a", &topics(&["t"]), 2).await;
        h.broker.fail_connect("b-inst-0");
        h.usecase.create_group("b", &topics(&["t"]), 1).await;

        assert_eq!(h.usecase.heartbeat().await, 2);
    }

    #[tokio::test]
    async fn reconcile_deactivates_leftover_records() {
        let h = harness().await;
        let leftover = ConsumerInstance::new(
            "old-inst-0",
            "old",
            &topics(&["t"]),
            InstanceStatus::Active,
            1,
            Utc::now(),
        );
        h.store.upsert_instance(&leftover).await.unwrap();

        assert_eq!(h.usecase.reconcile_stale_instances().await, 1);
        let record = h.store.find_instance("old-inst-0").await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Inactive);
    }
}
