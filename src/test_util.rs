//! Scripted stand-ins for the broker and a store wrapper with injectable
//! failures. Used by unit tests and the integration suite.

use crate::domain::broker::{BrokerClient, BrokerMessage, ConsumerHandle};
use crate::domain::error::{BrokerError, StoreError};
use crate::domain::instance::ConsumerInstance;
use crate::domain::log::ConsumerLog;
use crate::domain::repository::StateStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

enum Delivery {
    Message(BrokerMessage),
    Failure(String),
}

/// Broker whose instances are fed by the test through [`FakeConsumer::deliver`].
#[derive(Default)]
pub struct FakeBroker {
    consumers: Mutex<HashMap<String, Arc<FakeConsumer>>>,
    connects: Mutex<HashMap<String, usize>>,
    refuse_connect: Mutex<HashSet<String>>,
    refuse_subscribe: Mutex<HashSet<String>>,
}

impl FakeBroker {
    pub fn fail_connect(&self, instance_id: &str) {
        self.refuse_connect.lock().insert(instance_id.to_string());
    }

    pub fn fail_subscribe(&self, instance_id: &str) {
        self.refuse_subscribe.lock().insert(instance_id.to_string());
    }

    /// The handle most recently handed out for `instance_id`.
    pub fn consumer(&self, instance_id: &str) -> Option<Arc<FakeConsumer>> {
        self.consumers.lock().get(instance_id).cloned()
    }

    pub fn connect_count(&self, instance_id: &str) -> usize {
        self.connects.lock().get(instance_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn connect(
        &self,
        _group_id: &str,
        instance_id: &str,
    ) -> Result<Arc<dyn ConsumerHandle>, BrokerError> {
        *self.connects.lock().entry(instance_id.to_string()).or_default() += 1;

        if self.refuse_connect.lock().contains(instance_id) {
            return Err(BrokerError::Connect {
                brokers: "fake:9092".to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let consumer = Arc::new(FakeConsumer {
            refuse_subscribe: self.refuse_subscribe.lock().contains(instance_id),
            ..FakeConsumer::default()
        });
        self.consumers
            .lock()
            .insert(instance_id.to_string(), consumer.clone());
        Ok(consumer)
    }
}

pub struct FakeConsumer {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    subscription: Mutex<Option<(Vec<String>, bool)>>,
    refuse_subscribe: bool,
    failing_teardown: AtomicBool,
    disconnected: AtomicBool,
    stopped: AtomicBool,
    receiving: AtomicUsize,
    stopped_mid_receive: AtomicBool,
}

/// Counts a `recv` future as in flight until it completes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for FakeConsumer {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            subscription: Mutex::new(None),
            refuse_subscribe: false,
            failing_teardown: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            receiving: AtomicUsize::new(0),
            stopped_mid_receive: AtomicBool::new(false),
        }
    }
}

impl FakeConsumer {
    pub fn deliver(&self, topic: &str, partition: i32, offset: &str, value: &str) {
        let _ = self.tx.send(Delivery::Message(BrokerMessage {
            topic: topic.to_string(),
            partition,
            offset: offset.to_string(),
            value: value.to_string(),
        }));
    }

    /// The next `recv` fails with a fatal error.
    pub fn fail_recv(&self, reason: &str) {
        let _ = self.tx.send(Delivery::Failure(reason.to_string()));
    }

    /// Makes `disconnect` and `stop` return errors (they still take effect).
    pub fn fail_teardown(&self) {
        self.failing_teardown.store(true, Ordering::SeqCst);
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscription
            .lock()
            .as_ref()
            .map(|(topics, _)| topics.clone())
            .unwrap_or_default()
    }

    pub fn from_beginning(&self) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .is_some_and(|(_, from_beginning)| *from_beginning)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// True if `stop` ran while a consume loop was still waiting in `recv`.
    pub fn stopped_while_receiving(&self) -> bool {
        self.stopped_mid_receive.load(Ordering::SeqCst)
    }

    fn teardown_result(&self, error: fn(String) -> BrokerError) -> Result<(), BrokerError> {
        if self.failing_teardown.load(Ordering::SeqCst) {
            Err(error("broker unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConsumerHandle for FakeConsumer {
    async fn subscribe(&self, topics: &[String], from_beginning: bool) -> Result<(), BrokerError> {
        if self.refuse_subscribe {
            return Err(BrokerError::Subscribe {
                topics: topics.join(","),
                reason: "unknown topic".to_string(),
            });
        }
        *self.subscription.lock() = Some((topics.to_vec(), from_beginning));
        Ok(())
    }

    async fn recv(&self) -> Result<Option<BrokerMessage>, BrokerError> {
        if self.is_stopped() {
            return Ok(None);
        }
        let _in_flight = InFlight::enter(&self.receiving);
        match self.rx.lock().await.recv().await {
            Some(Delivery::Message(message)) => Ok(Some(message)),
            Some(Delivery::Failure(reason)) => Err(BrokerError::Receive(reason)),
            None => Ok(None),
        }
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.disconnected.store(true, Ordering::SeqCst);
        self.teardown_result(BrokerError::Disconnect)
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        if self.receiving.load(Ordering::SeqCst) > 0 {
            self.stopped_mid_receive.store(true, Ordering::SeqCst);
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.teardown_result(BrokerError::Stop)
    }
}

/// Wraps a real store; log writes can be made to fail on demand.
pub struct FlakyStore {
    inner: Arc<dyn StateStore>,
    fail_logs: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: impl StateStore + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
            fail_logs: AtomicBool::new(false),
        }
    }

    pub fn fail_log_writes(&self, fail: bool) {
        self.fail_logs.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn find_instance(&self, id: &str) -> Result<Option<ConsumerInstance>, StoreError> {
        self.inner.find_instance(id).await
    }

    async fn upsert_instance(&self, instance: &ConsumerInstance) -> Result<(), StoreError> {
        self.inner.upsert_instance(instance).await
    }

    async fn insert_log(&self, log: &ConsumerLog) -> Result<(), StoreError> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
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

/// Polls until `consumer_id` has at least `count` logs; panics after two seconds.
pub async fn wait_for_logs(store: &dyn StateStore, consumer_id: &str, count: usize) -> Vec<ConsumerLog> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let logs = store
            .list_logs(consumer_id, 1000)
            .await
            .expect("list logs");
        if logs.len() >= count {
            return logs;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "expected {} logs for {}, found {}",
                count,
                consumer_id,
                logs.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
