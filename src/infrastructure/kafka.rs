use crate::domain::broker::{
    BrokerClient, BrokerMessage, BrokerProfile, ConsumerHandle, SecurityConfig,
};
use crate::domain::error::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka-backed [`BrokerClient`]. Every instance gets its own librdkafka consumer
/// joined to the broker-side group named after the logical group.
pub struct KafkaInfrastructure {
    profile: BrokerProfile,
    password: Option<String>,
}

impl KafkaInfrastructure {
    pub fn new(profile: BrokerProfile, password: Option<String>) -> Self {
        Self { profile, password }
    }

    /// librdkafka settings implied by the profile's security mode. Optional
    /// paths are only emitted when configured.
    fn security_settings(&self) -> Vec<(&'static str, &str)> {
        let password = self.password.as_deref();
        match &self.profile.security {
            SecurityConfig::Plaintext => vec![("security.protocol", "plaintext")],
            SecurityConfig::Ssl {
                ca_location,
                certificate_location,
                key_location,
            } => [
                Some(("security.protocol", "ssl")),
                ca_location.as_deref().map(|v| ("ssl.ca.location", v)),
                certificate_location.as_deref().map(|v| ("ssl.certificate.location", v)),
                key_location.as_deref().map(|v| ("ssl.key.location", v)),
                password.map(|v| ("ssl.key.password", v)),
            ]
            .into_iter()
            .flatten()
            .collect(),
            SecurityConfig::SaslSsl {
                mechanism,
                username,
                ca_location,
            } => [
                Some(("security.protocol", "sasl_ssl")),
                Some(("sasl.mechanism", mechanism.as_str())),
                Some(("sasl.username", username.as_str())),
                password.map(|v| ("sasl.password", v)),
                ca_location.as_deref().map(|v| ("ssl.ca.location", v)),
            ]
            .into_iter()
            .flatten()
            .collect(),
        }
    }

    fn create_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.profile.brokers);
        for (key, value) in self.security_settings() {
            config.set(key, value);
        }
        config
    }

    fn consumer_config(&self, group_id: &str, instance_id: &str) -> ClientConfig {
        let mut config = self.create_config();
        config
            .set("group.id", group_id)
            .set("client.id", format!("{}-{}", self.profile.client_id, instance_id))
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "false");
        config
    }

    fn connect_error(&self, reason: impl ToString) -> BrokerError {
        BrokerError::Connect {
            brokers: self.profile.brokers.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaInfrastructure {
    async fn connect(
        &self,
        group_id: &str,
        instance_id: &str,
    ) -> Result<Arc<dyn ConsumerHandle>, BrokerError> {
        let config = self.consumer_config(group_id, instance_id);

        // librdkafka connects lazily; a metadata round trip proves the cluster is reachable.
        let metadata_client: BaseConsumer = config.create().map_err(|e| self.connect_error(e))?;
        tokio::task::spawn_blocking(move || {
            metadata_client
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|_| ())
        })
        .await
        .map_err(|e| self.connect_error(e))?
        .map_err(|e| self.connect_error(e))?;

        debug!(instance_id, brokers = %self.profile.brokers, "Connected to Kafka");
        Ok(Arc::new(KafkaConsumerHandle {
            instance_id: instance_id.to_string(),
            config,
            consumer: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }))
    }
}

pub struct KafkaConsumerHandle {
    instance_id: String,
    config: ClientConfig,
    consumer: Mutex<Option<Arc<StreamConsumer>>>,
    stopped: AtomicBool,
}

impl KafkaConsumerHandle {
    fn current(&self) -> Option<Arc<StreamConsumer>> {
        self.consumer.lock().clone()
    }
}

/// A consumer reference held across one `recv`. When a stop has already
/// released the handle's own reference, the lease is the last one and the
/// blocking close is moved to the blocking pool.
struct ConsumerLease(Option<Arc<StreamConsumer>>);

impl Drop for ConsumerLease {
    fn drop(&mut self) {
        let Some(consumer) = self.0.take() else {
            return;
        };
        if Arc::strong_count(&consumer) == 1 {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn_blocking(move || drop(consumer));
            }
        }
    }
}

fn to_broker_message(msg: &BorrowedMessage<'_>) -> BrokerMessage {
    BrokerMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset().to_string(),
        value: msg
            .payload()
            .map(|p| String::from_utf8_lossy(p).to_string())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl ConsumerHandle for KafkaConsumerHandle {
    async fn subscribe(&self, topics: &[String], from_beginning: bool) -> Result<(), BrokerError> {
        let subscribe_error = |reason: String| BrokerError::Subscribe {
            topics: topics.join(","),
            reason,
        };

        // auto.offset.reset is fixed at creation, so the consumer is built here.
        let mut config = self.config.clone();
        config.set(
            "auto.offset.reset",
            if from_beginning { "earliest" } else { "latest" },
        );
        let consumer: StreamConsumer = config.create().map_err(|e| subscribe_error(e.to_string()))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| subscribe_error(e.to_string()))?;

        *self.consumer.lock() = Some(Arc::new(consumer));
        debug!(instance_id = %self.instance_id, ?topics, from_beginning, "Subscribed");
        Ok(())
    }

    async fn recv(&self) -> Result<Option<BrokerMessage>, BrokerError> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Ok(None);
            }
            let lease = ConsumerLease(self.current());
            let Some(consumer) = lease.0.as_deref() else {
                return Err(BrokerError::NotSubscribed);
            };

            match consumer.recv().await {
                Ok(msg) => return Ok(Some(to_broker_message(&msg))),
                // Per-partition fetch problems are reported here and recovered by librdkafka.
                Err(KafkaError::MessageConsumption(code)) => {
                    warn!(instance_id = %self.instance_id, ?code, "Transient consume error");
                }
                Err(e) => return Err(BrokerError::Receive(e.to_string())),
            }
        }
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        if let Some(consumer) = self.current() {
            consumer.unsubscribe();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        self.stopped.store(true, Ordering::Release);
        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            // Closing leaves the group and blocks. A receive still in flight
            // holds its own lease and closes the consumer when it is dropped.
            tokio::task::spawn_blocking(move || drop(consumer))
                .await
                .map_err(|e| BrokerError::Stop(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::broker::SaslMechanism;

    fn profile(security: SecurityConfig) -> BrokerProfile {
        BrokerProfile {
            brokers: "localhost:9092".to_string(),
            client_id: "dynamic-manager".to_string(),
            security,
        }
    }

    #[test]
    fn consumer_config_carries_group_and_client_ids() {
        let infra = KafkaInfrastructure::new(profile(SecurityConfig::Plaintext), None);
        let config = infra.consumer_config("orders", "orders-inst-1");

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("group.id"), Some("orders"));
        assert_eq!(config.get("client.id"), Some("dynamic-manager-orders-inst-1"));
        assert_eq!(config.get("security.protocol"), Some("plaintext"));
    }

    #[test]
    fn sasl_profile_sets_credentials() {
        let infra = KafkaInfrastructure::new(
            profile(SecurityConfig::SaslSsl {
                mechanism: SaslMechanism::ScramSha256,
                username: "svc".to_string(),
                ca_location: Some("/etc/ca.pem".to_string()),
            }),
            Some("secret".to_string()),
        );
        let config = infra.create_config();

        assert_eq!(config.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-256"));
        assert_eq!(config.get("sasl.username"), Some("svc"));
        assert_eq!(config.get("sasl.password"), Some("secret"));
        assert_eq!(config.get("ssl.ca.location"), Some("/etc/ca.pem"));
    }

    #[test]
    fn ssl_profile_skips_missing_paths() {
        let infra = KafkaInfrastructure::new(
            profile(SecurityConfig::Ssl {
                ca_location: None,
                certificate_location: Some("/etc/client.pem".to_string()),
                key_location: None,
            }),
            None,
        );
        let config = infra.create_config();

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("ssl.certificate.location"), Some("/etc/client.pem"));
        assert_eq!(config.get("ssl.ca.location"), None);
        assert_eq!(config.get("ssl.key.password"), None);
    }

    fn unsubscribed_handle() -> KafkaConsumerHandle {
        let infra = KafkaInfrastructure::new(profile(SecurityConfig::Plaintext), None);
        KafkaConsumerHandle {
            instance_id: "orders-inst-0".to_string(),
            config: infra.consumer_config("orders", "orders-inst-0"),
            consumer: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    #[tokio::test]
    async fn recv_before_subscribe_is_rejected() {
        let handle = unsubscribed_handle();
        assert!(matches!(handle.recv().await, Err(BrokerError::NotSubscribed)));
    }

    #[tokio::test]
    async fn recv_after_stop_ends_the_stream() {
        let handle = unsubscribed_handle();
        handle.disconnect().await.unwrap();
        handle.stop().await.unwrap();

        assert!(handle.recv().await.unwrap().is_none());
    }
}
