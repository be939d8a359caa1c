use crate::domain::error::BrokerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Connection settings shared by every consumer instance the manager starts.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrokerProfile {
    pub brokers: String,
    pub client_id: String,
    pub security: SecurityConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", content = "config")]
pub enum SecurityConfig {
    Plaintext,
    Ssl {
        ca_location: Option<String>,
        certificate_location: Option<String>,
        key_location: Option<String>,
    },
    SaslSsl {
        mechanism: SaslMechanism,
        username: String,
        // Password is resolved at startup (flag, env or keyring)
        ca_location: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
    Gssapi,
    OAuthBearer,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
            SaslMechanism::Gssapi => "GSSAPI",
            SaslMechanism::OAuthBearer => "OAUTHBEARER",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(SaslMechanism::Plain),
            "SCRAM-SHA-256" => Ok(SaslMechanism::ScramSha256),
            "SCRAM-SHA-512" => Ok(SaslMechanism::ScramSha512),
            "GSSAPI" => Ok(SaslMechanism::Gssapi),
            "OAUTHBEARER" => Ok(SaslMechanism::OAuthBearer),
            other => Err(format!("unknown SASL mechanism '{}'", other)),
        }
    }
}

/// A single record handed to a consume loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    /// Broker-native offset; kept as text because it may exceed i64 on some brokers.
    pub offset: String,
    /// Payload decoded as UTF-8 (lossy). Empty when the record carried no value.
    pub value: String,
}

/// Creates per-instance consumer handles.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Opens a connection for `instance_id` inside the broker-side consumer group `group_id`.
    async fn connect(
        &self,
        group_id: &str,
        instance_id: &str,
    ) -> Result<Arc<dyn ConsumerHandle>, BrokerError>;
}

/// The broker primitives available to one consumer instance.
///
/// `recv` is the delivery primitive; the manager drives the loop around it in a
/// supervised task. `Ok(None)` means the handle has been stopped and will not
/// deliver again.
#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    async fn subscribe(&self, topics: &[String], from_beginning: bool) -> Result<(), BrokerError>;

    async fn recv(&self) -> Result<Option<BrokerMessage>, BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;

    async fn stop(&self) -> Result<(), BrokerError>;
}
