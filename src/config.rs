use crate::domain::broker::{BrokerProfile, SaslMechanism, SecurityConfig};
use crate::Error;
use clap::Parser;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BROKER: &str = "localhost:9092";
pub const DEFAULT_CLIENT_ID: &str = "dynamic-manager";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://consumers.db";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const KEYRING_SERVICE: &str = "dynamic-consumers";

#[derive(Parser, Debug, Clone)]
#[command(name = "dynamic-consumers", version, about = "Runs Kafka consumer groups created at runtime")]
pub struct Config {
    /// Kafka bootstrap servers (host:port[,host:port])
    #[arg(long, env = "KAFKA_BROKER", default_value = DEFAULT_BROKER)]
    pub broker: String,

    /// Prefix of the client.id reported by every instance
    #[arg(long, env = "KAFKA_CLIENT_ID", default_value = DEFAULT_CLIENT_ID)]
    pub client_id: String,

    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    pub database_url: String,

    /// plaintext, ssl or sasl_ssl
    #[arg(long, env = "KAFKA_SECURITY_PROTOCOL", default_value = "plaintext")]
    pub security_protocol: String,

    #[arg(long, env = "KAFKA_SASL_MECHANISM", default_value = "PLAIN")]
    pub sasl_mechanism: String,

    #[arg(long, env = "KAFKA_SASL_USERNAME")]
    pub sasl_username: Option<String>,

    /// Falls back to the OS keyring when unset
    #[arg(long, env = "KAFKA_SASL_PASSWORD", hide_env_values = true)]
    pub sasl_password: Option<String>,

    #[arg(long, env = "KAFKA_SSL_CA_LOCATION")]
    pub ssl_ca_location: Option<String>,

    #[arg(long, env = "KAFKA_SSL_CERTIFICATE_LOCATION")]
    pub ssl_certificate_location: Option<String>,

    #[arg(long, env = "KAFKA_SSL_KEY_LOCATION")]
    pub ssl_key_location: Option<String>,

    /// Seconds between heartbeat writes; 0 disables them
    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// How long a stop waits for a consume loop to exit
    #[arg(long, env = "STOP_GRACE_MS", default_value_t = 5000)]
    pub stop_grace_ms: u64,

    /// Group to start at boot: <group>:<topic[,topic]>[:<instances>]
    #[arg(long = "group", value_name = "GROUP")]
    pub groups: Vec<GroupSpec>,

    #[arg(long, env = "LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,
}

impl Config {
    pub fn broker_profile(&self) -> Result<BrokerProfile, Error> {
        let security = match self.security_protocol.to_ascii_lowercase().as_str() {
            "plaintext" => SecurityConfig::Plaintext,
            "ssl" => SecurityConfig::Ssl {
                ca_location: self.ssl_ca_location.clone(),
                certificate_location: self.ssl_certificate_location.clone(),
                key_location: self.ssl_key_location.clone(),
            },
            "sasl_ssl" => {
                let username = self.sasl_username.clone().ok_or_else(|| {
                    Error::Config("sasl_ssl requires --sasl-username".to_string())
                })?;
                SecurityConfig::SaslSsl {
                    mechanism: SaslMechanism::from_str(&self.sasl_mechanism).map_err(Error::Config)?,
                    username,
                    ca_location: self.ssl_ca_location.clone(),
                }
            }
            other => {
                return Err(Error::Config(format!(
                    "unsupported security protocol '{}'",
                    other
                )))
            }
        };

        Ok(BrokerProfile {
            brokers: self.broker.clone(),
            client_id: self.client_id.clone(),
            security,
        })
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// A group requested on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub group_id: String,
    pub topics: Vec<String>,
    pub instances: u32,
}

impl FromStr for GroupSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let group_id = parts.next().unwrap_or_default().trim();
        let topics: Vec<String> = parts
            .next()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        let instances = match parts.next() {
            Some(n) => n
                .trim()
                .parse::<u32>()
                .map_err(|e| format!("invalid instance count '{}': {}", n, e))?,
            None => 1,
        };

        if group_id.is_empty() || topics.is_empty() {
            return Err(format!("expected <group>:<topic[,topic]>[:<instances>], got '{}'", s));
        }

        Ok(GroupSpec {
            group_id: group_id.to_string(),
            topics,
            instances,
        })
    }
}
