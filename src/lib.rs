pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod test_util;
pub mod usecase;

use crate::config::{Config, KEYRING_SERVICE};
use crate::domain::broker::{BrokerProfile, SecurityConfig};
use crate::domain::error::StoreError;
use crate::infrastructure::broadcast::ChannelBroadcaster;
use crate::infrastructure::kafka::KafkaInfrastructure;
use crate::infrastructure::persistence::keyring_secret_repository::KeyringSecretRepository;
use crate::infrastructure::persistence::sqlite_state_store::SqliteStateStore;
use crate::usecase::consumer_group_usecase::ConsumerGroupUsecase;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub struct AppState {
    pub consumer_groups: Arc<ConsumerGroupUsecase>,
    pub events: ChannelBroadcaster,
}

/// Wires the store, broker client and broadcaster together and clears
/// records left behind by a previous process.
pub async fn bootstrap(config: &Config) -> Result<AppState, Error> {
    let profile = config.broker_profile()?;
    let password = resolve_password(config, &profile);

    info!(database_url = %config.database_url, "Opening state store");
    let store = SqliteStateStore::new(&config.database_url).await?;

    let kafka_infra = KafkaInfrastructure::new(profile, password);
    let events = ChannelBroadcaster::new(EVENT_CAPACITY);

    let consumer_groups = Arc::new(ConsumerGroupUsecase::new(
        Arc::new(kafka_infra),
        Arc::new(store),
        Arc::new(events.clone()),
        config.stop_grace(),
    ));
    consumer_groups.reconcile_stale_instances().await;

    Ok(AppState {
        consumer_groups,
        events,
    })
}

fn resolve_password(config: &Config, profile: &BrokerProfile) -> Option<String> {
    if config.sasl_password.is_some() {
        return config.sasl_password.clone();
    }
    let SecurityConfig::SaslSsl { username, .. } = &profile.security else {
        return None;
    };
    match KeyringSecretRepository::new(KEYRING_SERVICE).get_password(username) {
        Ok(password) => Some(password),
        Err(e) => {
            warn!(error = %e, "No SASL password configured");
            None
        }
    }
}

/// Runs until Ctrl-C, then stops every instance.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = bootstrap(&config).await?;
    serve(state, &config, tokio::signal::ctrl_c()).await;
    Ok(())
}

/// Starts the boot groups and background tasks, waits for `stop_signal`, then
/// shuts everything down. A failing signal is treated as a request to stop.
pub async fn serve<F>(state: AppState, config: &Config, stop_signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    let shutdown = CancellationToken::new();

    let observer = tokio::spawn(observe_events(state.events.clone(), shutdown.clone()));
    let heartbeat = config.heartbeat_interval().map(|interval| {
        tokio::spawn(heartbeat_loop(
            state.consumer_groups.clone(),
            interval,
            shutdown.clone(),
        ))
    });

    for group in &config.groups {
        let result = state
            .consumer_groups
            .create_group(&group.group_id, &group.topics, group.instances)
            .await;
        info!(group_id = %group.group_id, message = %result.message, "Boot group requested");
    }

    info!(broker = %config.broker, "Consumer manager running");
    if let Err(e) = stop_signal.await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }
    info!("Shutting down");

    shutdown.cancel();
    state.consumer_groups.shutdown().await;
    if let Some(heartbeat) = heartbeat {
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
    }
    if let Err(e) = observer.await {
        warn!(error = %e, "Event observer ended abnormally");
    }
}

async fn observe_events(events: ChannelBroadcaster, shutdown: CancellationToken) {
    let mut rx = events.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            event = rx.recv() => match event {
                Ok(event) => debug!(key = %event.key, payload = %event.payload, "Message event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event observer lagged"),
                Err(RecvError::Closed) => return,
            },
        }
    }
}

async fn heartbeat_loop(
    consumer_groups: Arc<ConsumerGroupUsecase>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                consumer_groups.heartbeat().await;
            }
        }
    }
}
