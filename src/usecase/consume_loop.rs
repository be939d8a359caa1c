use crate::domain::broker::{BrokerMessage, ConsumerHandle};
use crate::domain::error::BrokerError;
use crate::domain::event::MessageReceived;
use crate::domain::log::ConsumerLog;
use crate::domain::repository::{EventBroadcaster, StateStore};
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

/// Everything one running instance needs to process its deliveries.
pub(crate) struct InstanceWorker {
    pub(crate) instance_id: String,
    pub(crate) group_id: String,
    pub(crate) handle: Arc<dyn ConsumerHandle>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) broadcaster: Arc<dyn EventBroadcaster>,
}

impl InstanceWorker {
    /// Spawns the loop. Errors and panics end this task only and are logged here.
    pub(crate) fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let span = info_span!("consumer", instance_id = %self.instance_id);
        tokio::spawn(
            async move {
                match AssertUnwindSafe(self.run(cancel)).catch_unwind().await {
                    Ok(Ok(())) => info!("Consume loop finished"),
                    Ok(Err(e)) => error!(error = %e, "Consume loop failed"),
                    Err(_) => error!("Consume loop panicked"),
                }
            }
            .instrument(span),
        )
    }

    async fn run(self, cancel: CancellationToken) -> Result<(), BrokerError> {
        loop {
            // Cancellation is only observed between messages.
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                received = self.handle.recv() => received?,
            };

            match received {
                Some(message) => self.on_message(message).await,
                None => return Ok(()),
            }
        }
    }

    async fn on_message(&self, message: BrokerMessage) {
        let received_at = Utc::now();
        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = %message.offset,
            "Message received"
        );

        let log = ConsumerLog::processed(&self.instance_id, &self.group_id, &message, received_at);
        self.persist(&log).await;

        let event = MessageReceived {
            consumer_id: self.instance_id.clone(),
            group_id: self.group_id.clone(),
            topic: message.topic,
            partition: message.partition,
            offset: message.offset,
            value: message.value,
            timestamp: received_at,
        };
        match serde_json::to_value(&event) {
            Ok(payload) => self.broadcaster.broadcast(&event.event_key(), payload),
            Err(e) => error!(error = %e, "Failed to encode message event"),
        }
    }

    // Never retried; a failed write must not hold up the next delivery.
    async fn persist(&self, log: &ConsumerLog) {
        if let Err(e) = self.store.insert_log(log).await {
            error!(offset = %log.offset, error = %e, "Failed to persist consumer log");
        }
    }
}
