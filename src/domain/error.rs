use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to {brokers}: {reason}")]
    Connect { brokers: String, reason: String },
    #[error("Failed to subscribe to [{topics}]: {reason}")]
    Subscribe { topics: String, reason: String },
    #[error("Consumer is not subscribed")]
    NotSubscribed,
    #[error("Failed to receive message: {0}")]
    Receive(String),
    #[error("Failed to disconnect: {0}")]
    Disconnect(String),
    #[error("Failed to stop consumer: {0}")]
    Stop(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Corrupt row {id}: {reason}")]
    CorruptRow { id: String, reason: String },
}
