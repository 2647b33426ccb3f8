// src/rabbitmq/errors.rs

use std::time::Duration;

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitError {
    #[error("Connection is already connected")]
    AlreadyConnected,

    #[error("Connection has not been established yet")]
    NotActivated,

    #[error("Connection is activated but no broker link is live")]
    NotConnected,

    #[error("Consumer already initialized")]
    AlreadyInitialized,

    #[error("Consumer not initialized yet")]
    NotInitialized,

    #[error("Publisher is stopping")]
    PublisherStopping,

    #[error("Publisher has been stopped")]
    PublisherStopped,

    #[error("Publisher channel is not available")]
    ChannelUnavailable,

    #[error("Channel buffer is full")]
    ChannelBufferFull,

    #[error("Broker rejected the published message")]
    PublishNacked,

    #[error("Can not stop {component} gracefully, in-flight work did not finish within {timeout:?}")]
    StopTimeout {
        component: &'static str,
        timeout: Duration,
    },

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitError>;

// Converting from lapin errors
impl From<LapinError> for RabbitError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::IOError(_)
            | LapinError::InvalidConnectionState(_)
            | LapinError::MissingHeartbeatError => {
                RabbitError::ConnectionError(error.to_string())
            }
            LapinError::InvalidChannel(_)
            | LapinError::InvalidChannelState(_)
            | LapinError::ChannelsLimitReached => RabbitError::ChannelError(error.to_string()),
            _ => RabbitError::Unknown(error.to_string()),
        }
    }
}
