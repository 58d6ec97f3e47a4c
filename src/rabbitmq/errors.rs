// src/rabbitmq/errors.rs

use lapin::{ChannelState, ConnectionState, Error as LapinError};
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("Session configuration error: {0}")]
    ConfigurationError(String),

    #[error("RabbitMQ topology error: {0}")]
    TopologyError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("Channel or connection is already closed")]
    AlreadyClosed,
}

// Custom Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Teardown treats this as success.
    pub fn is_already_closed(&self) -> bool {
        matches!(self, SessionError::AlreadyClosed)
    }
}

/// Whether lapin refused the call because the channel or connection is gone.
pub(crate) fn is_closed_state(error: &LapinError) -> bool {
    matches!(
        error,
        LapinError::InvalidChannelState(ChannelState::Closed | ChannelState::Closing | ChannelState::Error)
            | LapinError::InvalidConnectionState(
                ConnectionState::Closed | ConnectionState::Closing | ConnectionState::Error
            )
    )
}

/// Classification used while tearing a session down.
pub(crate) fn closing_error(error: LapinError) -> SessionError {
    if is_closed_state(&error) {
        SessionError::AlreadyClosed
    } else {
        SessionError::ConnectionError(error.to_string())
    }
}
