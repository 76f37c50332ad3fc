// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ connection closed: {0}")]
    ConnectionClosed(String),

    #[error("No free channels left on the RabbitMQ connection")]
    ChannelExhausted,

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Publishing to queue `{queue}` failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        queue: String,
        attempts: u32,
        #[source]
        source: Box<RabbitMQError>,
    },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// True for the failures `get_channel` recovers from by reconnecting once.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionClosed(_) | RabbitMQError::ChannelExhausted
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        match error {
            LapinError::ChannelsLimitReached => RabbitMQError::ChannelExhausted,
            LapinError::InvalidConnectionState(state) => {
                RabbitMQError::ConnectionClosed(format!("connection is {:?}", state))
            }
            LapinError::InvalidChannelState(state) => {
                RabbitMQError::ConnectionClosed(format!("channel is {:?}", state))
            }
            LapinError::IOError(err) => RabbitMQError::ConnectionError(err.to_string()),
            LapinError::MissingHeartbeatError => {
                RabbitMQError::ConnectionError("missed heartbeats from broker".to_string())
            }
            LapinError::ProtocolError(err) => RabbitMQError::ChannelError(err.to_string()),
            other => RabbitMQError::Unknown(other.to_string()),
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}

impl From<String> for RabbitMQError {
    fn from(message: String) -> Self {
        RabbitMQError::Unknown(message)
    }
}

impl From<&str> for RabbitMQError {
    fn from(message: &str) -> Self {
        RabbitMQError::Unknown(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_limit_maps_to_exhausted() {
        let err = RabbitMQError::from(LapinError::ChannelsLimitReached);
        assert!(matches!(err, RabbitMQError::ChannelExhausted));
        assert!(err.is_connection_lost());
    }

    #[test]
    fn missing_heartbeat_is_a_connection_error() {
        let err = RabbitMQError::from(LapinError::MissingHeartbeatError);
        assert!(matches!(err, RabbitMQError::ConnectionError(_)));
        assert!(!err.is_connection_lost());
    }

    #[test]
    fn exhausted_error_keeps_the_last_cause() {
        let err = RabbitMQError::RetriesExhausted {
            queue: "default".to_string(),
            attempts: 3,
            source: Box::new(RabbitMQError::ConnectionError("refused".to_string())),
        };

        let text = err.to_string();
        assert!(text.contains("`default`"));
        assert!(text.contains("3 attempts"));
        assert!(text.contains("refused"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
