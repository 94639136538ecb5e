//! Error types for broker operations and client calls.

use std::time::Duration;

use thiserror::Error;

/// A failure reported by the broker transport.
///
/// Each variant names the operation that failed and carries the broker's
/// description of the problem. All of these are treated as transient by the
/// client's maintenance loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("failed to open channel: {0}")]
    Channel(String),

    #[error("failed to enable publisher confirms: {0}")]
    ConfirmSelect(String),

    #[error("failed to declare queue `{queue}`: {reason}")]
    Declare { queue: String, reason: String },

    #[error("failed to publish: {0}")]
    Publish(String),

    #[error("failed to set qos: {0}")]
    Qos(String),

    #[error("failed to start consumer: {0}")]
    Consume(String),

    #[error("failed to cancel consumer: {0}")]
    Cancel(String),

    #[error("failed to acknowledge delivery: {0}")]
    Ack(String),

    #[error("failed to close: {0}")]
    Close(String),

    #[error("closed by broker: {0}")]
    Closed(String),
}

/// Errors returned to callers of [`crate::Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// No live connection and channel exist right now. Retry later.
    #[error("not connected to a server")]
    NotConnected,

    /// The client was closed and will never reconnect.
    #[error("already closed: not connected to the server")]
    AlreadyClosed,

    /// Shutdown was signaled while the operation was waiting.
    #[error("client is shutting down")]
    ShuttingDown,

    #[error("no publisher confirmation within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ClientError {
    /// Whether the caller can expect a later attempt on the same client to work.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::NotConnected | ClientError::Timeout(_) | ClientError::Broker(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ClientError::NotConnected.to_string(),
            "not connected to a server"
        );
        let declare = BrokerError::Declare {
            queue: "email_queue".to_string(),
            reason: "PRECONDITION_FAILED".to_string(),
        };
        assert_eq!(
            ClientError::from(declare).to_string(),
            "failed to declare queue `email_queue`: PRECONDITION_FAILED"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(ClientError::NotConnected.is_transient());
        assert!(ClientError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ClientError::AlreadyClosed.is_transient());
        assert!(!ClientError::ShuttingDown.is_transient());
    }
}
