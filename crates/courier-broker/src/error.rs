//! Broker error types.

use thiserror::Error;

/// Broker error type.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Redis connection or operation error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Protocol error (unexpected reply shapes)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The broker has been closed
    #[error("Broker is closed")]
    Closed,
}

impl BrokerError {
    /// True for transport/connection-class errors, which are eligible for
    /// the single reconnect-and-retry. Everything else is never retried.
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped()
                    || e.is_timeout()
            }
            _ => false,
        }
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_connection_class() {
        assert!(BrokerError::Closed.is_connection());
    }

    #[test]
    fn protocol_and_config_are_not_connection_class() {
        assert!(!BrokerError::Protocol("bad reply".to_string()).is_connection());
        assert!(!BrokerError::Config("bad url".to_string()).is_connection());
    }
}
