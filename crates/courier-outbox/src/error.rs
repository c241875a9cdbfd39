//! Outbox error types.

use thiserror::Error;

/// Errors raised by the outbox stores and processor.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// SQLite storage error.
    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Payload or metadata (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker port error surfaced while publishing.
    #[error("broker error: {0}")]
    Broker(#[from] courier_broker::BrokerError),

    /// No entry with the given identifier.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// An entry with the given identifier is already staged.
    #[error("entry already staged: {0}")]
    Duplicate(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;
