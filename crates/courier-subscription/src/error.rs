//! Subscription error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("broker error: {0}")]
    Broker(#[from] courier_broker::BrokerError),

    #[error("position storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid subscription state: {0}")]
    State(String),
}

pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_errors_convert() {
        let err: SubscriptionError = courier_broker::BrokerError::Closed.into();
        assert!(matches!(err, SubscriptionError::Broker(_)));
        assert_eq!(err.to_string(), "broker error: Broker is closed");
    }

    #[test]
    fn state_errors_carry_the_reason() {
        let err = SubscriptionError::State("already running".to_string());
        assert_eq!(err.to_string(), "invalid subscription state: already running");
    }
}
