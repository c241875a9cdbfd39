//! Subscription configuration.

use crate::error::{SubscriptionError, SubscriptionResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_messages_per_tick() -> usize {
    20
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_seconds() -> u64 {
    5
}

fn default_position_update_interval() -> usize {
    10
}

fn default_blocking_timeout_ms() -> u64 {
    2_000
}

fn default_dead_letter_enabled() -> bool {
    true
}

/// Configuration for one subscription loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Messages pulled per batch.
    #[serde(default = "default_messages_per_tick")]
    pub messages_per_tick: usize,

    /// Sleep between polls when the broker cannot block.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Handler retries per message before it is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between handler retries.
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,

    /// Flush the read position every N handled messages. Messages handled
    /// since the last flush are re-delivered after a crash.
    #[serde(default = "default_position_update_interval")]
    pub position_update_interval: usize,

    /// How long a blocking read waits before re-checking the stop flag.
    #[serde(default = "default_blocking_timeout_ms")]
    pub blocking_timeout_ms: u64,

    /// Route messages that exhaust their handler retries to dead-letter
    /// storage. When off they are logged and skipped.
    #[serde(default = "default_dead_letter_enabled")]
    pub dead_letter_enabled: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            messages_per_tick: default_messages_per_tick(),
            tick_interval_ms: default_tick_interval_ms(),
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
            position_update_interval: default_position_update_interval(),
            blocking_timeout_ms: default_blocking_timeout_ms(),
            dead_letter_enabled: default_dead_letter_enabled(),
        }
    }
}

impl SubscriptionConfig {
    /// Defaults overridden from `COURIER_SUBSCRIPTION_*` environment
    /// variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("COURIER_SUBSCRIPTION_MESSAGES_PER_TICK") {
            config.messages_per_tick = v;
        }
        if let Some(v) = env_parse("COURIER_SUBSCRIPTION_TICK_INTERVAL_MS") {
            config.tick_interval_ms = v;
        }
        if let Some(v) = env_parse("COURIER_SUBSCRIPTION_MAX_RETRIES") {
            config.max_retries = v;
        }
        if let Some(v) = env_parse("COURIER_SUBSCRIPTION_RETRY_DELAY_SECONDS") {
            config.retry_delay_seconds = v;
        }
        if let Some(v) = env_parse("COURIER_SUBSCRIPTION_POSITION_UPDATE_INTERVAL") {
            config.position_update_interval = v;
        }
        if let Some(v) = env_parse("COURIER_SUBSCRIPTION_BLOCKING_TIMEOUT_MS") {
            config.blocking_timeout_ms = v;
        }
        if let Some(v) = env_parse("COURIER_SUBSCRIPTION_DEAD_LETTER_ENABLED") {
            config.dead_letter_enabled = v;
        }

        config
    }

    /// Validate numeric bounds. Called at subscription construction;
    /// fails fast.
    pub fn validate(&self) -> SubscriptionResult<()> {
        if self.messages_per_tick == 0 {
            return Err(SubscriptionError::Config(
                "messages_per_tick must be greater than zero".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(SubscriptionError::Config(
                "tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.position_update_interval == 0 {
            return Err(SubscriptionError::Config(
                "position_update_interval must be greater than zero".to_string(),
            ));
        }
        if self.blocking_timeout_ms == 0 {
            return Err(SubscriptionError::Config(
                "blocking_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SubscriptionConfig::default();
        assert_eq!(config.messages_per_tick, 20);
        assert_eq!(config.tick_interval(), Duration::from_millis(500));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.position_update_interval, 10);
        assert_eq!(config.blocking_timeout(), Duration::from_secs(2));
        assert!(config.dead_letter_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_flush_interval_fails_validation() {
        let config = SubscriptionConfig {
            position_update_interval: 0,
            ..SubscriptionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SubscriptionError::Config(_))
        ));
    }

    #[test]
    fn serde_fills_missing_fields_with_defaults() {
        let config: SubscriptionConfig =
            serde_json::from_str("{\"max_retries\": 1}").unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.messages_per_tick, 20);
        assert!(config.dead_letter_enabled);
    }
}
