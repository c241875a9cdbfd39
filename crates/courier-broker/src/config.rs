//! Broker configuration.

use crate::error::{BrokerError, BrokerResult};
use crate::types::DeliveryStart;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_claim_timeout_ms() -> u64 {
    30_000
}

fn default_consumer_name() -> String {
    format!("courier-{}", uuid::Uuid::new_v4())
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_dead_letter_suffix() -> String {
    "dead".to_string()
}

/// Configuration shared by every broker kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Nacks past this ceiling move the message to dead-letter storage.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for nack redelivery scheduling (`base * 2^retry_count`).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// In-flight deliveries idle past this are reclaimable by other
    /// consumers (crash recovery on the consumer side).
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,

    /// Where a newly created (stream, group) pair starts delivering from.
    #[serde(default)]
    pub group_start: DeliveryStart,

    /// Consumer identity used when an operation does not name one.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            claim_timeout_ms: default_claim_timeout_ms(),
            group_start: DeliveryStart::default(),
            consumer_name: default_consumer_name(),
        }
    }
}

impl BrokerConfig {
    /// Defaults overridden from `COURIER_BROKER_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("COURIER_BROKER_MAX_RETRIES") {
            config.max_retries = v;
        }
        if let Some(v) = env_parse("COURIER_BROKER_BASE_DELAY_MS") {
            config.base_delay_ms = v;
        }
        if let Some(v) = env_parse("COURIER_BROKER_CLAIM_TIMEOUT_MS") {
            config.claim_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("COURIER_BROKER_GROUP_START") {
            match v.to_lowercase().as_str() {
                "beginning" => config.group_start = DeliveryStart::Beginning,
                "tail" => config.group_start = DeliveryStart::Tail,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("COURIER_BROKER_CONSUMER_NAME") {
            if !v.is_empty() {
                config.consumer_name = v;
            }
        }

        config
    }

    /// Validate numeric bounds. Called at broker construction; fails fast.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.consumer_name.is_empty() {
            return Err(BrokerError::Config(
                "consumer_name must not be empty".to_string(),
            ));
        }
        if self.claim_timeout_ms == 0 {
            return Err(BrokerError::Config(
                "claim_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }
}

/// Configuration for the Redis Streams broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisBrokerConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Dead letters for `<stream>` live in the `<stream>:<suffix>` stream.
    #[serde(default = "default_dead_letter_suffix")]
    pub dead_letter_suffix: String,

    #[serde(default)]
    pub broker: BrokerConfig,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            dead_letter_suffix: default_dead_letter_suffix(),
            broker: BrokerConfig::default(),
        }
    }
}

impl RedisBrokerConfig {
    /// Defaults overridden from `REDIS_URL` and `COURIER_BROKER_*`.
    pub fn from_env() -> Self {
        let mut config = Self {
            broker: BrokerConfig::from_env(),
            ..Self::default()
        };

        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                config.url = url;
            }
        }
        if let Ok(suffix) = std::env::var("COURIER_BROKER_DEAD_LETTER_SUFFIX") {
            if !suffix.is_empty() {
                config.dead_letter_suffix = suffix;
            }
        }

        config
    }

    pub fn validate(&self) -> BrokerResult<()> {
        if self.url.is_empty() {
            return Err(BrokerError::Config("url must not be empty".to_string()));
        }
        if self.dead_letter_suffix.is_empty() {
            return Err(BrokerError::Config(
                "dead_letter_suffix must not be empty".to_string(),
            ));
        }
        self.broker.validate()
    }

    /// Stream holding dead letters for `stream`.
    pub fn dead_letter_stream(&self, stream: &str) -> String {
        format!("{}:{}", stream, self.dead_letter_suffix)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
