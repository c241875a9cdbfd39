//! Outbox processor configuration.

use crate::error::{OutboxError, OutboxResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_enable_outbox() -> bool {
    true
}

fn default_messages_per_tick() -> usize {
    50
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_lock_duration_minutes() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_seconds() -> u64 {
    30
}

fn default_backfill_suffix() -> String {
    "backfill".to_string()
}

/// Routes low-priority entries onto a separate backfill stream so live
/// traffic is never queued behind a bulk import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityLaneConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Entries with `priority >= threshold` stay on the primary stream;
    /// the comparison is inclusive at the threshold.
    #[serde(default)]
    pub threshold: i32,

    /// Low-priority entries for `<stream>` publish to `<stream>:<suffix>`.
    #[serde(default = "default_backfill_suffix")]
    pub backfill_suffix: String,
}

impl Default for PriorityLaneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0,
            backfill_suffix: default_backfill_suffix(),
        }
    }
}

/// Configuration for the outbox processor loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Master switch; `run()` exits immediately when disabled.
    #[serde(default = "default_enable_outbox")]
    pub enable_outbox: bool,

    /// Ready entries fetched per tick.
    #[serde(default = "default_messages_per_tick")]
    pub messages_per_tick: usize,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Lease length for claimed entries. Workers that die mid-publish
    /// release their claim when this lapses.
    #[serde(default = "default_lock_duration_minutes")]
    pub lock_duration_minutes: u64,

    /// Publish failures past this ceiling abandon the entry.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for failed-entry backoff (`base * 2^retry_count`).
    #[serde(default = "default_base_delay_seconds")]
    pub base_delay_seconds: u64,

    #[serde(default)]
    pub priority_lanes: PriorityLaneConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enable_outbox: default_enable_outbox(),
            messages_per_tick: default_messages_per_tick(),
            tick_interval_ms: default_tick_interval_ms(),
            lock_duration_minutes: default_lock_duration_minutes(),
            max_retries: default_max_retries(),
            base_delay_seconds: default_base_delay_seconds(),
            priority_lanes: PriorityLaneConfig::default(),
        }
    }
}

impl OutboxConfig {
    /// Defaults overridden from `COURIER_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("COURIER_OUTBOX_ENABLED") {
            config.enable_outbox = v;
        }
        if let Some(v) = env_parse("COURIER_MESSAGES_PER_TICK") {
            config.messages_per_tick = v;
        }
        if let Some(v) = env_parse("COURIER_TICK_INTERVAL_MS") {
            config.tick_interval_ms = v;
        }
        if let Some(v) = env_parse("COURIER_LOCK_DURATION_MINUTES") {
            config.lock_duration_minutes = v;
        }
        if let Some(v) = env_parse("COURIER_MAX_RETRIES") {
            config.max_retries = v;
        }
        if let Some(v) = env_parse("COURIER_BASE_DELAY_SECONDS") {
            config.base_delay_seconds = v;
        }
        if let Some(v) = env_parse("COURIER_PRIORITY_LANES_ENABLED") {
            config.priority_lanes.enabled = v;
        }
        if let Some(v) = env_parse("COURIER_PRIORITY_THRESHOLD") {
            config.priority_lanes.threshold = v;
        }
        if let Ok(v) = std::env::var("COURIER_BACKFILL_SUFFIX") {
            if !v.is_empty() {
                config.priority_lanes.backfill_suffix = v;
            }
        }

        config
    }

    /// Validate numeric bounds. Called at processor construction; fails fast.
    pub fn validate(&self) -> OutboxResult<()> {
        if self.messages_per_tick == 0 {
            return Err(OutboxError::Config(
                "messages_per_tick must be greater than zero".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(OutboxError::Config(
                "tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.lock_duration_minutes == 0 {
            return Err(OutboxError::Config(
                "lock_duration_minutes must be greater than zero".to_string(),
            ));
        }
        if self.priority_lanes.enabled && self.priority_lanes.backfill_suffix.is_empty() {
            return Err(OutboxError::Config(
                "backfill_suffix must not be empty when priority lanes are enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_minutes * 60)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_seconds)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
