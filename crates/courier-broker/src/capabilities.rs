//! Broker capability flags.
//!
//! Each broker declares what it can do through a [`Capabilities`] value fixed
//! at construction. Callers branch on capability, never on the concrete
//! broker kind: an absent capability degrades the operation gracefully
//! (ack/nack answer `false`, blocking reads poll) instead of erroring.

use std::fmt;
use std::ops::BitOr;

/// Bitset of broker capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    /// No capabilities at all.
    pub const NONE: Capabilities = Capabilities(0);

    /// Each message goes to exactly one member of a consumer group,
    /// with per-group pending-entry tracking.
    pub const CONSUMER_GROUPS: Capabilities = Capabilities(1 << 0);

    /// Explicit acknowledgment and negative acknowledgment of deliveries.
    pub const ACK_NACK: Capabilities = Capabilities(1 << 1);

    /// Reads can block waiting for new entries instead of polling.
    pub const BLOCKING_READ: Capabilities = Capabilities(1 << 2);

    /// Messages survive process restarts.
    pub const PERSISTENCE: Capabilities = Capabilities(1 << 3);

    /// Every capability.
    pub const fn all() -> Self {
        Capabilities(
            Self::CONSUMER_GROUPS.0 | Self::ACK_NACK.0 | Self::BLOCKING_READ.0 | Self::PERSISTENCE.0,
        )
    }

    /// True if every capability in `other` is present in `self`.
    pub const fn supports(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    /// Names of the capabilities present, for diagnostics.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.supports(Self::CONSUMER_GROUPS) {
            names.push("consumer_groups");
        }
        if self.supports(Self::ACK_NACK) {
            names.push("ack_nack");
        }
        if self.supports(Self::BLOCKING_READ) {
            names.push("blocking_read");
        }
        if self.supports(Self::PERSISTENCE) {
            names.push("persistence");
        }
        names
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join("|"))
    }
}
