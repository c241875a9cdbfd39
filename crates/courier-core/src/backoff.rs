//! Exponential backoff shared by the outbox retry path and broker
//! redelivery scheduling.

use std::time::Duration;

// Shifts past this would overflow u64 millisecond math long before the
// delay is meaningful anyway.
const MAX_EXPONENT: u32 = 32;

/// Delay before the next attempt: `base * 2^exponent`, saturating.
pub fn retry_delay(base: Duration, exponent: u32) -> Duration {
    let multiplier = 1u64
        .checked_shl(exponent.min(MAX_EXPONENT))
        .unwrap_or(u64::MAX);
    let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
    Duration::from_millis(base_ms.saturating_mul(multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_exponent() {
        let base = Duration::from_secs(30);
        assert_eq!(retry_delay(base, 0), Duration::from_secs(30));
        assert_eq!(retry_delay(base, 1), Duration::from_secs(60));
        assert_eq!(retry_delay(base, 2), Duration::from_secs(120));
        assert_eq!(retry_delay(base, 3), Duration::from_secs(240));
    }

    #[test]
    fn huge_exponents_saturate_instead_of_panicking() {
        let delay = retry_delay(Duration::from_secs(30), u32::MAX);
        assert!(delay >= retry_delay(Duration::from_secs(30), MAX_EXPONENT));
    }

    #[test]
    fn zero_base_stays_zero() {
        assert_eq!(retry_delay(Duration::ZERO, 10), Duration::ZERO);
    }
}
