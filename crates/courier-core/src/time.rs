//! Datetime string helpers for durable stores.
//!
//! Timestamps are persisted as fixed-width RFC 3339 strings (microsecond
//! precision, `Z` suffix) so that lexicographic comparison in SQL matches
//! chronological order.

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp for storage.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, falling back to now on corrupt input.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
