//! Shared building blocks for the courier messaging workspace.
//!
//! This crate carries the pieces every other courier crate needs:
//! the wire payload envelope, message identifiers, the exponential
//! backoff helper, RFC 3339 datetime helpers for durable stores, and
//! the tracing subscriber bootstrap.

pub mod backoff;
pub mod ids;
pub mod logging;
pub mod payload;
pub mod time;

pub use backoff::retry_delay;
pub use ids::MessageId;
pub use payload::{MessageMetadata, MessagePayload};
pub use time::{format_datetime, parse_datetime};
