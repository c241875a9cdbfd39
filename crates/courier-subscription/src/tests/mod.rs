//! Behavior tests for the subscription loop.
//!
//! - `harness.rs`  - shared fixtures: broker, recording handler, positions
//! - `delivery.rs` - ordering, live pickup, lifecycle
//! - `resume.rs`   - position flush cadence and restart resume
//! - `poison.rs`   - handler retries, dead-lettering, isolation
//! - `pipeline.rs` - outbox through broker to subscription, end to end

mod delivery;
mod poison;
