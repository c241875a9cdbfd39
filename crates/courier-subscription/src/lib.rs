//! Position-tracking subscriptions over the broker port.
//!
//! This crate provides:
//! - MessageHandler: the application callback for delivered messages
//! - Subscription: the consume loop with bounded handler retries and
//!   dead-lettering for poisoned messages
//! - PositionStore: durable read positions (`MemoryPositionStore`,
//!   `SqlitePositionStore`) so a restarted subscriber resumes where it
//!   left off instead of replaying the stream

mod config;
mod error;
mod handler;
mod position;
mod subscription;

#[cfg(test)]
mod tests;

pub use config::SubscriptionConfig;
pub use error::{SubscriptionError, SubscriptionResult};
pub use handler::{MessageHandler, RecordingHandler};
pub use position::{MemoryPositionStore, PositionHandle, PositionStore, SqlitePositionStore};
pub use subscription::{Subscription, SubscriptionState};
