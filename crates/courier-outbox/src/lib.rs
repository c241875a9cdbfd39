//! Transactional outbox for reliable at-least-once publishing.
//!
//! This crate provides:
//! - OutboxEntry: the staged-message state machine (PENDING through
//!   PUBLISHED/FAILED/ABANDONED) with lease-based claims
//! - OutboxStore: the durable staging area (`MemoryOutboxStore`,
//!   `SqliteOutboxStore`) that assigns per-stream sequence numbers
//! - OutboxProcessor: the publish loop with priority-lane routing
//!
//! Staging an entry in the same transaction as the business write closes
//! the dual-write gap: either both commit or neither does, and the
//! processor publishes whatever committed.

mod config;
mod entry;
mod error;
mod memory_store;
mod processor;
mod sqlite_store;
mod store;

pub use config::{OutboxConfig, PriorityLaneConfig};
pub use entry::{ClaimOutcome, OutboxEntry, OutboxStatus, DEFAULT_MAX_RETRIES};
pub use error::{OutboxError, OutboxResult};
pub use memory_store::MemoryOutboxStore;
pub use processor::OutboxProcessor;
pub use sqlite_store::SqliteOutboxStore;
pub use store::{OutboxStore, StatusCounts, StoreHandle};
