//! Durable read positions.
//!
//! A subscription flushes its position here every
//! `position_update_interval` messages and on shutdown. Anything between
//! the last flush and a crash is re-delivered on the next run, which is
//! the at-least-once trade: bounded re-delivery instead of a write per
//! message.

use crate::error::{SubscriptionError, SubscriptionResult};
use chrono::Utc;
use courier_core::format_datetime;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Where subscriptions persist their last handled identifier.
pub trait PositionStore: Send + Sync {
    fn load(&self, subscriber_id: &str) -> SubscriptionResult<Option<String>>;
    fn save(&self, subscriber_id: &str, stream: &str, position: &str)
        -> SubscriptionResult<()>;
}

pub type PositionHandle = Arc<dyn PositionStore>;

/// In-memory [`PositionStore`]; positions vanish with the process.
#[derive(Default)]
pub struct MemoryPositionStore {
    positions: Mutex<HashMap<String, (String, String)>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionStore for MemoryPositionStore {
    fn load(&self, subscriber_id: &str) -> SubscriptionResult<Option<String>> {
        let positions = self
            .positions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Ok(positions
            .get(subscriber_id)
            .map(|(_, position)| position.clone()))
    }

    fn save(
        &self,
        subscriber_id: &str,
        stream: &str,
        position: &str,
    ) -> SubscriptionResult<()> {
        let mut positions = self
            .positions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        positions.insert(
            subscriber_id.to_string(),
            (stream.to_string(), position.to_string()),
        );
        Ok(())
    }
}

/// SQLite-backed [`PositionStore`].
pub struct SqlitePositionStore {
    conn: Mutex<Connection>,
}

impl SqlitePositionStore {
    pub fn open(path: impl AsRef<Path>) -> SubscriptionResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SubscriptionError::Config(format!("create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
        ",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> SubscriptionResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> SubscriptionResult<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS subscriber_positions (
                subscriber_id TEXT PRIMARY KEY,
                stream_name TEXT NOT NULL,
                position TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        ",
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PositionStore for SqlitePositionStore {
    fn load(&self, subscriber_id: &str) -> SubscriptionResult<Option<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT position FROM subscriber_positions WHERE subscriber_id = ?1",
        )?;
        match stmt.query_row(params![subscriber_id], |row| row.get(0)) {
            Ok(position) => Ok(Some(position)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(
        &self,
        subscriber_id: &str,
        stream: &str,
        position: &str,
    ) -> SubscriptionResult<()> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO subscriber_positions (subscriber_id, stream_name, position, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(subscriber_id) DO UPDATE
             SET stream_name = excluded.stream_name,
                 position = excluded.position,
                 updated_at = excluded.updated_at",
        )?;
        stmt.execute(params![
            subscriber_id,
            stream,
            position,
            format_datetime(&Utc::now()),
        ])?;
        debug!(subscriber_id, stream, position, "position flushed");
        Ok(())
    }
}
