//! SQLite-backed outbox store.
//!
//! The outbox table lives in the application's own database so that staging
//! a message can share a transaction with the business write. Claims run
//! inside `BEGIN IMMEDIATE` transactions, which is what makes the lease
//! handoff safe across processes.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (see
//! [`courier_core::format_datetime`]), so `<=` in SQL compares chronologically.

use crate::entry::{ClaimOutcome, OutboxEntry, OutboxStatus};
use crate::error::{OutboxError, OutboxResult};
use crate::store::{OutboxStore, StatusCounts};
use chrono::{DateTime, Utc};
use courier_core::{format_datetime, parse_datetime, MessageId};
use rusqlite::{params, Connection, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const COLUMNS: &str = "message_id, stream_name, message_type, data, metadata, priority, \
     correlation_id, trace_id, status, retry_count, max_retries, created_at, \
     published_at, last_processed_at, last_error, locked_by, locked_until, \
     next_retry_at, sequence_number";

/// SQLite [`OutboxStore`].
pub struct SqliteOutboxStore {
    conn: Mutex<Connection>,
}

impl SqliteOutboxStore {
    /// Opens (or creates) the outbox database at the given path.
    pub fn open(path: impl AsRef<Path>) -> OutboxResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OutboxError::Config(format!("create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
        ",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!(path = %path.display(), "outbox database opened");
        Ok(store)
    }

    /// Creates an in-memory store, used by tests and by embedders that do
    /// not need the outbox to survive restarts.
    pub fn in_memory() -> OutboxResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> OutboxResult<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_entries (
                message_id TEXT PRIMARY KEY,
                stream_name TEXT NOT NULL,
                message_type TEXT NOT NULL,
                data TEXT NOT NULL,
                metadata TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                correlation_id TEXT,
                trace_id TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL,
                published_at TEXT,
                last_processed_at TEXT,
                last_error TEXT,
                locked_by TEXT,
                locked_until TEXT,
                next_retry_at TEXT,
                sequence_number INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_outbox_status
                ON outbox_entries(status);
            CREATE INDEX IF NOT EXISTS idx_outbox_ready
                ON outbox_entries(status, priority DESC, created_at);
            CREATE INDEX IF NOT EXISTS idx_outbox_stream
                ON outbox_entries(stream_name);

            CREATE TABLE IF NOT EXISTS outbox_sequences (
                stream_name TEXT PRIMARY KEY,
                last_sequence INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn find_where(
        &self,
        predicate: &str,
        limit: Option<usize>,
    ) -> OutboxResult<Vec<OutboxEntry>> {
        let now = format_datetime(&Utc::now());
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM outbox_entries
             WHERE {predicate}
             ORDER BY priority DESC, created_at ASC, rowid ASC
             LIMIT ?2"
        ))?;
        let entries = stmt
            .query_map(params![now, limit.map_or(-1, |n| n as i64)], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        message_id: MessageId::from(row.get::<_, String>(0)?),
        stream_name: row.get(1)?,
        message_type: row.get(2)?,
        data: json_column(row, 3)?,
        metadata: json_column(row, 4)?,
        priority: row.get(5)?,
        correlation_id: row.get(6)?,
        trace_id: row.get(7)?,
        status: OutboxStatus::parse(&row.get::<_, String>(8)?).unwrap_or_default(),
        retry_count: row.get(9)?,
        max_retries: row.get(10)?,
        created_at: parse_datetime(&row.get::<_, String>(11)?),
        published_at: row.get::<_, Option<String>>(12)?.map(|s| parse_datetime(&s)),
        last_processed_at: row.get::<_, Option<String>>(13)?.map(|s| parse_datetime(&s)),
        last_error: row.get(14)?,
        locked_by: row.get(15)?,
        locked_until: row.get::<_, Option<String>>(16)?.map(|s| parse_datetime(&s)),
        next_retry_at: row.get::<_, Option<String>>(17)?.map(|s| parse_datetime(&s)),
        sequence_number: row.get(18)?,
    })
}

fn get_entry(conn: &Connection, id: &str) -> OutboxResult<Option<OutboxEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {COLUMNS} FROM outbox_entries WHERE message_id = ?1"
    ))?;
    match stmt.query_row(params![id], row_to_entry) {
        Ok(entry) => Ok(Some(entry)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn persist_entry(conn: &Connection, entry: &OutboxEntry) -> OutboxResult<usize> {
    let mut stmt = conn.prepare_cached(
        "UPDATE outbox_entries
         SET stream_name = ?2, message_type = ?3, data = ?4, metadata = ?5,
             priority = ?6, correlation_id = ?7, trace_id = ?8, status = ?9,
             retry_count = ?10, max_retries = ?11, published_at = ?12,
             last_processed_at = ?13, last_error = ?14, locked_by = ?15,
             locked_until = ?16, next_retry_at = ?17, sequence_number = ?18
         WHERE message_id = ?1",
    )?;
    let changed = stmt.execute(params![
        entry.message_id.as_str(),
        entry.stream_name,
        entry.message_type,
        serde_json::to_string(&entry.data)?,
        serde_json::to_string(&entry.metadata)?,
        entry.priority,
        entry.correlation_id,
        entry.trace_id,
        entry.status.as_str(),
        entry.retry_count,
        entry.max_retries,
        entry.published_at.as_ref().map(format_datetime),
        entry.last_processed_at.as_ref().map(format_datetime),
        entry.last_error,
        entry.locked_by,
        entry.locked_until.as_ref().map(format_datetime),
        entry.next_retry_at.as_ref().map(format_datetime),
        entry.sequence_number,
    ])?;
    Ok(changed)
}

impl OutboxStore for SqliteOutboxStore {
    fn add(&self, mut entry: OutboxEntry) -> OutboxResult<OutboxEntry> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM outbox_entries WHERE message_id = ?1)",
            params![entry.message_id.as_str()],
            |row| row.get(0),
        )?;
        if exists {
            return Err(OutboxError::Duplicate(
                entry.message_id.as_str().to_string(),
            ));
        }

        let sequence: i64 = tx.query_row(
            "INSERT INTO outbox_sequences (stream_name, last_sequence) VALUES (?1, 1)
             ON CONFLICT(stream_name) DO UPDATE SET last_sequence = last_sequence + 1
             RETURNING last_sequence",
            params![entry.stream_name],
            |row| row.get(0),
        )?;
        entry.sequence_number = Some(sequence);

        tx.execute(
            &format!(
                "INSERT INTO outbox_entries ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
            ),
            params![
                entry.message_id.as_str(),
                entry.stream_name,
                entry.message_type,
                serde_json::to_string(&entry.data)?,
                serde_json::to_string(&entry.metadata)?,
                entry.priority,
                entry.correlation_id,
                entry.trace_id,
                entry.status.as_str(),
                entry.retry_count,
                entry.max_retries,
                format_datetime(&entry.created_at),
                entry.published_at.as_ref().map(format_datetime),
                entry.last_processed_at.as_ref().map(format_datetime),
                entry.last_error,
                entry.locked_by,
                entry.locked_until.as_ref().map(format_datetime),
                entry.next_retry_at.as_ref().map(format_datetime),
                entry.sequence_number,
            ],
        )?;
        tx.commit()?;
        Ok(entry)
    }

    fn get(&self, id: &MessageId) -> OutboxResult<Option<OutboxEntry>> {
        let conn = self.lock();
        get_entry(&conn, id.as_str())
    }

    fn update(&self, entry: &OutboxEntry) -> OutboxResult<()> {
        let conn = self.lock();
        let changed = persist_entry(&conn, entry)?;
        if changed == 0 {
            return Err(OutboxError::NotFound(
                entry.message_id.as_str().to_string(),
            ));
        }
        Ok(())
    }

    fn claim(
        &self,
        id: &MessageId,
        worker_id: &str,
        lease: Duration,
    ) -> OutboxResult<ClaimOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut entry = match get_entry(&tx, id.as_str())? {
            Some(entry) => entry,
            None => return Err(OutboxError::NotFound(id.as_str().to_string())),
        };
        let outcome = entry.start_processing(worker_id, lease);
        if outcome == ClaimOutcome::Success {
            persist_entry(&tx, &entry)?;
        }
        tx.commit()?;
        Ok(outcome)
    }

    fn find_ready(&self, limit: usize) -> OutboxResult<Vec<OutboxEntry>> {
        self.find_where(
            "status = 'PENDING'
               OR (status = 'FAILED' AND retry_count < max_retries
                   AND (next_retry_at IS NULL OR next_retry_at <= ?1))
               OR (status = 'PROCESSING'
                   AND (locked_until IS NULL OR locked_until <= ?1))",
            Some(limit),
        )
    }

    fn find_unprocessed(&self, limit: Option<usize>) -> OutboxResult<Vec<OutboxEntry>> {
        self.find_where("status = 'PENDING'", limit)
    }

    fn find_failed(&self, limit: Option<usize>) -> OutboxResult<Vec<OutboxEntry>> {
        self.find_where("status = 'FAILED'", limit)
    }

    fn find_stale_processing(&self, limit: Option<usize>) -> OutboxResult<Vec<OutboxEntry>> {
        self.find_where(
            "status = 'PROCESSING' AND (locked_until IS NULL OR locked_until <= ?1)",
            limit,
        )
    }

    fn find_retry_ready(&self, limit: Option<usize>) -> OutboxResult<Vec<OutboxEntry>> {
        self.find_where(
            "status = 'FAILED' AND retry_count < max_retries
               AND (next_retry_at IS NULL OR next_retry_at <= ?1)",
            limit,
        )
    }

    fn count_by_status(&self) -> OutboxResult<StatusCounts> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("SELECT status, COUNT(*) FROM outbox_entries GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match OutboxStatus::parse(&status) {
                Some(OutboxStatus::Pending) => counts.pending = count,
                Some(OutboxStatus::Processing) => counts.processing = count,
                Some(OutboxStatus::Published) => counts.published = count,
                Some(OutboxStatus::Failed) => counts.failed = count,
                Some(OutboxStatus::Abandoned) => counts.abandoned = count,
                None => debug!(status, count, "ignoring rows with unknown status"),
            }
        }
        Ok(counts)
    }

    fn cleanup_published(&self, older_than: Duration) -> OutboxResult<usize> {
        // An age past the calendar range clamps to "keep everything"
        // instead of overflowing the subtraction.
        let delta = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(delta)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM outbox_entries
             WHERE status = 'PUBLISHED'
               AND published_at IS NOT NULL
               AND published_at <= ?1",
            params![format_datetime(&cutoff)],
        )?;
        Ok(removed)
    }
}
