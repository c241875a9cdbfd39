//! Redis Streams broker.
//!
//! Messages are XADDed with a single `payload` field holding the JSON
//! envelope. Group delivery uses XREADGROUP/XACK; nack backoff is kept in a
//! sidecar hash per (stream, group) holding `id -> due-unix-ms`, claimed
//! back with XCLAIM once due. Crashed consumers are covered by XAUTOCLAIM
//! with the configured claim timeout as the idle bound.
//!
//! All commands go through one reconnect-once query path: a connection
//! error replaces the multiplexed connection, re-asserts known groups and
//! retries the command a single time.

use crate::capabilities::Capabilities;
use crate::config::RedisBrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::types::{DeadLetter, Delivery, DeliveryStart, GroupInfo, HealthStats, StreamInfo};
use chrono::Utc;
use courier_core::{format_datetime, parse_datetime, retry_delay, MessagePayload};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Redis Streams broker. Carries the full capability set.
pub struct RedisStreamBroker {
    client: Client,
    conn: RwLock<MultiplexedConnection>,
    config: RedisBrokerConfig,
    /// (stream, group) pairs already asserted with XGROUP CREATE.
    known_groups: Mutex<HashSet<(String, String)>>,
    closed: AtomicBool,
}

impl RedisStreamBroker {
    /// Connect to Redis and validate the configuration.
    pub async fn connect(config: RedisBrokerConfig) -> BrokerResult<Self> {
        config.validate()?;
        let client = Client::open(config.url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("connected to Redis");
        Ok(Self {
            client,
            conn: RwLock::new(conn),
            config,
            known_groups: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn check_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn retries_key(&self, stream: &str, group: &str) -> String {
        format!("{}:retries:{}", stream, group)
    }

    fn redeliver_key(&self, stream: &str, group: &str) -> String {
        format!("{}:redeliver:{}", stream, group)
    }

    /// Run a command, reconnecting and retrying once on connection errors.
    async fn query(&self, cmd: &redis::Cmd) -> BrokerResult<redis::Value> {
        let mut conn = self.conn.read().await.clone();
        match cmd.query_async::<redis::Value>(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = BrokerError::from(e);
                if !err.is_connection() || self.closed.load(Ordering::SeqCst) {
                    return Err(err);
                }
                warn!(error = %err, "Redis connection error, reconnecting");
                // A failed reconnect surfaces the error the caller actually
                // hit, not its own.
                if let Err(reconnect_err) = self.reconnect().await {
                    warn!(error = %reconnect_err, "reconnect failed");
                    return Err(err);
                }
                let mut conn = self.conn.read().await.clone();
                Ok(cmd.query_async::<redis::Value>(&mut conn).await?)
            }
        }
    }

    /// Replace the multiplexed connection and re-assert known groups.
    async fn reconnect(&self) -> BrokerResult<()> {
        {
            let mut conn = self.conn.write().await;
            *conn = self.client.get_multiplexed_async_connection().await?;
        }
        let groups: Vec<(String, String)> = {
            let known = self.known_groups.lock().await;
            known.iter().cloned().collect()
        };
        for (stream, group) in groups {
            self.create_group(&stream, &group).await?;
        }
        info!("reconnected to Redis");
        Ok(())
    }

    /// XGROUP CREATE with MKSTREAM; a BUSYGROUP answer means the group
    /// already exists, which is fine.
    async fn create_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
        let start = match self.config.broker.group_start {
            DeliveryStart::Tail => "$",
            DeliveryStart::Beginning => "0",
        };
        let mut conn = self.conn.read().await.clone();
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => {
                info!(stream = %stream, group = %group, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %stream, group = %group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
        {
            let known = self.known_groups.lock().await;
            if known.contains(&(stream.to_string(), group.to_string())) {
                return Ok(());
            }
        }
        self.create_group(stream, group).await?;
        self.known_groups
            .lock()
            .await
            .insert((stream.to_string(), group.to_string()));
        Ok(())
    }

    /// Append a message and return the Redis stream identifier.
    pub async fn publish(&self, stream: &str, payload: &MessagePayload) -> BrokerResult<String> {
        self.check_open()?;
        let json = serde_json::to_string(payload)?;
        let raw = self
            .query(
                redis::cmd("XADD")
                    .arg(stream)
                    .arg("*")
                    .arg("payload")
                    .arg(&json),
            )
            .await?;
        let id = as_string(&raw, "XADD reply")?;
        debug!(stream = %stream, message_id = %id, "published message");
        Ok(id)
    }

    /// Read up to `count` messages for `group` as the configured consumer.
    pub async fn read(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        let consumer = self.config.broker.consumer_name.clone();
        self.read_as(stream, group, &consumer, count).await
    }

    /// Read up to `count` messages for `group` as a named consumer.
    ///
    /// Due nack redeliveries are claimed back first, then entries idle past
    /// the claim timeout, then fresh entries.
    pub async fn read_as(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        self.check_open()?;
        if count == 0 {
            return Ok(Vec::new());
        }
        self.ensure_group(stream, group).await?;

        let mut batch = self
            .claim_due_redeliveries(stream, group, consumer, count)
            .await?;
        if batch.len() < count {
            let reclaimed = self
                .reclaim_idle(stream, group, consumer, count - batch.len())
                .await?;
            batch.extend(reclaimed);
        }
        if batch.len() < count {
            let raw = self
                .query(
                    redis::cmd("XREADGROUP")
                        .arg("GROUP")
                        .arg(group)
                        .arg(consumer)
                        .arg("COUNT")
                        .arg((count - batch.len()) as i64)
                        .arg("STREAMS")
                        .arg(stream)
                        .arg(">"),
                )
                .await?;
            batch.extend(parse_read_response(raw)?);
        }
        Ok(batch)
    }

    /// XCLAIM entries whose backoff schedule has come due.
    async fn claim_due_redeliveries(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        limit: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        let key = self.redeliver_key(stream, group);
        let raw = self.query(redis::cmd("HGETALL").arg(&key)).await?;
        let scheduled = field_map(&raw)?;
        if scheduled.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now().timestamp_millis();
        let mut due: Vec<(i64, String)> = scheduled
            .into_iter()
            .filter_map(|(id, due_ms)| due_ms.parse::<i64>().ok().map(|ms| (ms, id)))
            .filter(|(ms, _)| *ms <= now)
            .collect();
        due.sort();
        due.truncate(limit);

        let mut deliveries = Vec::new();
        for (_, id) in due {
            let raw = self
                .query(
                    redis::cmd("XCLAIM")
                        .arg(stream)
                        .arg(group)
                        .arg(consumer)
                        .arg(0)
                        .arg(&id),
                )
                .await?;
            for entry in as_array(raw, "XCLAIM reply")? {
                if matches!(entry, redis::Value::Nil) {
                    continue;
                }
                deliveries.push(parse_entry(&entry)?);
            }
            self.query(redis::cmd("HDEL").arg(&key).arg(&id)).await?;
        }
        Ok(deliveries)
    }

    /// XAUTOCLAIM entries idle past the claim timeout, skipping ids whose
    /// backoff schedule has not yet come due.
    async fn reclaim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        limit: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        let scheduled = {
            let raw = self
                .query(redis::cmd("HGETALL").arg(self.redeliver_key(stream, group)))
                .await?;
            field_map(&raw)?
        };
        let raw = self
            .query(
                redis::cmd("XAUTOCLAIM")
                    .arg(stream)
                    .arg(group)
                    .arg(consumer)
                    .arg(self.config.broker.claim_timeout_ms as i64)
                    .arg("0-0")
                    .arg("COUNT")
                    .arg(limit as i64),
            )
            .await?;
        let parts = as_array(raw, "XAUTOCLAIM reply")?;
        if parts.len() < 2 {
            return Ok(Vec::new());
        }
        let mut deliveries = Vec::new();
        for entry in as_array(parts[1].clone(), "XAUTOCLAIM entries")? {
            // Trimmed entries come back as nil.
            if matches!(entry, redis::Value::Nil) {
                continue;
            }
            let delivery = parse_entry(&entry)?;
            if scheduled.contains_key(&delivery.id) {
                continue;
            }
            deliveries.push(delivery);
        }
        Ok(deliveries)
    }

    /// Blocking read: serves the consumer's own pending entries first,
    /// otherwise blocks up to `timeout` for fresh entries.
    pub async fn read_blocking(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        self.check_open()?;
        self.ensure_group(stream, group).await?;

        // A consumer that crashed mid-batch resumes its own claims.
        let raw = self
            .query(
                redis::cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(group)
                    .arg(consumer)
                    .arg("COUNT")
                    .arg(count as i64)
                    .arg("STREAMS")
                    .arg(stream)
                    .arg("0"),
            )
            .await?;
        let pending = parse_read_response(raw)?;
        if !pending.is_empty() {
            return Ok(pending);
        }

        let raw = self
            .query(
                redis::cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(group)
                    .arg(consumer)
                    .arg("COUNT")
                    .arg(count as i64)
                    .arg("BLOCK")
                    .arg(timeout.as_millis() as i64)
                    .arg("STREAMS")
                    .arg(stream)
                    .arg(">"),
            )
            .await?;
        parse_read_response(raw)
    }

    /// XACK plus sidecar cleanup. Answers false when the id was not
    /// pending for `group`.
    pub async fn ack(&self, stream: &str, id: &str, group: &str) -> BrokerResult<bool> {
        self.check_open()?;
        let raw = self
            .query(redis::cmd("XACK").arg(stream).arg(group).arg(id))
            .await?;
        let removed = as_int(&raw, "XACK reply")? == 1;
        if removed {
            self.query(redis::cmd("HDEL").arg(self.retries_key(stream, group)).arg(id))
                .await?;
            self.query(redis::cmd("HDEL").arg(self.redeliver_key(stream, group)).arg(id))
                .await?;
            debug!(stream = %stream, message_id = %id, group = %group, "acknowledged");
        }
        Ok(removed)
    }

    /// Negative acknowledgment. Increments the retry counter and either
    /// schedules redelivery after `base_delay * 2^count` or, once the
    /// counter is past `max_retries`, moves the message to the dead-letter
    /// stream.
    pub async fn nack(&self, stream: &str, id: &str, group: &str) -> BrokerResult<bool> {
        self.check_open()?;
        // Only currently-pending ids can be nacked.
        let raw = self
            .query(
                redis::cmd("XPENDING")
                    .arg(stream)
                    .arg(group)
                    .arg(id)
                    .arg(id)
                    .arg(1),
            )
            .await?;
        if as_array(raw, "XPENDING reply")?.is_empty() {
            return Ok(false);
        }

        let raw = self
            .query(
                redis::cmd("HINCRBY")
                    .arg(self.retries_key(stream, group))
                    .arg(id)
                    .arg(1),
            )
            .await?;
        let count = as_int(&raw, "HINCRBY reply")? as u32;

        if count > self.config.broker.max_retries {
            self.dead_letter_pending(stream, group, id, count).await?;
        } else {
            let delay = retry_delay(self.config.broker.base_delay(), count);
            let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            self.query(
                redis::cmd("HSET")
                    .arg(self.redeliver_key(stream, group))
                    .arg(id)
                    .arg(due),
            )
            .await?;
            debug!(
                stream = %stream,
                message_id = %id,
                group = %group,
                nacks = count,
                delay_ms = delay.as_millis() as u64,
                "redelivery scheduled"
            );
        }
        Ok(true)
    }

    /// Move a pending entry to the dead-letter stream and drop it from the
    /// group's pending list and sidecar hashes.
    async fn dead_letter_pending(
        &self,
        stream: &str,
        group: &str,
        id: &str,
        nacks: u32,
    ) -> BrokerResult<()> {
        let raw = self
            .query(redis::cmd("XRANGE").arg(stream).arg(id).arg(id))
            .await?;
        let entries = as_array(raw, "XRANGE reply")?;
        match entries.first() {
            Some(entry) => {
                let delivery = parse_entry(entry)?;
                let reason = format!("retry budget exhausted after {} nacks", nacks);
                self.dead_letter(stream, &delivery.payload, id, &reason)
                    .await?;
            }
            None => {
                warn!(
                    stream = %stream,
                    message_id = %id,
                    "entry trimmed from stream, dead-lettered without payload"
                );
            }
        }
        self.query(redis::cmd("XACK").arg(stream).arg(group).arg(id))
            .await?;
        self.query(redis::cmd("HDEL").arg(self.retries_key(stream, group)).arg(id))
            .await?;
        self.query(redis::cmd("HDEL").arg(self.redeliver_key(stream, group)).arg(id))
            .await?;
        Ok(())
    }

    /// Positional read: entries strictly after `after`, oldest first.
    pub async fn read_from(
        &self,
        stream: &str,
        after: Option<&str>,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        self.check_open()?;
        let start = match after {
            Some(id) => format!("({}", id),
            None => "-".to_string(),
        };
        let result = self
            .query(
                redis::cmd("XRANGE")
                    .arg(stream)
                    .arg(&start)
                    .arg("+")
                    .arg("COUNT")
                    .arg(count as i64),
            )
            .await;
        let raw = match result {
            Ok(raw) => raw,
            // Malformed resume positions replay from the beginning:
            // duplicates are preferred over loss.
            Err(BrokerError::Redis(e)) if e.to_string().contains("Invalid stream ID") => {
                warn!(
                    stream = %stream,
                    after = ?after,
                    "invalid resume position, replaying from the beginning"
                );
                self.query(
                    redis::cmd("XRANGE")
                        .arg(stream)
                        .arg("-")
                        .arg("+")
                        .arg("COUNT")
                        .arg(count as i64),
                )
                .await?
            }
            Err(e) => return Err(e),
        };
        let mut deliveries = Vec::new();
        for entry in as_array(raw, "XRANGE reply")? {
            deliveries.push(parse_entry(&entry)?);
        }
        Ok(deliveries)
    }

    /// Blocking positional read via XREAD BLOCK.
    pub async fn read_from_blocking(
        &self,
        stream: &str,
        after: Option<&str>,
        timeout: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        self.check_open()?;
        let position = after.unwrap_or("0-0");
        let result = self
            .query(
                redis::cmd("XREAD")
                    .arg("COUNT")
                    .arg(count as i64)
                    .arg("BLOCK")
                    .arg(timeout.as_millis() as i64)
                    .arg("STREAMS")
                    .arg(stream)
                    .arg(position),
            )
            .await;
        match result {
            Ok(raw) => parse_read_response(raw),
            Err(BrokerError::Redis(e)) if e.to_string().contains("Invalid stream ID") => {
                warn!(
                    stream = %stream,
                    after = ?after,
                    "invalid resume position, replaying from the beginning"
                );
                self.read_from(stream, None, count).await
            }
            Err(e) => Err(e),
        }
    }

    /// Quarantine a message on the stream's dead-letter stream.
    pub async fn dead_letter(
        &self,
        stream: &str,
        payload: &MessagePayload,
        original_id: &str,
        reason: &str,
    ) -> BrokerResult<()> {
        self.check_open()?;
        let key = self.config.dead_letter_stream(stream);
        let json = serde_json::to_string(payload)?;
        self.query(
            redis::cmd("XADD")
                .arg(&key)
                .arg("*")
                .arg("payload")
                .arg(&json)
                .arg("original_id")
                .arg(original_id)
                .arg("reason")
                .arg(reason)
                .arg("dead_lettered_at")
                .arg(format_datetime(&Utc::now())),
        )
        .await?;
        warn!(stream = %stream, original_id = %original_id, reason = %reason, "message dead-lettered");
        Ok(())
    }

    /// Read up to `count` dead letters for a stream, oldest first.
    pub async fn read_dead_letters(
        &self,
        stream: &str,
        count: usize,
    ) -> BrokerResult<Vec<DeadLetter>> {
        self.check_open()?;
        let key = self.config.dead_letter_stream(stream);
        let raw = self
            .query(
                redis::cmd("XRANGE")
                    .arg(&key)
                    .arg("-")
                    .arg("+")
                    .arg("COUNT")
                    .arg(count as i64),
            )
            .await?;
        let mut letters = Vec::new();
        for entry in as_array(raw, "XRANGE reply")? {
            letters.push(parse_dead_letter(&entry)?);
        }
        Ok(letters)
    }

    /// Per-stream diagnostics. `None` for keys Redis has never seen.
    pub async fn info(&self, stream: &str) -> BrokerResult<Option<StreamInfo>> {
        self.check_open()?;
        let raw = self.query(redis::cmd("EXISTS").arg(stream)).await?;
        if as_int(&raw, "EXISTS reply")? == 0 {
            return Ok(None);
        }
        let raw = self.query(redis::cmd("XLEN").arg(stream)).await?;
        let length = as_int(&raw, "XLEN reply")? as u64;

        let raw = self
            .query(redis::cmd("XINFO").arg("GROUPS").arg(stream))
            .await?;
        let mut groups = Vec::new();
        for item in as_array(raw, "XINFO GROUPS reply")? {
            let fields = kv_pairs(&item)?;
            let name = match fields.get("name") {
                Some(v) => as_string(v, "group name")?,
                None => continue,
            };
            let pending = match fields.get("pending") {
                Some(v) => as_int(v, "group pending")? as u64,
                None => 0,
            };
            let last_delivered_id = match fields.get("last-delivered-id") {
                Some(v) => Some(as_string(v, "last-delivered-id")?).filter(|s| s != "0-0"),
                None => None,
            };
            let consumers = self.group_consumers(stream, &name).await?;
            groups.push(GroupInfo {
                name,
                consumers,
                pending,
                last_delivered_id,
            });
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(StreamInfo {
            stream: stream.to_string(),
            length,
            groups,
        }))
    }

    async fn group_consumers(&self, stream: &str, group: &str) -> BrokerResult<Vec<String>> {
        let raw = self
            .query(redis::cmd("XINFO").arg("CONSUMERS").arg(stream).arg(group))
            .await?;
        let mut names = Vec::new();
        for item in as_array(raw, "XINFO CONSUMERS reply")? {
            let fields = kv_pairs(&item)?;
            if let Some(v) = fields.get("name") {
                names.push(as_string(v, "consumer name")?);
            }
        }
        names.sort();
        Ok(names)
    }

    /// PING-based health check.
    pub async fn health_stats(&self) -> HealthStats {
        let healthy = !self.closed.load(Ordering::SeqCst)
            && match self.query(&redis::cmd("PING")).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(error = %e, "Redis health check failed");
                    false
                }
            };
        HealthStats {
            kind: "redis".to_string(),
            healthy,
            capabilities: self.capabilities().names(),
        }
    }

    /// Mark the broker closed. Subsequent operations answer
    /// [`BrokerError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        info!("Redis broker closed");
    }
}

fn as_array(value: redis::Value, context: &str) -> BrokerResult<Vec<redis::Value>> {
    match value {
        redis::Value::Array(items) => Ok(items),
        redis::Value::Nil => Ok(Vec::new()),
        other => Err(BrokerError::Protocol(format!(
            "expected array for {}, got {:?}",
            context, other
        ))),
    }
}

fn as_string(value: &redis::Value, context: &str) -> BrokerResult<String> {
    match value {
        redis::Value::BulkString(bytes) => Ok(String::from_utf8_lossy(bytes).to_string()),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        other => Err(BrokerError::Protocol(format!(
            "expected string for {}, got {:?}",
            context, other
        ))),
    }
}

fn as_int(value: &redis::Value, context: &str) -> BrokerResult<i64> {
    match value {
        redis::Value::Int(n) => Ok(*n),
        redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes)
            .parse()
            .map_err(|_| BrokerError::Protocol(format!("expected integer for {}", context))),
        other => Err(BrokerError::Protocol(format!(
            "expected integer for {}, got {:?}",
            context, other
        ))),
    }
}

/// Flat `[k, v, k, v, ...]` field list into a map.
fn field_map(value: &redis::Value) -> BrokerResult<HashMap<String, String>> {
    let items = match value {
        redis::Value::Array(items) => items,
        redis::Value::Nil => return Ok(HashMap::new()),
        other => {
            return Err(BrokerError::Protocol(format!(
                "expected field list, got {:?}",
                other
            )))
        }
    };
    let mut map = HashMap::new();
    let mut i = 0;
    while i + 1 < items.len() {
        let key = as_string(&items[i], "field name")?;
        let val = as_string(&items[i + 1], "field value")?;
        map.insert(key, val);
        i += 2;
    }
    Ok(map)
}

/// Flat `[k, v, k, v, ...]` list keeping raw values, for XINFO replies
/// whose values mix strings and integers.
fn kv_pairs(value: &redis::Value) -> BrokerResult<HashMap<String, redis::Value>> {
    let items = match value {
        redis::Value::Array(items) => items,
        other => {
            return Err(BrokerError::Protocol(format!(
                "expected info entry, got {:?}",
                other
            )))
        }
    };
    let mut map = HashMap::new();
    let mut i = 0;
    while i + 1 < items.len() {
        map.insert(as_string(&items[i], "info key")?, items[i + 1].clone());
        i += 2;
    }
    Ok(map)
}

/// One `[id, [field, value, ...]]` stream entry into a [`Delivery`].
fn parse_entry(entry: &redis::Value) -> BrokerResult<Delivery> {
    let parts = match entry {
        redis::Value::Array(parts) => parts,
        other => {
            return Err(BrokerError::Protocol(format!(
                "expected stream entry, got {:?}",
                other
            )))
        }
    };
    if parts.len() < 2 {
        return Err(BrokerError::Protocol("stream entry too short".to_string()));
    }
    let id = as_string(&parts[0], "entry id")?;
    let fields = field_map(&parts[1])?;
    let raw = fields.get("payload").ok_or_else(|| {
        BrokerError::Protocol(format!("entry {} missing payload field", id))
    })?;
    let payload: MessagePayload = serde_json::from_str(raw)?;
    Ok(Delivery { id, payload })
}

/// XREAD/XREADGROUP reply: `[[stream, [entry, ...]], ...]`.
fn parse_read_response(value: redis::Value) -> BrokerResult<Vec<Delivery>> {
    let streams = match value {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Array(streams) => streams,
        other => {
            return Err(BrokerError::Protocol(format!(
                "unexpected read reply type: {:?}",
                other
            )))
        }
    };
    let mut deliveries = Vec::new();
    for stream in streams {
        let parts = as_array(stream, "stream block")?;
        if parts.len() < 2 {
            continue;
        }
        for entry in as_array(parts[1].clone(), "stream entries")? {
            deliveries.push(parse_entry(&entry)?);
        }
    }
    Ok(deliveries)
}

fn parse_dead_letter(entry: &redis::Value) -> BrokerResult<DeadLetter> {
    let parts = match entry {
        redis::Value::Array(parts) => parts,
        other => {
            return Err(BrokerError::Protocol(format!(
                "expected dead letter entry, got {:?}",
                other
            )))
        }
    };
    if parts.len() < 2 {
        return Err(BrokerError::Protocol(
            "dead letter entry too short".to_string(),
        ));
    }
    let fields = field_map(&parts[1])?;
    let raw = fields
        .get("payload")
        .ok_or_else(|| BrokerError::Protocol("dead letter missing payload field".to_string()))?;
    let payload: MessagePayload = serde_json::from_str(raw)?;
    Ok(DeadLetter {
        payload,
        original_id: fields.get("original_id").cloned().unwrap_or_default(),
        reason: fields.get("reason").cloned().unwrap_or_default(),
        dead_lettered_at: fields
            .get("dead_lettered_at")
            .map(|s| parse_datetime(s))
            .unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::MessageMetadata;
    use serde_json::json;

    fn bulk(s: &str) -> redis::Value {
        redis::Value::BulkString(s.as_bytes().to_vec())
    }

    fn payload_json(id: &str) -> String {
        serde_json::to_string(&MessagePayload {
            id: id.to_string(),
            message_type: "TestEvent".to_string(),
            data: json!({ "n": 1 }),
            metadata: MessageMetadata::new("event"),
            correlation_id: None,
            trace_id: None,
            created_at: Utc::now(),
        })
        .unwrap()
    }

    #[test]
    fn parses_xreadgroup_reply_shape() {
        let reply = redis::Value::Array(vec![redis::Value::Array(vec![
            bulk("orders"),
            redis::Value::Array(vec![
                redis::Value::Array(vec![
                    bulk("1111-0"),
                    redis::Value::Array(vec![bulk("payload"), bulk(&payload_json("msg-1"))]),
                ]),
                redis::Value::Array(vec![
                    bulk("1111-1"),
                    redis::Value::Array(vec![bulk("payload"), bulk(&payload_json("msg-2"))]),
                ]),
            ]),
        ])]);

        let deliveries = parse_read_response(reply).unwrap();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].id, "1111-0");
        assert_eq!(deliveries[0].payload.id, "msg-1");
        assert_eq!(deliveries[1].payload.id, "msg-2");
    }

    #[test]
    fn nil_reply_means_no_messages() {
        let deliveries = parse_read_response(redis::Value::Nil).unwrap();
        assert!(deliveries.is_empty());
    }

    #[test]
    fn entry_without_payload_field_is_a_protocol_error() {
        let entry = redis::Value::Array(vec![
            bulk("1111-0"),
            redis::Value::Array(vec![bulk("other"), bulk("value")]),
        ]);
        let result = parse_entry(&entry);
        assert!(matches!(result, Err(BrokerError::Protocol(_))));
    }

    #[test]
    fn parses_dead_letter_fields() {
        let entry = redis::Value::Array(vec![
            bulk("2222-0"),
            redis::Value::Array(vec![
                bulk("payload"),
                bulk(&payload_json("msg-9")),
                bulk("original_id"),
                bulk("1111-0"),
                bulk("reason"),
                bulk("handler failed"),
                bulk("dead_lettered_at"),
                bulk("2026-08-25T12:00:00.000000Z"),
            ]),
        ]);
        let letter = parse_dead_letter(&entry).unwrap();
        assert_eq!(letter.original_id, "1111-0");
        assert_eq!(letter.reason, "handler failed");
        assert_eq!(letter.payload.id, "msg-9");
    }

    #[test]
    fn kv_pairs_reads_xinfo_shapes() {
        let entry = redis::Value::Array(vec![
            bulk("name"),
            bulk("billing"),
            bulk("pending"),
            redis::Value::Int(3),
        ]);
        let fields = kv_pairs(&entry).unwrap();
        assert_eq!(as_string(&fields["name"], "name").unwrap(), "billing");
        assert_eq!(as_int(&fields["pending"], "pending").unwrap(), 3);
    }

    #[tokio::test]
    async fn failed_reconnect_surfaces_the_original_error() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            socket
        });

        let config = RedisBrokerConfig {
            url: format!("redis://{}", addr),
            ..RedisBrokerConfig::default()
        };
        let broker = RedisStreamBroker::connect(config).await.unwrap();

        // Close the live connection and stop accepting: the next command
        // dies on the dropped socket and the reconnect attempt is refused.
        drop(server.await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = broker.publish("orders", &test_payload(1)).await.unwrap_err();
        assert!(err.is_connection());
        match err {
            // The reconnect fails with a refusal; the caller must still
            // see the dropped-connection error from its own command.
            BrokerError::Redis(inner) => assert!(!inner.is_connection_refusal()),
            other => panic!("expected the command's transport error, got {}", other),
        }
    }

    // Integration coverage against a real Redis. Run with
    // `cargo test -- --ignored` and REDIS_URL pointing at a test instance.

    async fn test_broker() -> RedisStreamBroker {
        let mut config = RedisBrokerConfig::from_env();
        config.broker.base_delay_ms = 10;
        config.broker.group_start = DeliveryStart::Beginning;
        RedisStreamBroker::connect(config).await.unwrap()
    }

    fn test_payload(n: u32) -> MessagePayload {
        MessagePayload {
            id: format!("msg-{}", n),
            message_type: "TestEvent".to_string(),
            data: json!({ "n": n }),
            metadata: MessageMetadata::new("event"),
            correlation_id: None,
            trace_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn publish_read_ack_round() {
        let broker = test_broker().await;
        let stream = format!("courier:test:{}", uuid::Uuid::new_v4());

        let id = broker.publish(&stream, &test_payload(1)).await.unwrap();
        let batch = broker.read(&stream, "g", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].payload.id, "msg-1");

        assert!(broker.ack(&stream, &id, "g").await.unwrap());
        assert!(!broker.ack(&stream, &id, "g").await.unwrap());
        assert!(broker.read(&stream, "g", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn nack_redelivers_then_dead_letters() {
        let mut config = RedisBrokerConfig::from_env();
        config.broker.base_delay_ms = 10;
        config.broker.max_retries = 1;
        config.broker.group_start = DeliveryStart::Beginning;
        let broker = RedisStreamBroker::connect(config).await.unwrap();
        let stream = format!("courier:test:{}", uuid::Uuid::new_v4());

        let id = broker.publish(&stream, &test_payload(7)).await.unwrap();
        let batch = broker.read(&stream, "g", 1).await.unwrap();
        assert_eq!(batch.len(), 1);

        assert!(broker.nack(&stream, &id, "g").await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let redelivered = broker.read(&stream, "g", 1).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].id, id);

        assert!(broker.nack(&stream, &id, "g").await.unwrap());
        let dead = broker.read_dead_letters(&stream, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].original_id, id);
        assert!(broker.read(&stream, "g", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn positional_reads_resume_after_id() {
        let broker = test_broker().await;
        let stream = format!("courier:test:{}", uuid::Uuid::new_v4());

        let first = broker.publish(&stream, &test_payload(1)).await.unwrap();
        broker.publish(&stream, &test_payload(2)).await.unwrap();

        let all = broker.read_from(&stream, None, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let tail = broker
            .read_from(&stream, Some(&first), 10)
            .await
            .unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].payload.id, "msg-2");
    }
}
