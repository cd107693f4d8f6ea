//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! - **Stream key**: `geotill:jobs` by default; one entry per job reference,
//!   with the JSON message in the `payload` field
//! - **Consumer group**: shared by all workers; each entry goes to one worker
//! - **Redelivery**: an entry that is not acknowledged stays in the group's
//!   pending list and is claimed by the next `receive` once it has been idle
//!   for `claim_idle`
//! - **Dead-letter queue**: `<stream>:dlq`; entries delivered
//!   `max_deliveries` times are copied there and acknowledged

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use geotill_queue::{Delivery, JobMessage, MessageQueue};

const DEFAULT_MAX_DELIVERIES: u64 = 5;

const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    max_deliveries: u64,
    claim_idle: Duration,
}

impl RedisStreamsQueue {
    /// Connect and make sure the consumer group exists.
    ///
    /// * `redis_url` - e.g. `redis://localhost:6379`
    /// * `consumer` - unique per worker process (the worker name)
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let stream_key = stream_key.into();

        let queue = Self {
            client: Arc::new(client),
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
            group: group.into(),
            consumer: consumer.into(),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            claim_idle: DEFAULT_CLAIM_IDLE,
        };
        queue.ensure_consumer_group()?;
        Ok(queue)
    }

    pub fn with_max_deliveries(mut self, max: u64) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    /// How long an unacknowledged entry stays with its consumer before another
    /// `receive` may claim it.
    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// `XGROUP CREATE ... MKSTREAM`; an existing group is fine.
    fn ensure_consumer_group(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {}", e))),
        }
    }

    /// Claim the oldest entry that has sat unacknowledged for `claim_idle`.
    ///
    /// Entries past the delivery limit are dead-lettered on the way.
    fn claim_stale(&self, conn: &mut redis::Connection) -> Result<Option<Delivery>, RedisStreamsError> {
        loop {
            let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg("IDLE")
                .arg(self.claim_idle.as_millis().to_string())
                .arg("-")
                .arg("+")
                .arg(1)
                .query(conn)
                .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {}", e)))?;

            let Some((entry_id, _owner, _idle, deliveries)) = pending.into_iter().next() else {
                return Ok(None);
            };

            let claimed: redis::Value = redis::cmd("XCLAIM")
                .arg(&self.stream_key)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(self.claim_idle.as_millis().to_string())
                .arg(&entry_id)
                .query(conn)
                .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {}", e)))?;

            let entry = match classify_claim(&claimed, || self.entry_exists(conn, &entry_id))? {
                ClaimOutcome::Claimed(entry) => entry,
                ClaimOutcome::Lost => {
                    debug!(message_id = %entry_id, "stale entry claimed by another consumer");
                    return Ok(None);
                }
                ClaimOutcome::Trimmed => {
                    warn!(message_id = %entry_id, "pending entry no longer in stream; acknowledging");
                    self.xack(conn, &entry_id)?;
                    continue;
                }
            };

            let (id, message) = match parse_entry(entry) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(message_id = %entry_id, error = %e, "dropping unreadable stream entry");
                    self.xack(conn, &entry_id)?;
                    continue;
                }
            };

            if deliveries >= self.max_deliveries {
                self.dead_letter(conn, &id, &message, deliveries)?;
                continue;
            }

            let attempt = u32::try_from(deliveries + 1).unwrap_or(u32::MAX);
            debug!(message_id = %id, job_id = %message.id(), attempt, "claimed stale stream entry");
            return Ok(Some(Delivery::new(id, message, attempt)));
        }
    }

    fn read_new(&self, conn: &mut redis::Connection, wait: Duration) -> Result<Option<Delivery>, RedisStreamsError> {
        let block_ms = wait.as_millis().max(1).to_string();
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {}", e)))?;

        // Reply: [[stream_key, [entry, ...]]], or nil on timeout.
        let entry = match &reply {
            redis::Value::Bulk(streams) => streams.first().and_then(|stream| match stream {
                redis::Value::Bulk(parts) if parts.len() == 2 => first_entry(&parts[1]),
                _ => None,
            }),
            _ => None,
        };
        let Some(entry) = entry else {
            return Ok(None);
        };

        match parse_entry(entry) {
            Ok((id, message)) => Ok(Some(Delivery::new(id, message, 1))),
            Err(e) => {
                warn!(error = %e, "dropping unreadable stream entry");
                if let Some(id) = entry_id(entry) {
                    self.xack(conn, &id)?;
                }
                Ok(None)
            }
        }
    }

    /// `XRANGE id id`: whether the entry is still in the stream.
    fn entry_exists(&self, conn: &mut redis::Connection, entry_id: &str) -> Result<bool, RedisStreamsError> {
        let range: redis::Value = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg(entry_id)
            .arg(entry_id)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XRANGE failed: {}", e)))?;
        Ok(first_entry(&range).is_some())
    }

    fn xack(&self, conn: &mut redis::Connection, entry_id: &str) -> Result<(), RedisStreamsError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {}", e)))?;
        Ok(())
    }

    fn dead_letter(
        &self,
        conn: &mut redis::Connection,
        entry_id: &str,
        message: &JobMessage,
        deliveries: u64,
    ) -> Result<(), RedisStreamsError> {
        let payload = message
            .to_payload()
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;

        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(entry_id)
            .arg("deliveries")
            .arg(deliveries.to_string())
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(&payload)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("DLQ XADD failed: {}", e)))?;
        self.xack(conn, entry_id)?;

        warn!(
            message_id = %entry_id,
            job_id = %message.id(),
            deliveries,
            "message sent to dead-letter queue"
        );
        Ok(())
    }
}

impl MessageQueue for RedisStreamsQueue {
    type Error = RedisStreamsError;

    #[instrument(skip(self), fields(stream_key = %self.stream_key, job_id = %message.id()), err)]
    fn send(&self, message: JobMessage) -> Result<(), Self::Error> {
        let payload = message
            .to_payload()
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;

        let mut conn = self.connection()?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {}", e)))?;
        Ok(())
    }

    fn receive(&self, wait: Duration) -> Result<Option<Delivery>, Self::Error> {
        let mut conn = self.connection()?;
        if let Some(delivery) = self.claim_stale(&mut conn)? {
            return Ok(Some(delivery));
        }
        self.read_new(&mut conn, wait)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        let mut conn = self.connection()?;
        self.xack(&mut conn, delivery.tag())
    }

    fn nack(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        // Left in the pending list; claimed again once idle for `claim_idle`.
        debug!(
            message_id = %delivery.tag(),
            job_id = %delivery.message().id(),
            attempt = delivery.attempt(),
            "message left pending for redelivery"
        );
        Ok(())
    }
}

/// Result of `XCLAIM` on one pending entry.
#[derive(Debug)]
enum ClaimOutcome<'a> {
    Claimed(&'a redis::Value),
    /// Another consumer claimed it first and now owns it.
    Lost,
    /// Trimmed from the stream; only the pending-list slot is left.
    Trimmed,
}

/// An empty `XCLAIM` reply only means "trimmed" when the entry is really
/// gone; otherwise it belongs to whoever reset its idle time.
fn classify_claim<'a, F>(claimed: &'a redis::Value, exists: F) -> Result<ClaimOutcome<'a>, RedisStreamsError>
where
    F: FnOnce() -> Result<bool, RedisStreamsError>,
{
    if let Some(entry) = first_entry(claimed) {
        return Ok(ClaimOutcome::Claimed(entry));
    }
    if exists()? {
        Ok(ClaimOutcome::Lost)
    } else {
        Ok(ClaimOutcome::Trimmed)
    }
}

/// First entry of an entry list (`[[id, [field, value, ...]], ...]`).
fn first_entry(entries: &redis::Value) -> Option<&redis::Value> {
    match entries {
        redis::Value::Bulk(list) => list.iter().find(|e| matches!(e, redis::Value::Bulk(_))),
        _ => None,
    }
}

fn entry_id(entry: &redis::Value) -> Option<String> {
    match entry {
        redis::Value::Bulk(parts) => match parts.first() {
            Some(redis::Value::Data(id)) => Some(String::from_utf8_lossy(id).to_string()),
            _ => None,
        },
        _ => None,
    }
}

/// Parse `[id, [field, value, ...]]` into the entry ID and its job message.
fn parse_entry(entry: &redis::Value) -> Result<(String, JobMessage), RedisStreamsError> {
    let id = entry_id(entry)
        .ok_or_else(|| RedisStreamsError::Deserialization("invalid entry ID".to_string()))?;

    let fields = match entry {
        redis::Value::Bulk(parts) => match parts.get(1) {
            Some(redis::Value::Bulk(fields)) => fields,
            _ => return Err(RedisStreamsError::Deserialization("invalid fields format".to_string())),
        },
        _ => return Err(RedisStreamsError::Deserialization("invalid entry format".to_string())),
    };

    let payload = fields
        .chunks(2)
        .find_map(|pair| match pair {
            [redis::Value::Data(key), redis::Value::Data(value)] if key.as_slice() == b"payload" => {
                Some(String::from_utf8_lossy(value).to_string())
            }
            _ => None,
        })
        .ok_or_else(|| RedisStreamsError::Deserialization("missing payload field".to_string()))?;

    let message = JobMessage::from_payload(&payload)
        .map_err(|e| RedisStreamsError::Deserialization(format!("invalid payload: {}", e)))?;
    Ok((id, message))
}
