//! Redis Streams transport.
//!
//! Messages are stream entries with a single `body` field, read through a
//! consumer group. The receipt handle is the entry id.
//!
//! ```text
//! XADD ──▶ stream ──XREADGROUP──▶ in flight (PEL) ──XACK + XDEL──▶ gone
//!                                   │
//!                 idle ≥ visibility │ XCLAIM (redelivery)
//!                                   ▼
//!                  deliveries ≥ max ──▶ dead-letter stream
//! ```
//!
//! A visibility delay is implemented by rewriting the entry's idle time,
//! so it becomes claimable once `visibility_timeout - delay` has passed.

use async_trait::async_trait;
use deadpool_redis::redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use deadpool_redis::redis::{cmd, pipe, AsyncCommands, Cmd, Value as RedisValue};
use deadpool_redis::{Connection, Pool};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{QueueError, QueueTransport, ReceiptHandle, ReceivedMessage};
use crate::dlq::DeadLetterQueue;
use crate::publisher::BODY_FIELD;

const DEFAULT_BLOCK: Duration = Duration::from_millis(2000);
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_DELIVERIES: u64 = 5;

pub struct RedisStreamQueue {
    pool: Pool,
    stream: String,
    group: String,
    consumer: String,
    block: Duration,
    visibility_timeout: Duration,
    max_deliveries: u64,
    dlq: DeadLetterQueue,
}

impl RedisStreamQueue {
    pub fn new(pool: Pool, stream: impl Into<String>, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        let stream = stream.into();
        Self {
            dlq: DeadLetterQueue::for_stream(pool.clone(), &stream),
            pool,
            stream,
            group: group.into(),
            consumer: consumer.into(),
            block: DEFAULT_BLOCK,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }

    /// How long an empty read waits for new entries
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u64) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    pub fn dead_letter_queue(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    async fn connection(&self) -> Result<Connection, QueueError> {
        self.pool.get().await.map_err(|e| QueueError::Connection(e.to_string()))
    }

    /// Create the consumer group (and stream) unless it already exists.
    pub async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;

        let created: Result<(), _> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => info!(stream = %self.stream, consumer_group = %self.group, "Created consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.stream, consumer_group = %self.group, "Consumer group already exists")
            }
            Err(e) => {
                error!(error = %e, consumer_group = %self.group, "Failed to create consumer group");
                return Err(QueueError::Command(e.to_string()));
            }
        }
        Ok(())
    }

    /// Claim entries whose visibility expired. Entries that reached the
    /// delivery limit go to the dead-letter stream instead.
    async fn reclaim_expired(&self, conn: &mut Connection, max: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let min_idle_ms = self.visibility_timeout.as_millis() as usize;

        let pending: StreamPendingCountReply = expired_pending_cmd(&self.stream, &self.group, min_idle_ms, max)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;

        let mut expired = Vec::new();

        for entry in pending.ids {
            if entry.times_delivered as u64 >= self.max_deliveries {
                self.dead_letter(conn, &entry.id, entry.times_delivered as u64).await?;
            } else {
                expired.push(entry.id);
            }
        }

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(&self.stream, &self.group, &self.consumer, min_idle_ms, &expired[..])
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;

        if !claimed.ids.is_empty() {
            info!(count = claimed.ids.len(), stream = %self.stream, "Reclaimed messages for redelivery");
        }
        Ok(claimed.ids.into_iter().map(into_message).collect())
    }

    async fn dead_letter(&self, conn: &mut Connection, id: &str, deliveries: u64) -> Result<(), QueueError> {
        let entry: StreamRangeReply = conn
            .xrange(&self.stream, id, id)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;

        let body = entry
            .ids
            .into_iter()
            .next()
            .map(|entry| String::from_utf8_lossy(&body_bytes(&entry)).into_owned())
            .unwrap_or_default();

        warn!(id = %id, deliveries = deliveries, max_deliveries = self.max_deliveries, "Delivery limit reached");

        // Only drop the entry once it is safely in the DLQ
        self.dlq
            .add_failed_message(id, &body, "delivery limit reached", deliveries)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;
        self.remove(conn, id).await.map(|_| ())
    }

    async fn remove(&self, conn: &mut Connection, id: &str) -> Result<bool, QueueError> {
        let (acked, _deleted): (u64, u64) = pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(id)
            .cmd("XDEL")
            .arg(&self.stream)
            .arg(id)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;
        Ok(acked > 0)
    }
}

/// `XPENDING ... IDLE` (Redis 6.2+): only entries idle for `min_idle_ms`,
/// so fresh in-flight entries never crowd expired ones out of `max`.
fn expired_pending_cmd(stream: &str, group: &str, min_idle_ms: usize, max: usize) -> Cmd {
    let mut xpending = cmd("XPENDING");
    xpending
        .arg(stream)
        .arg(group)
        .arg("IDLE")
        .arg(min_idle_ms)
        .arg("-")
        .arg("+")
        .arg(max);
    xpending
}

fn body_bytes(entry: &StreamId) -> Vec<u8> {
    match entry.map.get(BODY_FIELD) {
        Some(RedisValue::BulkString(bytes)) => bytes.clone(),
        Some(RedisValue::SimpleString(s)) => s.as_bytes().to_vec(),
        _ => Vec::new(),
    }
}

fn into_message(entry: StreamId) -> ReceivedMessage {
    ReceivedMessage {
        body: body_bytes(&entry),
        receipt_handle: ReceiptHandle(entry.id.clone()),
        message_id: entry.id,
    }
}

#[async_trait]
impl QueueTransport for RedisStreamQueue {
    async fn receive_batch(&self, max: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut conn = self.connection().await?;

        let mut batch = self.reclaim_expired(&mut conn, max).await?;
        if batch.len() >= max {
            return Ok(batch);
        }

        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max - batch.len());
        if batch.is_empty() {
            opts = opts.block(self.block.as_millis() as usize);
        }

        // A blocking read that times out answers nil
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &opts)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;

        if let Some(reply) = reply {
            for key in reply.keys {
                batch.extend(key.ids.into_iter().map(into_message));
            }
        }

        debug!(count = batch.len(), stream = %self.stream, "Received batch");
        Ok(batch)
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;

        if self.remove(&mut conn, &receipt.0).await? {
            Ok(())
        } else {
            Err(QueueError::UnknownReceipt(receipt.to_string()))
        }
    }

    async fn set_visibility_delay(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let idle = self.visibility_timeout.saturating_sub(delay);

        let claimed: Vec<String> = cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(&receipt.0)
            .arg("IDLE")
            .arg(idle.as_millis() as u64)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;

        if claimed.is_empty() {
            return Err(QueueError::UnknownReceipt(receipt.to_string()));
        }

        debug!(id = %receipt, delay_ms = delay.as_millis() as u64, "Visibility reset");
        Ok(())
    }
}
