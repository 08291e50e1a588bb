//! Dead Letter Queue for undeliverable messages.
//!
//! The Redis transport moves a message here once it has been delivered
//! `max_deliveries` times without being acknowledged. The raw body is kept
//! verbatim so the message can be inspected or re-published by hand.
//!
//! # Example
//!
//! ```rust,ignore
//! use mailgate::dlq::DeadLetterQueue;
//!
//! let dlq = DeadLetterQueue::for_stream(pool, "mailgate:events");
//! dlq.add_failed_message("1700000000000-0", body, "delivery limit reached", 5).await?;
//!
//! let letters = dlq.list(10, 0).await?;
//! ```

use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, info};

/// Suffix appended to a stream name to form its dead-letter stream.
pub const DLQ_SUFFIX: &str = ":dlq";

/// Maximum entries to keep (older entries are trimmed)
const DLQ_MAX_LEN: usize = 10000;

/// One dead-lettered message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Id within the dead-letter stream
    pub id: String,
    /// Id the message had on the source stream
    pub original_id: String,
    pub body: String,
    pub reason: String,
    pub deliveries: u64,
    /// RFC 3339
    pub failed_at: String,
}

impl DeadLetter {
    fn from_fields(id: String, fields: Vec<(String, String)>) -> Self {
        let mut fields: HashMap<String, String> = fields.into_iter().collect();
        let mut take = |name: &str| fields.remove(name).unwrap_or_default();

        Self {
            original_id: take("originalId"),
            body: take("body"),
            reason: take("reason"),
            deliveries: take("deliveries").parse().unwrap_or(0),
            failed_at: take("failedAt"),
            id,
        }
    }
}

#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: Pool,
    stream: String,
}

impl DeadLetterQueue {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }

    /// The dead-letter queue belonging to `source_stream`.
    pub fn for_stream(pool: Pool, source_stream: &str) -> Self {
        Self::new(pool, format!("{source_stream}{DLQ_SUFFIX}"))
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, DlqError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for DLQ");
            DlqError::Connection(e.to_string())
        })
    }

    /// Store a failed message, returning its dead-letter id.
    pub async fn add_failed_message(
        &self,
        original_id: &str,
        body: &str,
        reason: &str,
        deliveries: u64,
    ) -> Result<String, DlqError> {
        let mut conn = self.connection().await?;
        let failed_at = chrono::Utc::now().to_rfc3339();

        let id: String = cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LEN)
            .arg("*")
            .arg("originalId")
            .arg(original_id)
            .arg("body")
            .arg(body)
            .arg("reason")
            .arg(reason)
            .arg("deliveries")
            .arg(deliveries)
            .arg("failedAt")
            .arg(&failed_at)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, original_id = %original_id, "Failed to add message to DLQ");
                DlqError::Command(e.to_string())
            })?;

        info!(
            dlq_id = %id,
            original_id = %original_id,
            deliveries = deliveries,
            reason = %reason,
            "Message moved to Dead Letter Queue"
        );
        Ok(id)
    }

    pub async fn count(&self) -> Result<u64, DlqError> {
        let mut conn = self.connection().await?;

        cmd("XLEN")
            .arg(&self.stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))
    }

    /// Oldest first, skipping `offset` entries.
    pub async fn list(&self, count: usize, offset: usize) -> Result<Vec<DeadLetter>, DlqError> {
        let mut conn = self.connection().await?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(&self.stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count + offset)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        let letters: Vec<DeadLetter> = entries
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|(id, fields)| DeadLetter::from_fields(id, fields))
            .collect();

        debug!(count = letters.len(), "Retrieved DLQ entries");
        Ok(letters)
    }

    /// Drop an entry after manual review.
    pub async fn remove(&self, id: &str) -> Result<bool, DlqError> {
        let mut conn = self.connection().await?;

        let removed: u64 = cmd("XDEL")
            .arg(&self.stream)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        if removed > 0 {
            info!(id = %id, "Removed message from DLQ");
        }
        Ok(removed > 0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),
}
