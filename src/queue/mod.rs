//! Queue transports.
//!
//! A [`QueueTransport`] hands out batches of messages and takes them back:
//! acknowledged messages are gone for good, everything else is redelivered
//! once its visibility delay runs out.
//!
//! ## Transports
//!
//! - [`InMemoryQueue`]: process-local queue for tests and single-process runs
//! - [`RedisStreamQueue`]: Redis Streams consumer group with a redelivery
//!   timer and a dead-letter limit

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use memory::InMemoryQueue;
pub use redis::RedisStreamQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    /// The receipt handle does not name an in-flight message
    #[error("unknown receipt handle '{0}'")]
    UnknownReceipt(String),
}

/// Opaque token identifying one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivered message.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: ReceiptHandle,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Receive up to `max` messages. May wait for messages to arrive and
    /// may return an empty batch.
    async fn receive_batch(&self, max: usize) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Remove a processed message from the queue.
    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Make an in-flight message visible again after `delay`. A zero delay
    /// means immediately.
    async fn set_visibility_delay(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError>;
}
