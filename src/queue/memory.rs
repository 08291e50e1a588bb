//! In-memory queue.
//!
//! Also implements [`TaskPublisher`], so a single process can publish
//! verification tasks and consume them without Redis.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{QueueError, QueueTransport, ReceiptHandle, ReceivedMessage};
use crate::publisher::{PublishError, TaskPublisher};

#[derive(Debug, Clone)]
struct Stored {
    message_id: String,
    body: Vec<u8>,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Stored>,
    in_flight: HashMap<ReceiptHandle, Stored>,
    delayed: Vec<(Instant, Stored)>,
    acknowledged: Vec<String>,
    visibility_resets: Vec<(String, Duration)>,
}

/// A process-local queue with receipt handles and visibility delays.
///
/// Messages not acknowledged stay in flight until
/// [`QueueTransport::set_visibility_delay`] hands them back; there is no
/// redelivery timer.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    next_id: AtomicU64,
    fail_acknowledge: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message body, returning its id.
    pub async fn push(&self, body: impl Into<Vec<u8>>) -> String {
        let message_id = format!("m-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.state.lock().await.ready.push_back(Stored {
            message_id: message_id.clone(),
            body: body.into(),
        });
        message_id
    }

    /// Make acknowledgements fail, e.g. to simulate a dropped connection.
    pub fn set_fail_acknowledge(&self, fail: bool) {
        self.fail_acknowledge.store(fail, Ordering::Relaxed);
    }

    /// Ids of acknowledged messages, in acknowledgement order.
    pub async fn acknowledged(&self) -> Vec<String> {
        self.state.lock().await.acknowledged.clone()
    }

    /// `(message id, delay)` for every visibility change.
    pub async fn visibility_resets(&self) -> Vec<(String, Duration)> {
        self.state.lock().await.visibility_resets.clone()
    }

    /// Messages waiting for delivery, including delayed ones.
    pub async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.delayed.len()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn receive_batch(&self, max: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(visible_at, _)| *visible_at <= now);
        state.delayed = waiting;
        state.ready.extend(due.into_iter().map(|(_, stored)| stored));

        let mut batch = Vec::with_capacity(max.min(state.ready.len()));
        while batch.len() < max {
            let Some(stored) = state.ready.pop_front() else {
                break;
            };
            let receipt = ReceiptHandle(format!(
                "{}#{}",
                stored.message_id,
                self.next_id.fetch_add(1, Ordering::Relaxed) + 1
            ));
            batch.push(ReceivedMessage {
                message_id: stored.message_id.clone(),
                receipt_handle: receipt.clone(),
                body: stored.body.clone(),
            });
            state.in_flight.insert(receipt, stored);
        }

        Ok(batch)
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        if self.fail_acknowledge.load(Ordering::Relaxed) {
            return Err(QueueError::Connection("acknowledge disabled".to_string()));
        }

        let mut state = self.state.lock().await;
        let stored = state
            .in_flight
            .remove(receipt)
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))?;
        state.acknowledged.push(stored.message_id);
        Ok(())
    }

    async fn set_visibility_delay(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let stored = state
            .in_flight
            .remove(receipt)
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))?;

        state.visibility_resets.push((stored.message_id.clone(), delay));
        if delay.is_zero() {
            state.ready.push_back(stored);
        } else {
            state.delayed.push((Instant::now() + delay, stored));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskPublisher for InMemoryQueue {
    async fn publish(&self, serialized: String) -> Result<String, PublishError> {
        Ok(self.push(serialized).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_respects_max() {
        let queue = InMemoryQueue::new();
        for i in 0..5 {
            queue.push(format!("body-{i}")).await;
        }

        let batch = queue.receive_batch(3).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].body, b"body-0");
        assert_eq!(queue.pending().await, 2);
        assert_eq!(queue.in_flight().await, 3);
    }

    #[tokio::test]
    async fn test_acknowledge_removes_message() {
        let queue = InMemoryQueue::new();
        let id = queue.push("x").await;

        let batch = queue.receive_batch(10).await.unwrap();
        queue.acknowledge(&batch[0].receipt_handle).await.unwrap();

        assert_eq!(queue.acknowledged().await, vec![id]);
        assert_eq!(queue.in_flight().await, 0);
        assert!(queue.receive_batch(10).await.unwrap().is_empty());

        // A receipt is only good once
        let again = queue.acknowledge(&batch[0].receipt_handle).await;
        assert!(matches!(again, Err(QueueError::UnknownReceipt(_))));
    }

    #[tokio::test]
    async fn test_zero_delay_redelivers_immediately() {
        let queue = InMemoryQueue::new();
        let id = queue.push("x").await;

        let first = queue.receive_batch(10).await.unwrap();
        queue
            .set_visibility_delay(&first[0].receipt_handle, Duration::ZERO)
            .await
            .unwrap();

        let second = queue.receive_batch(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, id);
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_message_waits() {
        let queue = InMemoryQueue::new();
        queue.push("x").await;

        let first = queue.receive_batch(10).await.unwrap();
        queue
            .set_visibility_delay(&first[0].receipt_handle, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(queue.receive_batch(10).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(queue.receive_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_enqueues() {
        let queue = InMemoryQueue::new();
        queue.publish("{}".to_string()).await.unwrap();
        assert_eq!(queue.pending().await, 1);
    }
}
