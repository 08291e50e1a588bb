//! Batch consumer.
//!
//! Drains the queue one batch at a time. Every message in a batch gets its
//! own task; a failing message never holds up or aborts the others.
//!
//! ```text
//! receive_batch ─┬─ task(m1) ── dispatch ── ok ──▶ acknowledge
//!                ├─ task(m2) ── dispatch ── err ─▶ visibility = 0
//!                └─ task(m3) ── dispatch ── ok ──▶ acknowledge
//!                        join all, in order
//!                              │
//!                  Err(BatchError [m2]) / Ok(n)
//! ```
//!
//! A message whose task panics is released the same way as a failed one.
//! Acknowledge and visibility calls are best-effort: their failures are
//! logged and leave the message's outcome unchanged. Failed messages come
//! back through the transport's own redelivery; the consumer treats every
//! dispatch error alike.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::queue::{QueueTransport, ReceiptHandle, ReceivedMessage};
use crate::router::{Router, RouterError};
use crate::shutdown::ShutdownSignal;

/// Default number of messages per batch
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Pause after an empty batch
const EMPTY_POLL_DELAY: Duration = Duration::from_millis(200);

/// Pause after the transport failed to deliver a batch
const RECEIVE_ERROR_DELAY: Duration = Duration::from_secs(5);

/// Why one message failed.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Dispatch(#[from] RouterError),

    /// The processing task panicked or was cancelled
    #[error("processing task aborted: {0}")]
    Aborted(#[from] JoinError),
}

#[derive(Debug)]
pub struct MessageFailure {
    pub message_id: String,
    pub error: ProcessingError,
}

/// Every failed message of a batch.
#[derive(Debug)]
pub struct BatchError {
    pub failures: Vec<MessageFailure>,
    /// Batch size, failed or not
    pub total: usize,
}

impl BatchError {
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.message_id.as_str()).collect()
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to process {} of {} messages", self.failures.len(), self.total)?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{}: {}", failure.message_id, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

/// Running totals reported by [`BatchConsumer::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub batches: u64,
    pub processed: u64,
    pub failed: u64,
}

pub struct BatchConsumer {
    router: Arc<Router>,
    queue: Arc<dyn QueueTransport>,
    batch_size: usize,
}

impl BatchConsumer {
    pub fn new(router: Arc<Router>, queue: Arc<dyn QueueTransport>) -> Self {
        Self {
            router,
            queue,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Process one batch concurrently and settle every message.
    ///
    /// Returns the number of messages handled when all succeeded.
    pub async fn process_batch(&self, messages: Vec<ReceivedMessage>) -> Result<usize, BatchError> {
        let total = messages.len();

        let handles: Vec<_> = messages
            .into_iter()
            .map(|message| {
                let message_id = message.message_id.clone();
                let receipt = message.receipt_handle.clone();
                let router = self.router.clone();
                let queue = self.queue.clone();
                (message_id, receipt, tokio::spawn(process_message(router, queue, message)))
            })
            .collect();

        let mut outcomes = Vec::with_capacity(total);
        for (message_id, receipt, handle) in handles {
            let outcome = match handle.await {
                Ok(result) => result.map_err(ProcessingError::from),
                Err(join_error) => {
                    // The task never settled its message
                    error!(message_id = %message_id, error = %join_error, "Processing task aborted");
                    release(self.queue.as_ref(), &message_id, &receipt).await;
                    Err(ProcessingError::from(join_error))
                }
            };
            outcomes.push((message_id, outcome));
        }

        let failures: Vec<MessageFailure> = outcomes
            .into_iter()
            .filter_map(|(message_id, outcome)| outcome.err().map(|error| MessageFailure { message_id, error }))
            .collect();

        if failures.is_empty() {
            debug!(count = total, "Batch processed");
            Ok(total)
        } else {
            Err(BatchError { failures, total })
        }
    }

    /// Receive and process batches until `shutdown` fires. The batch in
    /// flight when it fires is finished first.
    pub async fn run(&self, shutdown: ShutdownSignal) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        info!(batch_size = self.batch_size, "Consumer started");

        while !shutdown.is_triggered() {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.queue.receive_batch(self.batch_size) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    error!(error = %e, "Failed to receive batch");
                    pause(&shutdown, RECEIVE_ERROR_DELAY).await;
                    continue;
                }
            };

            if messages.is_empty() {
                pause(&shutdown, EMPTY_POLL_DELAY).await;
                continue;
            }

            let before = stats.processed + stats.failed;
            stats.batches += 1;
            match self.process_batch(messages).await {
                Ok(count) => stats.processed += count as u64,
                Err(e) => {
                    let failed = e.failures.len() as u64;
                    stats.failed += failed;
                    stats.processed += e.total as u64 - failed;
                    warn!(failed_ids = ?e.failed_ids(), "{e}");
                }
            }

            // Periodic stats (every 100 messages)
            if (stats.processed + stats.failed) / 100 > before / 100 {
                info!(
                    batches = stats.batches,
                    processed = stats.processed,
                    failed = stats.failed,
                    "Consumer statistics"
                );
            }
        }

        info!(
            batches = stats.batches,
            processed = stats.processed,
            failed = stats.failed,
            "Consumer stopped"
        );
        stats
    }
}

async fn pause(shutdown: &ShutdownSignal, delay: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

async fn process_message(
    router: Arc<Router>,
    queue: Arc<dyn QueueTransport>,
    message: ReceivedMessage,
) -> Result<(), RouterError> {
    match router.dispatch(&message.body).await {
        Ok(_) => {
            if let Err(e) = queue.acknowledge(&message.receipt_handle).await {
                warn!(message_id = %message.message_id, error = %e, "Failed to acknowledge message");
            }
            Ok(())
        }
        Err(dispatch_error) => {
            release(queue.as_ref(), &message.message_id, &message.receipt_handle).await;
            Err(dispatch_error)
        }
    }
}

/// Make a failed message deliverable again right away.
async fn release(queue: &dyn QueueTransport, message_id: &str, receipt: &ReceiptHandle) {
    if let Err(e) = queue.set_visibility_delay(receipt, Duration::ZERO).await {
        warn!(message_id = %message_id, error = %e, "Failed to reset message visibility");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{EventHandler, HandlerError, HandlerResult, HandlerSet};
    use crate::queue::InMemoryQueue;
    use crate::router::tests::stub_router;
    use async_trait::async_trait;
    use tokio::sync::Barrier;

    fn task(details: &str) -> String {
        serde_json::json!({
            "eventType": "email-send-task",
            "correlationId": "",
            "eventDetails": details,
        })
        .to_string()
    }

    async fn setup() -> (BatchConsumer, Arc<InMemoryQueue>) {
        let (router, _) = stub_router();
        let queue = Arc::new(InMemoryQueue::new());
        let consumer = BatchConsumer::new(Arc::new(router), queue.clone());
        (consumer, queue)
    }

    #[tokio::test]
    async fn test_one_failure_in_three() {
        let (consumer, queue) = setup().await;
        let first = queue.push(task("ok")).await;
        let second = queue.push(task("fail")).await;
        let third = queue.push(task("ok")).await;

        let batch = queue.receive_batch(10).await.unwrap();
        let err = consumer.process_batch(batch).await.unwrap_err();

        assert_eq!(err.total, 3);
        assert_eq!(err.failed_ids(), vec![second.as_str()]);
        assert!(err.to_string().contains(&second));
        assert!(!err.to_string().contains(&first));

        let mut acked = queue.acknowledged().await;
        acked.sort();
        assert_eq!(acked, vec![first, third]);
        assert_eq!(queue.visibility_resets().await, vec![(second, Duration::ZERO)]);

        // The failed message is immediately deliverable again
        assert_eq!(queue.receive_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_for_every_mix() {
        for mask in 0u32..16 {
            let (consumer, queue) = setup().await;
            let mut expected_failed = Vec::new();
            let mut expected_acked = Vec::new();

            for i in 0..4 {
                let fails = mask & (1 << i) != 0;
                let id = queue.push(task(if fails { "fail" } else { "ok" })).await;
                if fails {
                    expected_failed.push(id);
                } else {
                    expected_acked.push(id);
                }
            }

            let batch = queue.receive_batch(10).await.unwrap();
            let result = consumer.process_batch(batch).await;

            match result {
                Ok(count) => {
                    assert!(expected_failed.is_empty());
                    assert_eq!(count, 4);
                }
                Err(e) => {
                    let failed: Vec<String> = e.failed_ids().into_iter().map(String::from).collect();
                    assert_eq!(failed, expected_failed, "mask {mask:04b}");
                }
            }

            let mut acked = queue.acknowledged().await;
            acked.sort();
            assert_eq!(acked, expected_acked, "mask {mask:04b}");
            assert_eq!(queue.visibility_resets().await.len(), expected_failed.len());
        }
    }

    #[tokio::test]
    async fn test_unparseable_message_is_requeued() {
        let (consumer, queue) = setup().await;
        let id = queue.push("garbage").await;

        let batch = queue.receive_batch(10).await.unwrap();
        let err = consumer.process_batch(batch).await.unwrap_err();

        assert!(matches!(
            err.failures[0].error,
            ProcessingError::Dispatch(RouterError::Parse(_))
        ));
        assert_eq!(queue.visibility_resets().await, vec![(id, Duration::ZERO)]);
    }

    #[tokio::test]
    async fn test_acknowledge_failure_keeps_success() {
        let (consumer, queue) = setup().await;
        queue.push(task("ok")).await;
        queue.set_fail_acknowledge(true);

        let batch = queue.receive_batch(10).await.unwrap();
        assert_eq!(consumer.process_batch(batch).await.unwrap(), 1);
        assert!(queue.acknowledged().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (consumer, _) = setup().await;
        assert_eq!(consumer.process_batch(Vec::new()).await.unwrap(), 0);
    }

    /// Completes only once `parties` handlers are running at the same time.
    struct RendezvousHandler {
        barrier: Barrier,
    }

    #[async_trait]
    impl EventHandler for RendezvousHandler {
        fn name(&self) -> &str {
            "rendezvous"
        }

        async fn handle(&self, _details: &str) -> Result<HandlerResult, HandlerError> {
            self.barrier.wait().await;
            Ok(HandlerResult::success("rendezvous", "met"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_messages_run_concurrently() {
        let rendezvous: Arc<dyn EventHandler> = Arc::new(RendezvousHandler {
            barrier: Barrier::new(3),
        });
        let router = Router::new(HandlerSet {
            send_email: rendezvous.clone(),
            confirm_account: rendezvous.clone(),
            bounce: rendezvous.clone(),
            complaint: rendezvous,
        });
        let queue = Arc::new(InMemoryQueue::new());
        let consumer = BatchConsumer::new(Arc::new(router), queue.clone());

        for _ in 0..3 {
            queue.push(task("{}")).await;
        }
        let batch = queue.receive_batch(10).await.unwrap();

        // Sequential processing would never get past the barrier
        let result = tokio::time::timeout(Duration::from_secs(5), consumer.process_batch(batch)).await;
        assert_eq!(result.expect("batch deadlocked").unwrap(), 3);
    }

    /// Panics on `"panic"` details, succeeds otherwise.
    struct PanickingHandler;

    #[async_trait]
    impl EventHandler for PanickingHandler {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn handle(&self, details: &str) -> Result<HandlerResult, HandlerError> {
            if details == "panic" {
                panic!("handler blew up");
            }
            Ok(HandlerResult::success("panicking", "handled"))
        }
    }

    #[tokio::test]
    async fn test_panicking_task_releases_its_message() {
        let handler: Arc<dyn EventHandler> = Arc::new(PanickingHandler);
        let router = Router::new(HandlerSet {
            send_email: handler.clone(),
            confirm_account: handler.clone(),
            bounce: handler.clone(),
            complaint: handler,
        });
        let queue = Arc::new(InMemoryQueue::new());
        let consumer = BatchConsumer::new(Arc::new(router), queue.clone());

        let healthy = queue.push(task("ok")).await;
        let doomed = queue.push(task("panic")).await;

        let batch = queue.receive_batch(10).await.unwrap();
        let err = consumer.process_batch(batch).await.unwrap_err();

        assert_eq!(err.failed_ids(), vec![doomed.as_str()]);
        assert!(matches!(err.failures[0].error, ProcessingError::Aborted(_)));
        assert_eq!(queue.acknowledged().await, vec![healthy]);
        assert_eq!(queue.visibility_resets().await, vec![(doomed.clone(), Duration::ZERO)]);

        // Nothing is left stranded in flight
        assert_eq!(queue.in_flight().await, 0);
        let redelivered = queue.receive_batch(10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].message_id, doomed);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (router, _) = stub_router();
        let queue = Arc::new(InMemoryQueue::new());
        let consumer = Arc::new(BatchConsumer::new(Arc::new(router), queue.clone()).with_batch_size(2));

        for _ in 0..5 {
            queue.push(task("ok")).await;
        }

        let shutdown = ShutdownSignal::new();
        let running = {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while queue.acknowledged().await.len() < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok());

        shutdown.trigger();
        let stats = running.await.unwrap();
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.batches, 3);
    }
}
