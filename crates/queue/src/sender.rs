//! Background batch sender for the outbound queue.
//!
//! Items are serialized on [`BatchSender::add`] and handed to a single
//! background loop that groups them with a [`MicroBatcher`]. A batch goes
//! out as soon as it reaches `max_batch` entries, or on the first tick after
//! the buffer has been idle for `idle`. [`BatchSender::flush`] closes the
//! intake, sends whatever is left, and reports totals.
//!
//! Entries the provider refuses are logged with their code and message and
//! counted in [`FlushReport::failed`]. They are never retried.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use cobalt_core::config::{IngestConfig, MAX_SEND_BATCH};

use crate::batcher::MicroBatcher;
use crate::error::QueueError;
use crate::producer::{OutboundEntry, QueueProducer};

/// Size and timing thresholds for outbound batches.
#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    pub max_batch: usize,
    pub idle: Duration,
    pub tick: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch: MAX_SEND_BATCH,
            idle: Duration::from_secs(10),
            tick: Duration::from_secs(1),
        }
    }
}

impl BatchPolicy {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            max_batch: config.batch_max.clamp(1, MAX_SEND_BATCH),
            idle: Duration::from_millis(config.batch_idle_ms),
            tick: Duration::from_millis(config.batch_tick_ms.max(1)),
        }
    }
}

/// Totals for one sender's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries the provider accepted.
    pub sent: usize,
    /// Entries refused or lost to a failed send call.
    pub failed: usize,
    /// Send calls made.
    pub batches: usize,
}

pub struct BatchSender {
    tx: mpsc::Sender<OutboundEntry>,
    handle: JoinHandle<FlushReport>,
}

impl BatchSender {
    /// Start the background send loop on the current runtime.
    pub fn spawn(producer: Arc<dyn QueueProducer>, policy: BatchPolicy) -> Self {
        let (tx, rx) = mpsc::channel(policy.max_batch.max(1) * 4);
        let handle = tokio::spawn(run(producer, policy, rx));
        Self { tx, handle }
    }

    /// Queue one item for sending.
    pub async fn add<T: Serialize>(&self, item: &T) -> Result<(), QueueError> {
        let body = serde_json::to_string(item).map_err(|e| QueueError::Parse(e.to_string()))?;
        let entry = OutboundEntry {
            id: Uuid::new_v4().simple().to_string(),
            body,
        };
        self.tx.send(entry).await.map_err(|_| QueueError::Closed)
    }

    /// Send everything still buffered and wait for the loop to finish.
    pub async fn flush(self) -> Result<FlushReport, QueueError> {
        drop(self.tx);
        self.handle
            .await
            .map_err(|e| QueueError::Provider(format!("batch sender task failed: {e}")))
    }
}

async fn run(
    producer: Arc<dyn QueueProducer>,
    policy: BatchPolicy,
    mut rx: mpsc::Receiver<OutboundEntry>,
) -> FlushReport {
    let mut batcher = MicroBatcher::new(policy.max_batch, policy.idle);
    let mut ticker = tokio::time::interval(policy.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut report = FlushReport::default();

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(entry) => {
                    batcher.push(entry);
                    if batcher.is_full() {
                        send(producer.as_ref(), batcher.flush(), &mut report).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if let Some(batch) = batcher.try_flush() {
                    debug!(count = batch.len(), "Outbound batch idle, sending");
                    send(producer.as_ref(), batch, &mut report).await;
                }
            }
        }
    }

    let rest = batcher.flush();
    for chunk in rest.chunks(policy.max_batch.max(1)) {
        send(producer.as_ref(), chunk.to_vec(), &mut report).await;
    }
    report
}

async fn send(producer: &dyn QueueProducer, batch: Vec<OutboundEntry>, report: &mut FlushReport) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    report.batches += 1;
    match producer.send_batch(batch).await {
        Ok(outcome) => {
            report.sent += outcome.sent;
            report.failed += outcome.failed.len();
            for failed in &outcome.failed {
                warn!(
                    id = %failed.id,
                    "Outbound entry refused. Code: {}, Message: {}",
                    failed.code, failed.message
                );
            }
            debug!(sent = outcome.sent, failed = outcome.failed.len(), "Outbound batch sent");
        }
        Err(e) => {
            report.failed += count;
            warn!(count, error = %e, "Outbound batch send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryQueue;

    #[derive(Serialize)]
    struct Item {
        n: usize,
    }

    fn sender(queue: &Arc<InMemoryQueue>) -> BatchSender {
        BatchSender::spawn(queue.clone(), BatchPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_goes_out_immediately() {
        let queue = Arc::new(InMemoryQueue::new());
        let sender = sender(&queue);
        for n in 0..10 {
            sender.add(&Item { n }).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let batches = queue.sent_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 10);

        let report = sender.flush().await.unwrap();
        assert_eq!(report, FlushReport { sent: 10, failed: 0, batches: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn idle_buffer_is_sent_once() {
        let queue = Arc::new(InMemoryQueue::new());
        let sender = sender(&queue);
        for n in 0..3 {
            sender.add(&Item { n }).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(queue.sent_batches().is_empty());

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(queue.sent_batches().len(), 1);

        let report = sender.flush().await.unwrap();
        assert_eq!(report.sent, 3);
        assert_eq!(queue.sent_batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_sends_partial_batch() {
        let queue = Arc::new(InMemoryQueue::new());
        let sender = sender(&queue);
        for n in 0..13 {
            sender.add(&Item { n }).await.unwrap();
        }
        let report = sender.flush().await.unwrap();
        assert_eq!(report.sent, 13);
        assert_eq!(report.batches, 2);
        let sizes: Vec<usize> = queue.sent_batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_flush_makes_no_send_call() {
        let queue = Arc::new(InMemoryQueue::new());
        let report = sender(&queue).flush().await.unwrap();
        assert_eq!(report, FlushReport::default());
        assert!(queue.sent_batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refused_entries_are_counted_not_retried() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.reject_next_entries(2);
        let sender = sender(&queue);
        for n in 0..4 {
            sender.add(&Item { n }).await.unwrap();
        }
        let report = sender.flush().await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(queue.sent_bodies(), vec![r#"{"n":2}"#, r#"{"n":3}"#]);
    }
}
