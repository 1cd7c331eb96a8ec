//! Processing of one inbound notification.
//!
//! A task opens the archive, reconciles it into work items on its own batch
//! sender, flushes that sender, and only then acknowledges the inbound
//! message. Any failure leaves the message unacknowledged so the queue
//! redelivers it after its visibility timeout.

use std::sync::Arc;

use tracing::{error, info};

use cobalt_core::InboundNotification;
use cobalt_queue::{BatchPolicy, BatchSender, QueueConsumer, QueueProducer};
use cobalt_storage::ObjectStorage;

use crate::error::IngestError;
use crate::pairing::Reconciler;
use crate::source::SourceStrategy;
use crate::stats::{StatsEvent, StatsHandle};

/// Shared dependencies of every task.
pub struct TaskContext {
    pub storage: Arc<dyn ObjectStorage>,
    pub consumer: Arc<dyn QueueConsumer>,
    pub producer: Arc<dyn QueueProducer>,
    pub stats: StatsHandle,
    pub processed_bucket: String,
    pub batch_policy: BatchPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Work items handed off and the message deleted.
    Acknowledged { completed: usize },
    /// Not work for this source; the message was deleted untouched.
    Skipped,
    /// Left on the queue for redelivery.
    Failed,
}

pub async fn process_notification(
    ctx: Arc<TaskContext>,
    strategy: Arc<dyn SourceStrategy>,
    notification: InboundNotification,
    receipt: String,
) -> TaskOutcome {
    match run(&ctx, strategy.as_ref(), &notification, &receipt).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                source = %strategy.tag(),
                bucket = %notification.bucket,
                key = %notification.key,
                size = notification.size,
                error = %e,
                "Archive task failed"
            );
            TaskOutcome::Failed
        }
    }
}

async fn run(
    ctx: &TaskContext,
    strategy: &dyn SourceStrategy,
    notification: &InboundNotification,
    receipt: &str,
) -> Result<TaskOutcome, IngestError> {
    if !strategy.accepts(notification) {
        info!(source = %strategy.tag(), key = %notification.key, "Not an archive for this source, skipping");
        ctx.consumer.ack(receipt).await.map_err(IngestError::Ack)?;
        return Ok(TaskOutcome::Skipped);
    }

    ctx.stats.emit(StatsEvent::ArchiveSeen).await;
    info!(
        source = %strategy.tag(),
        bucket = %notification.bucket,
        key = %notification.key,
        size = notification.size,
        "Processing archive"
    );

    let entries = strategy.open_archive(ctx.storage.as_ref(), notification).await?;

    let sender = BatchSender::spawn(ctx.producer.clone(), ctx.batch_policy);
    let reconciler = Reconciler {
        strategy,
        storage: ctx.storage.as_ref(),
        stats: &ctx.stats,
        processed_bucket: &ctx.processed_bucket,
    };
    let reconciled = reconciler.reconcile(notification, entries, &sender).await;

    // Flush even when reconciliation failed so the sender loop shuts down.
    let report = sender
        .flush()
        .await
        .map_err(|e| IngestError::Send(e.to_string()))?;
    let outcome = reconciled?;

    if report.failed > 0 {
        return Err(IngestError::Send(format!(
            "{} of {} work items were not accepted",
            report.failed,
            report.sent + report.failed
        )));
    }

    ctx.consumer.ack(receipt).await.map_err(IngestError::Ack)?;
    info!(
        source = %strategy.tag(),
        key = %notification.key,
        entries = outcome.entries,
        pairs = outcome.completed,
        unpaired = outcome.incomplete,
        "Archive done"
    );
    Ok(TaskOutcome::Acknowledged {
        completed: outcome.completed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;

    use cobalt_core::WorkItem;
    use cobalt_queue::InMemoryQueue;
    use cobalt_storage::{Blob, BucketStorage, StorageError};

    use crate::archive::tests::{gzip_bytes, tar_bytes, tar_with_oversized};
    use crate::source::SourceRegistry;
    use crate::stats::{ReportLog, StatsAggregator};

    struct Harness {
        queue: Arc<InMemoryQueue>,
        out: Arc<InMemoryQueue>,
        storage: Arc<BucketStorage>,
        stats: StatsAggregator,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let report = ReportLog::open(dir.path().join("report.log")).await.unwrap();
            Self {
                queue: Arc::new(InMemoryQueue::new()),
                out: Arc::new(InMemoryQueue::new()),
                storage: Arc::new(BucketStorage::memory()),
                stats: StatsAggregator::spawn(report),
                _dir: dir,
            }
        }

        fn context(&self) -> Arc<TaskContext> {
            self.context_with(self.storage.clone())
        }

        fn context_with(&self, storage: Arc<dyn ObjectStorage>) -> Arc<TaskContext> {
            Arc::new(TaskContext {
                storage,
                consumer: self.queue.clone(),
                producer: self.out.clone(),
                stats: self.stats.handle(),
                processed_bucket: "processed".into(),
                batch_policy: BatchPolicy::default(),
            })
        }

        /// Push a message and take delivery of it, returning the receipt.
        async fn deliver(&self) -> String {
            self.queue.push("{}");
            self.queue.poll_batch(1).await.unwrap().remove(0).receipt_handle
        }
    }

    fn notification(key: &str) -> InboundNotification {
        InboundNotification {
            bucket: "raw".into(),
            key: key.into(),
            size: 0,
        }
    }

    async fn run_task(h: &Harness, tag: &str, key: &str) -> TaskOutcome {
        let strategy = SourceRegistry::builtin().get(tag).unwrap();
        let receipt = h.deliver().await;
        process_notification(h.context(), strategy, notification(key), receipt).await
    }

    /// Writes to `refused` fail; everything else reaches the harness storage.
    struct RefusingStorage {
        inner: Arc<BucketStorage>,
        refused: &'static str,
    }

    #[async_trait]
    impl ObjectStorage for RefusingStorage {
        async fn get(&self, bucket: &str, key: &str) -> Result<Blob, StorageError> {
            self.inner.get(bucket, key).await
        }

        async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError> {
            if key == self.refused {
                return Err(StorageError::Io(std::io::Error::other("write refused")));
            }
            self.inner.put(bucket, key, body).await
        }
    }

    #[tokio::test]
    async fn acks_after_items_are_sent() {
        let h = Harness::new().await;
        let tar = tar_bytes(&[("v1/a.xml", b"<a/>"), ("v1/a.pdf", b"%PDF")]);
        h.storage
            .put("raw", "files/bmj/x.tar.gz", Bytes::from(gzip_bytes(&tar)))
            .await
            .unwrap();

        let outcome = run_task(&h, "bmj", "files/bmj/x.tar.gz").await;
        assert_eq!(outcome, TaskOutcome::Acknowledged { completed: 1 });
        assert_eq!(h.queue.acked().len(), 1);
        assert_eq!(h.out.sent_bodies().len(), 1);
    }

    #[tokio::test]
    async fn missing_object_leaves_message_unacked() {
        let h = Harness::new().await;
        let outcome = run_task(&h, "bmj", "files/bmj/gone.tar.gz").await;
        assert_eq!(outcome, TaskOutcome::Failed);
        assert!(h.queue.acked().is_empty());
        assert_eq!(h.queue.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn unopenable_archive_fails_task() {
        let h = Harness::new().await;
        h.storage
            .put("raw", "files/oup/bad.tar", Bytes::from(vec![7u8; 1024]))
            .await
            .unwrap();
        let outcome = run_task(&h, "oup", "files/oup/bad.tar").await;
        assert_eq!(outcome, TaskOutcome::Failed);
        assert!(h.queue.acked().is_empty());
    }

    #[tokio::test]
    async fn refused_work_items_block_the_ack() {
        let h = Harness::new().await;
        let tar = tar_bytes(&[("a.xml", b"<a/>"), ("a.pdf", b"%PDF")]);
        h.storage
            .put("raw", "files/oup/a.tar", Bytes::from(tar))
            .await
            .unwrap();
        h.out.reject_next_entries(1);

        let outcome = run_task(&h, "oup", "files/oup/a.tar").await;
        assert_eq!(outcome, TaskOutcome::Failed);
        assert!(h.queue.acked().is_empty());
    }

    #[tokio::test]
    async fn rejected_notifications_are_acked_as_skipped() {
        let h = Harness::new().await;
        let outcome = run_task(&h, "pnas", "files/pnas/pnas_117_23.pdf.zip").await;
        assert_eq!(outcome, TaskOutcome::Skipped);
        assert_eq!(h.queue.acked().len(), 1);
        let summary = h.stats.finish().await.unwrap();
        assert_eq!(summary.archives, 0);
    }

    #[tokio::test]
    async fn oversized_entry_header_fails_the_task() {
        let h = Harness::new().await;
        let tar = tar_with_oversized(&[("meta/a.xml", b"<a/>")], "a.pdf", 1 << 63);
        h.storage
            .put("raw", "files/oup/big.tar", Bytes::from(tar))
            .await
            .unwrap();

        let outcome = run_task(&h, "oup", "files/oup/big.tar").await;
        assert_eq!(outcome, TaskOutcome::Failed);
        assert!(h.queue.acked().is_empty());
        assert_eq!(h.queue.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn refused_upload_still_acks_the_archive() {
        let h = Harness::new().await;
        let tar = tar_bytes(&[
            ("v1/a.xml", b"<a/>"),
            ("v1/a.pdf", b"%PDF-a"),
            ("v1/b.xml", b"<b/>"),
            ("v1/b.pdf", b"%PDF-b"),
        ]);
        h.storage
            .put("raw", "files/bmj/x.tar.gz", Bytes::from(gzip_bytes(&tar)))
            .await
            .unwrap();
        let storage = Arc::new(RefusingStorage {
            inner: h.storage.clone(),
            refused: "bmj/v1/a.xml.gz",
        });

        let strategy = SourceRegistry::builtin().get("bmj").unwrap();
        let receipt = h.deliver().await;
        let outcome = process_notification(
            h.context_with(storage),
            strategy,
            notification("files/bmj/x.tar.gz"),
            receipt,
        )
        .await;

        assert_eq!(outcome, TaskOutcome::Acknowledged { completed: 1 });
        assert_eq!(h.queue.acked().len(), 1);
        let sent: Vec<WorkItem> = h
            .out
            .sent_bodies()
            .iter()
            .map(|b| serde_json::from_str(b).unwrap())
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key, "bmj/v1/b.pdf");
    }
}
