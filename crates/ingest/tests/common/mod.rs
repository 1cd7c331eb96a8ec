//! Shared fixtures: an in-memory pipeline and archive builders.

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::watch;

use cobalt_core::WorkItem;
use cobalt_ingest::{
    DispatchSummary, Dispatcher, DispatcherOptions, ReportLog, SourceRegistry, StatsAggregator,
    StatsSummary, TaskContext,
};
use cobalt_queue::{BatchPolicy, InMemoryQueue};
use cobalt_storage::{BucketStorage, ObjectStorage};

pub const RAW_BUCKET: &str = "raw";
pub const PROCESSED_BUCKET: &str = "processed";

// ── Archives ────────────────────────────────────────────────────────

pub fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *body).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn tar_gz_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&tar_bytes(files)).unwrap();
    enc.finish().unwrap()
}

pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, body) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// S3 event body for one object in the raw bucket.
pub fn s3_event(key: &str, size: u64) -> String {
    serde_json::json!({
        "Records": [{
            "s3": {
                "bucket": { "name": RAW_BUCKET },
                "object": { "key": key, "size": size }
            }
        }]
    })
    .to_string()
}

// ── Pipeline ────────────────────────────────────────────────────────

/// Inbound and outbound queues, storage and a report file, all in process.
pub struct Pipeline {
    pub inbound: Arc<InMemoryQueue>,
    pub outbound: Arc<InMemoryQueue>,
    pub storage: Arc<BucketStorage>,
    pub report_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl Pipeline {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            inbound: Arc::new(InMemoryQueue::new()),
            outbound: Arc::new(InMemoryQueue::new()),
            storage: Arc::new(BucketStorage::memory()),
            report_path: dir.path().join("report.log"),
            _dir: dir,
        }
    }

    /// Store an archive in the raw bucket and queue its notification.
    pub async fn drop_archive(&self, key: &str, bytes: Vec<u8>) -> String {
        let size = bytes.len() as u64;
        self.storage
            .put(RAW_BUCKET, key, Bytes::from(bytes))
            .await
            .unwrap();
        self.inbound.push(s3_event(key, size))
    }

    pub async fn stats(&self) -> StatsAggregator {
        StatsAggregator::spawn(ReportLog::open(&self.report_path).await.unwrap())
    }

    pub fn dispatcher(
        &self,
        registry: SourceRegistry,
        stats: &StatsAggregator,
        options: DispatcherOptions,
    ) -> Dispatcher {
        let context = Arc::new(TaskContext {
            storage: self.storage.clone(),
            consumer: self.inbound.clone(),
            producer: self.outbound.clone(),
            stats: stats.handle(),
            processed_bucket: PROCESSED_BUCKET.into(),
            batch_policy: BatchPolicy::default(),
        });
        Dispatcher::new(registry, context, options)
    }

    /// Process everything queued, then stop.
    pub async fn drain(&self, registry: SourceRegistry) -> (DispatchSummary, StatsSummary) {
        let stats = self.stats().await;
        let dispatcher = self.dispatcher(registry, &stats, drain_options(2));
        let (_tx, rx) = watch::channel(false);
        let dispatched = tokio::time::timeout(Duration::from_secs(10), dispatcher.run(rx))
            .await
            .unwrap();
        (dispatched, stats.finish().await.unwrap())
    }

    pub fn work_items(&self) -> Vec<WorkItem> {
        self.outbound
            .sent_bodies()
            .iter()
            .map(|body| serde_json::from_str(body).unwrap())
            .collect()
    }

    pub async fn processed(&self, key: &str) -> Vec<u8> {
        self.storage
            .get(PROCESSED_BUCKET, key)
            .await
            .unwrap()
            .into_bytes()
            .unwrap()
    }

    pub fn report(&self) -> String {
        std::fs::read_to_string(&self.report_path).unwrap_or_default()
    }
}

pub fn drain_options(workers: usize) -> DispatcherOptions {
    DispatcherOptions {
        workers,
        poll_batch: 10,
        stop_when_idle: true,
        poll_backoff: Duration::from_millis(10),
        idle_pause: Duration::from_millis(10),
    }
}
