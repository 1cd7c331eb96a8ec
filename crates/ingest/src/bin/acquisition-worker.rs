//! acquisition-worker — polls archive notifications and publishes work items.
//!
//! Pipeline flow: inbound SQS → fetch archive → store entries → pair
//! metadata with content → outbound SQS
//!
//! Runs until SIGINT/SIGTERM, or until the inbound queue is empty with
//! `--drain`. In-flight archives are always finished before exit.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use cobalt_core::config::load_dotenv;
use cobalt_core::Config;
use cobalt_ingest::{
    Dispatcher, DispatcherOptions, ReportLog, SourceRegistry, StatsAggregator, TaskContext,
};
use cobalt_queue::sqs::sqs_client;
use cobalt_queue::{BatchPolicy, QueueConsumer, SqsConsumer, SqsProducer};
use cobalt_storage::BucketStorage;

// ── CLI ─────────────────────────────────────────────────────────────

/// Archive acquisition worker.
#[derive(Parser, Debug)]
#[command(name = "acquisition-worker", version, about)]
struct Cli {
    /// Config profile; keys are looked up as `<PROFILE>_<KEY>` first.
    #[arg(long, env = "COBALT_PROFILE", default_value = "")]
    profile: String,

    /// Archives processed concurrently.
    #[arg(long)]
    workers: Option<usize>,

    /// Bucket that receives unpacked entries.
    #[arg(long)]
    processed_bucket: Option<String>,

    /// Inbound queue name or URL.
    #[arg(long)]
    inbound_queue: Option<String>,

    /// Outbound queue name or URL.
    #[arg(long)]
    outbound_queue: Option<String>,

    #[arg(long)]
    region: Option<String>,

    /// Report log path (appended to).
    #[arg(long)]
    report: Option<PathBuf>,

    /// Exit once the inbound queue is empty.
    #[arg(long)]
    drain: bool,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(workers) = self.workers {
            config.ingest.workers = workers;
        }
        if let Some(bucket) = self.processed_bucket {
            config.storage.processed_bucket = bucket;
        }
        if let Some(queue) = self.inbound_queue {
            config.queue.inbound = queue;
        }
        if let Some(queue) = self.outbound_queue {
            config.queue.outbound = queue;
        }
        if let Some(region) = self.region {
            config.aws.region = region;
        }
        if let Some(report) = self.report {
            config.ingest.report_path = report;
        }
        if self.drain {
            config.ingest.stop_when_idle = true;
        }
    }
}

// ── Shutdown ────────────────────────────────────────────────────────

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C elsewhere.
async fn os_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn spawn_signal_watch() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match os_signal().await {
            Ok(()) => {
                info!("shutdown signal received, finishing in-flight archives");
                let _ = tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "cannot listen for shutdown signals");
                // The sender stays alive here, so the dispatcher keeps running.
                std::future::pending::<()>().await
            }
        }
    });
    rx
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let mut config = Config::for_profile(&cli.profile);
    cli.apply(&mut config);
    config.validate()?;
    config.log_summary();

    let storage = Arc::new(BucketStorage::from_config(&config)?);
    info!(backend = storage.backend().name(), "storage ready");

    let client = sqs_client(&config.aws).await;
    let consumer = Arc::new(SqsConsumer::new(client.clone(), &config.queue).await?);
    match consumer.health_check().await {
        Ok(health) => info!(%health, "inbound queue reachable"),
        Err(e) => warn!(error = %e, "inbound queue health check failed"),
    }
    let producer = Arc::new(SqsProducer::new(client, &config.queue).await?);

    let report = ReportLog::open(&config.ingest.report_path).await?;
    info!(path = %report.path().display(), "report log opened");
    let stats = StatsAggregator::spawn(report);

    let context = Arc::new(TaskContext {
        storage,
        consumer,
        producer,
        stats: stats.handle(),
        processed_bucket: config.storage.processed_bucket.clone(),
        batch_policy: BatchPolicy::from_config(&config.ingest),
    });
    let registry = SourceRegistry::builtin();
    info!(sources = ?registry.tags().collect::<Vec<_>>(), "sources registered");

    let dispatcher = Dispatcher::new(registry, context, DispatcherOptions::from_config(&config));
    let dispatched = dispatcher.run(spawn_signal_watch()).await;
    drop(dispatcher);

    let summary = stats.finish().await?;
    info!(
        received = dispatched.received,
        acknowledged = dispatched.acknowledged,
        failed = dispatched.failed,
        released = dispatched.released,
        archives = summary.archives,
        pairs = summary.pairs,
        sent = summary.total_sent(),
        "acquisition-worker exited cleanly"
    );
    Ok(())
}
