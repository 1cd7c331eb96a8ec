//! Inbound polling loop.
//!
//! The dispatcher polls the inbound queue, decodes each message, routes it
//! to the strategy registered for its source tag and starts one task per
//! notification on a bounded [`WorkerPool`]. When every slot is taken it
//! stops polling until one frees up.
//!
//! Shutdown is cooperative: once the watch channel flips to `true` no new
//! messages are pulled, messages already polled but not started are handed
//! back to the queue, and `run` returns after every running task finished.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use cobalt_core::{CobaltError, Config, InboundNotification};
use cobalt_queue::QueueMessage;

use crate::error::IngestError;
use crate::pool::WorkerPool;
use crate::source::{SourceRegistry, SourceStrategy};
use crate::task::{process_notification, TaskContext, TaskOutcome};

const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Maximum number of notifications processed at once.
    pub workers: usize,
    /// Messages requested per poll.
    pub poll_batch: u32,
    /// Return after the first poll that comes back empty.
    pub stop_when_idle: bool,
    /// First delay after a failed poll. Doubles up to 30s.
    pub poll_backoff: Duration,
    /// Delay after an empty poll when not draining.
    pub idle_pause: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_batch: 1,
            stop_when_idle: false,
            poll_backoff: Duration::from_secs(1),
            idle_pause: Duration::from_millis(250),
        }
    }
}

impl DispatcherOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.ingest.workers,
            poll_batch: config.queue.poll_batch,
            stop_when_idle: config.ingest.stop_when_idle,
            ..Self::default()
        }
    }
}

/// Counters for one `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub received: usize,
    pub dispatched: usize,
    pub malformed: usize,
    pub unknown_source: usize,
    pub acknowledged: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Polled but handed back to the queue at shutdown.
    pub released: usize,
}

impl DispatchSummary {
    fn record(&mut self, result: Result<TaskOutcome, JoinError>) {
        match result {
            Ok(TaskOutcome::Acknowledged { .. }) => self.acknowledged += 1,
            Ok(TaskOutcome::Skipped) => self.skipped += 1,
            Ok(TaskOutcome::Failed) => self.failed += 1,
            Err(e) => {
                error!(error = %e, "Archive task panicked");
                self.failed += 1;
            }
        }
    }
}

pub struct Dispatcher {
    registry: SourceRegistry,
    context: Arc<TaskContext>,
    options: DispatcherOptions,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Messages are polled from `context.consumer`.
    pub fn new(registry: SourceRegistry, context: Arc<TaskContext>, options: DispatcherOptions) -> Self {
        Self {
            registry,
            context,
            options,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> DispatchSummary {
        let mut pool = WorkerPool::with_counter(self.options.workers, self.in_flight.clone());
        let mut summary = DispatchSummary::default();
        let mut backoff = self.options.poll_backoff;

        info!(
            workers = pool.capacity(),
            poll_batch = self.options.poll_batch,
            drain = self.options.stop_when_idle,
            "Dispatcher started"
        );

        'poll: loop {
            for result in pool.reap() {
                summary.record(result);
            }
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                polled = self.context.consumer.poll_batch(self.options.poll_batch) => polled,
            };

            let messages = match polled {
                Ok(messages) => {
                    backoff = self.options.poll_backoff;
                    messages
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?backoff, "Poll failed");
                    tokio::select! {
                        biased;
                        _ = stopped(&mut shutdown) => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_POLL_BACKOFF);
                    continue;
                }
            };

            if messages.is_empty() {
                if self.options.stop_when_idle {
                    info!("Inbound queue is empty, draining");
                    break;
                }
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => break,
                    _ = tokio::time::sleep(self.options.idle_pause) => {}
                }
                continue;
            }

            summary.received += messages.len();
            let mut pending = messages.into_iter();
            while let Some(message) = pending.next() {
                let Some((strategy, notification)) = self.route(&message, &mut summary) else {
                    continue;
                };

                let slot = tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => None,
                    slot = pool.acquire() => slot.ok(),
                };
                let Some(slot) = slot else {
                    self.release(std::iter::once(message).chain(pending), &mut summary)
                        .await;
                    break 'poll;
                };

                summary.dispatched += 1;
                pool.spawn(
                    slot,
                    process_notification(
                        self.context.clone(),
                        strategy,
                        notification,
                        message.receipt_handle,
                    ),
                );
            }
        }

        info!(in_flight = self.in_flight(), "Waiting for running tasks");
        for result in pool.join().await {
            summary.record(result);
        }
        info!(?summary, "Dispatcher stopped");
        summary
    }

    /// Decode a message and find its strategy. Messages that cannot be
    /// routed are left on the queue untouched.
    fn route(
        &self,
        message: &QueueMessage,
        summary: &mut DispatchSummary,
    ) -> Option<(Arc<dyn SourceStrategy>, InboundNotification)> {
        let notification = match InboundNotification::parse(&message.body) {
            Ok(notification) => notification,
            Err(e) => {
                let e = match e {
                    CobaltError::MalformedNotification(reason) => {
                        IngestError::MalformedNotification(reason)
                    }
                    other => IngestError::MalformedNotification(other.to_string()),
                };
                warn!(message_id = %message.id, error = %e, "Skipping message");
                summary.malformed += 1;
                return None;
            }
        };

        let tag = notification.source_tag().unwrap_or_default();
        match self.registry.get(tag) {
            Some(strategy) => Some((strategy, notification)),
            None => {
                let e = IngestError::UnknownSource(tag.to_string());
                warn!(
                    message_id = %message.id,
                    bucket = %notification.bucket,
                    key = %notification.key,
                    size = notification.size,
                    error = %e,
                    "Skipping message"
                );
                summary.unknown_source += 1;
                None
            }
        }
    }

    async fn release(
        &self,
        messages: impl Iterator<Item = QueueMessage>,
        summary: &mut DispatchSummary,
    ) {
        for message in messages {
            match self.context.consumer.nack(&message.receipt_handle).await {
                Ok(()) => summary.released += 1,
                Err(e) => warn!(message_id = %message.id, error = %e, "Release failed"),
            }
        }
    }
}

/// Resolves once shutdown was requested. A dropped sender never resolves.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
