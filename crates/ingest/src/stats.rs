//! Run statistics and the report log.
//!
//! Every task reports through a cloneable [`StatsHandle`]. A single
//! aggregator task owns all counters and the report file: problem file names
//! are appended as they arrive, and one summary block is written when
//! [`StatsAggregator::finish`] is called. Events and the finish request
//! share one ordered channel, so everything emitted before `finish` is
//! counted.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::IngestError;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsEvent {
    ArchiveSeen,
    MetaSeen,
    ContentSeen,
    OtherSeen,
    PairCompleted,
    PairMissingMeta,
    PairMissingContent,
    /// `<archive name>/<object key>` of an unpaired half.
    ProblemFilename(String),
    /// Work items sent for one archive.
    SourceSent { source: String, count: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub archives: u64,
    pub meta: u64,
    pub content: u64,
    pub other: u64,
    pub pairs: u64,
    pub missing_meta: u64,
    pub missing_content: u64,
    pub problem_files: u64,
    pub sent_by_source: BTreeMap<String, u64>,
}

impl StatsSummary {
    fn apply(&mut self, event: &StatsEvent) {
        match event {
            StatsEvent::ArchiveSeen => self.archives += 1,
            StatsEvent::MetaSeen => self.meta += 1,
            StatsEvent::ContentSeen => self.content += 1,
            StatsEvent::OtherSeen => self.other += 1,
            StatsEvent::PairCompleted => self.pairs += 1,
            StatsEvent::PairMissingMeta => self.missing_meta += 1,
            StatsEvent::PairMissingContent => self.missing_content += 1,
            StatsEvent::ProblemFilename(_) => self.problem_files += 1,
            StatsEvent::SourceSent { source, count } => {
                *self.sent_by_source.entry(source.clone()).or_insert(0) += *count as u64;
            }
        }
    }

    pub fn total_sent(&self) -> u64 {
        self.sent_by_source.values().sum()
    }
}

impl fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Archives        : {}", self.archives)?;
        writeln!(f, "Meta            : {}", self.meta)?;
        writeln!(f, "Content         : {}", self.content)?;
        writeln!(f, "Other           : {}", self.other)?;
        writeln!(f, "Pairs           : {}", self.pairs)?;
        writeln!(f, "Missing meta    : {}", self.missing_meta)?;
        writeln!(f, "Missing content : {}", self.missing_content)?;
        writeln!(f, "Problem files   : {}", self.problem_files)?;
        for (source, sent) in &self.sent_by_source {
            writeln!(f, "{source}: {sent}")?;
        }
        Ok(())
    }
}

/// Append-only report file.
pub struct ReportLog {
    file: tokio::fs::File,
    path: PathBuf,
}

impl ReportLog {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&mut self, text: &str) -> std::io::Result<()> {
        self.file.write_all(text.as_bytes()).await?;
        self.file.flush().await
    }
}

enum Command {
    Event(StatsEvent),
    Finish(oneshot::Sender<StatsSummary>),
}

/// Cloneable sender side of the aggregator.
#[derive(Clone)]
pub struct StatsHandle {
    tx: mpsc::Sender<Command>,
}

impl StatsHandle {
    pub async fn emit(&self, event: StatsEvent) {
        if self.tx.send(Command::Event(event)).await.is_err() {
            debug!("Stats aggregator finished, event dropped");
        }
    }
}

pub struct StatsAggregator {
    tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl StatsAggregator {
    pub fn spawn(report: ReportLog) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(run(report, rx));
        Self { tx, task }
    }

    pub fn handle(&self) -> StatsHandle {
        StatsHandle {
            tx: self.tx.clone(),
        }
    }

    /// Write the summary block and return the final counters.
    pub async fn finish(self) -> Result<StatsSummary, IngestError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Finish(reply_tx))
            .await
            .map_err(|_| IngestError::StatsClosed)?;
        let summary = reply_rx.await.map_err(|_| IngestError::StatsClosed)?;
        let _ = self.task.await;
        Ok(summary)
    }
}

async fn run(mut report: ReportLog, mut rx: mpsc::Receiver<Command>) {
    let mut summary = StatsSummary::default();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Event(event) => {
                if let StatsEvent::ProblemFilename(name) = &event {
                    if let Err(e) = report.write(&format!("{name}\n")).await {
                        warn!(path = %report.path().display(), error = %e, "Report write failed");
                    }
                }
                summary.apply(&event);
            }
            Command::Finish(reply) => {
                if let Err(e) = report.write(&format!("\n{summary}")).await {
                    warn!(path = %report.path().display(), error = %e, "Report summary write failed");
                }
                for (source, sent) in &summary.sent_by_source {
                    info!(source = %source, sent, "Work items sent");
                }
                let _ = reply.send(summary);
                return;
            }
        }
    }
}
