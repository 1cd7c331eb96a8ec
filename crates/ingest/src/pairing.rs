//! Pairing reconciler.
//!
//! Walks an archive's entries once. Every entry is stored in the processed
//! bucket first (`.xml` objects gzip-compressed with a `.gz` suffix), then
//! metadata and content entries are grouped by canonical key. Once the
//! archive is exhausted, each complete pair becomes one [`WorkItem`] on the
//! outbound sender; incomplete pairs are reported as problem files.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, warn};

use cobalt_core::{InboundNotification, WorkItem};
use cobalt_queue::BatchSender;
use cobalt_storage::{gzip, ObjectStorage};

use crate::archive::{ArchiveEntry, EntryStream};
use crate::error::IngestError;
use crate::source::{EntryKind, SourceStrategy};
use crate::stats::{StatsEvent, StatsHandle};

/// Stored object keys of the two halves sharing one canonical key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pair {
    pub meta_ref: Option<String>,
    pub content_ref: Option<String>,
}

impl Pair {
    pub fn is_complete(&self) -> bool {
        self.meta_ref.is_some() && self.content_ref.is_some()
    }

    /// Record one half. A later entry for the same half replaces the earlier.
    fn set(&mut self, kind: EntryKind, stored_key: String) {
        match kind {
            EntryKind::Meta => self.meta_ref = Some(stored_key),
            EntryKind::Content => self.content_ref = Some(stored_key),
            EntryKind::Other => {}
        }
    }
}

/// What one archive produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub entries: usize,
    pub stored: usize,
    pub completed: usize,
    pub incomplete: usize,
}

pub struct Reconciler<'a> {
    pub strategy: &'a dyn SourceStrategy,
    pub storage: &'a dyn ObjectStorage,
    pub stats: &'a StatsHandle,
    pub processed_bucket: &'a str,
}

impl Reconciler<'_> {
    pub async fn reconcile(
        &self,
        archive: &InboundNotification,
        mut entries: EntryStream,
        sender: &BatchSender,
    ) -> Result<ReconcileOutcome, IngestError> {
        let mut pairs: BTreeMap<String, Pair> = BTreeMap::new();
        let mut outcome = ReconcileOutcome::default();

        while let Some(next) = entries.next().await {
            outcome.entries += 1;
            let entry = match next {
                Ok(entry) => entry,
                Err(e) if e.is_fatal() => return Err(IngestError::EntryRead(e)),
                Err(e) => {
                    warn!(bucket = %archive.bucket, key = %archive.key, error = %e, "Skipping unreadable entry");
                    self.stats.emit(StatsEvent::OtherSeen).await;
                    continue;
                }
            };

            let canonical = self.strategy.derive_key(&entry.name);
            let Some(stored_key) = self.store(archive, &entry, canonical.as_deref()).await else {
                self.stats.emit(StatsEvent::OtherSeen).await;
                continue;
            };
            outcome.stored += 1;

            let kind = self.strategy.classify(&entry);
            if kind == EntryKind::Other {
                self.stats.emit(StatsEvent::OtherSeen).await;
                continue;
            }

            // Keyless halves are stored but neither counted nor paired.
            let Some(key) = canonical else {
                warn!(
                    key = %archive.key,
                    entry = %entry.name,
                    "Cannot derive canonical key, entry left unpaired"
                );
                continue;
            };
            self.stats
                .emit(match kind {
                    EntryKind::Meta => StatsEvent::MetaSeen,
                    _ => StatsEvent::ContentSeen,
                })
                .await;
            pairs.entry(key).or_default().set(kind, stored_key);
        }

        let archive_name = archive.file_name();
        let source = self.strategy.tag();
        for (key, pair) in pairs {
            match (pair.meta_ref, pair.content_ref) {
                (Some(meta), Some(content)) => {
                    let item = WorkItem {
                        source: source.to_string(),
                        bucket: self.processed_bucket.to_string(),
                        key: content,
                        meta_key: Some(meta),
                    };
                    sender
                        .add(&item)
                        .await
                        .map_err(|e| IngestError::Send(e.to_string()))?;
                    self.stats.emit(StatsEvent::PairCompleted).await;
                    outcome.completed += 1;
                }
                (None, Some(content)) => {
                    debug!(canonical = %key, "Content without metadata");
                    self.stats.emit(StatsEvent::PairMissingMeta).await;
                    self.stats
                        .emit(StatsEvent::ProblemFilename(format!("{archive_name}/{content}")))
                        .await;
                    outcome.incomplete += 1;
                }
                (Some(meta), None) => {
                    debug!(canonical = %key, "Metadata without content");
                    self.stats.emit(StatsEvent::PairMissingContent).await;
                    self.stats
                        .emit(StatsEvent::ProblemFilename(format!("{archive_name}/{meta}")))
                        .await;
                    outcome.incomplete += 1;
                }
                (None, None) => {}
            }
        }

        self.stats
            .emit(StatsEvent::SourceSent {
                source: source.to_string(),
                count: outcome.completed,
            })
            .await;

        Ok(outcome)
    }

    /// Upload one entry. Returns the stored key, or `None` if the entry was
    /// skipped or the upload failed.
    async fn store(
        &self,
        archive: &InboundNotification,
        entry: &ArchiveEntry,
        canonical: Option<&str>,
    ) -> Option<String> {
        let Some(key) = self.strategy.output_key(archive, entry, canonical) else {
            warn!(key = %archive.key, entry = %entry.name, "No output key for entry, skipping");
            return None;
        };

        let (key, body) = if key.ends_with(".xml") {
            match gzip(&entry.body) {
                Ok(packed) => (format!("{key}.gz"), packed),
                Err(e) => {
                    warn!(key = %key, error = %e, "Compression failed, skipping entry");
                    return None;
                }
            }
        } else {
            (key, Bytes::clone(&entry.body))
        };

        match self.storage.put(self.processed_bucket, &key, body).await {
            Ok(()) => Some(key),
            Err(source) => {
                let e = IngestError::Upload { key, source };
                warn!(
                    bucket = %archive.bucket,
                    archive = %archive.key,
                    size = archive.size,
                    error = %e,
                    "Upload failed, skipping entry"
                );
                None
            }
        }
    }
}
