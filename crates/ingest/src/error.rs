//! Ingest error types.

use thiserror::Error;

use cobalt_queue::QueueError;
use cobalt_storage::StorageError;

use crate::archive::ArchiveError;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed notification: {0}")]
    MalformedNotification(String),

    #[error("no strategy registered for source '{0}'")]
    UnknownSource(String),

    #[error("cannot fetch {bucket}/{key}: {source}")]
    Fetch {
        bucket: String,
        key: String,
        source: StorageError,
    },

    #[error("cannot open archive {key}: {source}")]
    ArchiveOpen { key: String, source: ArchiveError },

    #[error("archive read failed: {0}")]
    EntryRead(#[source] ArchiveError),

    #[error("upload of {key} failed: {source}")]
    Upload { key: String, source: StorageError },

    #[error("outbound send failed: {0}")]
    Send(String),

    #[error("ack failed: {0}")]
    Ack(#[source] QueueError),

    #[error("stats aggregator is not running")]
    StatsClosed,
}

