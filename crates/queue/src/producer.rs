//! Queue producer trait and batch send types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// One message in an outbound batch. `id` only needs to be unique within
/// the batch; providers use it to report per-entry failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEntry {
    pub id: String,
    pub body: String,
}

/// An entry the provider refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEntry {
    pub id: String,
    pub code: String,
    pub message: String,
}

/// Result of one batch send call.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub sent: usize,
    pub failed: Vec<FailedEntry>,
}

/// Sending side of a queue.
#[async_trait]
pub trait QueueProducer: Send + Sync {
    /// Send up to ten entries in one call.
    ///
    /// `Err` means the whole call failed. Partial failures come back as
    /// `Ok` with the refused entries listed in [`BatchOutcome::failed`].
    async fn send_batch(&self, entries: Vec<OutboundEntry>) -> Result<BatchOutcome, QueueError>;
}
