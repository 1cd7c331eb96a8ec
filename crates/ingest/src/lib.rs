//! Archive acquisition engine.
//!
//! Polls storage notifications, unpacks each archive, stores every entry in
//! the processed bucket and pairs metadata with content. Completed pairs are
//! published as work items on the outbound queue.

pub mod archive;
pub mod dispatcher;
pub mod error;
pub mod keys;
pub mod pairing;
pub mod pool;
pub mod source;
pub mod stats;
pub mod task;

pub use archive::{ArchiveEntry, ArchiveError, ArchiveFormat, EntryStream};
pub use dispatcher::{DispatchSummary, Dispatcher, DispatcherOptions};
pub use error::IngestError;
pub use keys::KeyRule;
pub use pairing::{Pair, ReconcileOutcome, Reconciler};
pub use pool::WorkerPool;
pub use source::{ArchiveSource, EntryKind, OutputLayout, PairedArchiveSource, SourceRegistry, SourceStrategy};
pub use stats::{ReportLog, StatsAggregator, StatsEvent, StatsHandle, StatsSummary};
pub use task::{process_notification, TaskContext, TaskOutcome};
