pub mod batcher;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod producer;
pub mod sender;
pub mod sqs;

pub use batcher::MicroBatcher;
pub use consumer::{QueueConsumer, QueueHealth, QueueMessage};
pub use error::QueueError;
pub use memory::InMemoryQueue;
pub use producer::{BatchOutcome, FailedEntry, OutboundEntry, QueueProducer};
pub use sender::{BatchPolicy, BatchSender, FlushReport};
pub use sqs::{SqsConsumer, SqsProducer};
