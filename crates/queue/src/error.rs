//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("message parse error: {0}")]
    Parse(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("send error: {0}")]
    Send(String),

    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("batch sender closed")]
    Closed,

    #[error("provider error: {0}")]
    Provider(String),
}
