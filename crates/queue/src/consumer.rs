//! Queue consumer trait and types.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// A raw message received from the inbound queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Provider message identifier.
    pub id: String,
    /// Raw message body (JSON string).
    pub body: String,
    /// Handle used to acknowledge or release this delivery.
    pub receipt_handle: String,
    pub timestamp: DateTime<Utc>,
    /// How many times this message has been delivered, including this one.
    pub attempt_count: u32,
}

/// Health status of a queue connection.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub connected: bool,
    /// Approximate number of messages waiting.
    pub approximate_message_count: Option<u64>,
    /// Provider name ("sqs", "memory").
    pub provider: String,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.connected { "up" } else { "down" };
        match self.approximate_message_count {
            Some(n) => write!(f, "{} {} ({} waiting)", self.provider, state, n),
            None => write!(f, "{} {}", self.provider, state),
        }
    }
}

/// Receiving side of a queue.
///
/// A delivered message stays invisible to other consumers until it is
/// acknowledged (deleted) or released with [`nack`](QueueConsumer::nack).
/// Messages that are neither come back after the provider's visibility
/// timeout.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Poll up to `max_messages`. May block for the provider's long-poll
    /// window; returns an empty vec when nothing arrived.
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError>;

    /// Delete the message. Only call once all of its work is durable.
    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Make the message visible again immediately.
    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn health_check(&self) -> Result<QueueHealth, QueueError>;
}
