//! In-process queue used by the local pipeline and tests.
//!
//! Implements both [`QueueConsumer`] and [`QueueProducer`] with the same
//! delivery model as SQS: a polled message is in flight until it is acked
//! or nacked. Everything sent through the producer side is recorded batch
//! by batch so callers can inspect what left the process.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::consumer::{QueueConsumer, QueueHealth, QueueMessage};
use crate::error::QueueError;
use crate::producer::{BatchOutcome, FailedEntry, OutboundEntry, QueueProducer};

#[derive(Default)]
struct State {
    pending: VecDeque<(String, String)>,
    in_flight: HashMap<String, (String, String)>,
    deliveries: HashMap<String, u32>,
    acked: Vec<String>,
    nacked: Vec<String>,
    sent: Vec<Vec<OutboundEntry>>,
    reject_entries: usize,
    fail_polls: usize,
}

#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread must not wedge every later assertion.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a message body and return its message id.
    pub fn push(&self, body: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        self.lock().pending.push_back((id.clone(), body.into()));
        id
    }

    /// Refuse the next `n` outbound entries with an `InternalError` code.
    pub fn reject_next_entries(&self, n: usize) {
        self.lock().reject_entries = n;
    }

    /// Make the next `n` polls fail with a connection error.
    pub fn fail_next_polls(&self, n: usize) {
        self.lock().fail_polls = n;
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Message ids acknowledged so far, in ack order.
    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    /// Message ids released with nack, in nack order.
    pub fn nacked(&self) -> Vec<String> {
        self.lock().nacked.clone()
    }

    /// Every accepted outbound batch, in send order.
    pub fn sent_batches(&self) -> Vec<Vec<OutboundEntry>> {
        self.lock().sent.clone()
    }

    /// Bodies of every accepted outbound entry, flattened.
    pub fn sent_bodies(&self) -> Vec<String> {
        self.lock()
            .sent
            .iter()
            .flatten()
            .map(|e| e.body.clone())
            .collect()
    }
}

#[async_trait]
impl QueueConsumer for InMemoryQueue {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        let mut state = self.lock();
        if state.fail_polls > 0 {
            state.fail_polls -= 1;
            return Err(QueueError::Connection("injected poll failure".into()));
        }

        let mut out = Vec::new();
        while out.len() < max_messages as usize {
            let Some((id, body)) = state.pending.pop_front() else {
                break;
            };
            let attempt = state.deliveries.entry(id.clone()).or_insert(0);
            *attempt += 1;
            let attempt_count = *attempt;
            let receipt_handle = format!("{id}#{attempt_count}");
            state
                .in_flight
                .insert(receipt_handle.clone(), (id.clone(), body.clone()));
            out.push(QueueMessage {
                id,
                body,
                receipt_handle,
                timestamp: Utc::now(),
                attempt_count,
            });
        }
        Ok(out)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        let (id, _) = state
            .in_flight
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::Ack(format!("unknown receipt handle {receipt_handle}")))?;
        state.acked.push(id);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        let (id, body) = state
            .in_flight
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::Ack(format!("unknown receipt handle {receipt_handle}")))?;
        state.nacked.push(id.clone());
        state.pending.push_front((id, body));
        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        Ok(QueueHealth {
            connected: true,
            approximate_message_count: Some(self.pending_len() as u64),
            provider: "memory".to_string(),
        })
    }
}

#[async_trait]
impl QueueProducer for InMemoryQueue {
    async fn send_batch(&self, entries: Vec<OutboundEntry>) -> Result<BatchOutcome, QueueError> {
        let mut state = self.lock();
        let mut accepted = Vec::with_capacity(entries.len());
        let mut failed = Vec::new();
        for entry in entries {
            if state.reject_entries > 0 {
                state.reject_entries -= 1;
                failed.push(FailedEntry {
                    id: entry.id,
                    code: "InternalError".to_string(),
                    message: "injected send failure".to_string(),
                });
            } else {
                accepted.push(entry);
            }
        }
        let sent = accepted.len();
        if !accepted.is_empty() {
            state.sent.push(accepted);
        }
        Ok(BatchOutcome { sent, failed })
    }
}
