//! Micro-batch accumulator.
//!
//! Collects items and releases them when either the size threshold is hit
//! or the buffer has gone idle (no push) for longer than the configured window,
//! whichever comes first. Uses [`tokio::time::Instant`] so paused-clock
//! tests drive it deterministically.

use std::time::Duration;

use tokio::time::Instant;

/// Accumulates items into micro-batches.
pub struct MicroBatcher<T> {
    buffer: Vec<T>,
    max_size: usize,
    max_idle: Duration,
    last_push: Option<Instant>,
}

impl<T> MicroBatcher<T> {
    /// - `max_size`: flush when this many items are buffered.
    /// - `max_idle`: flush when nothing has been pushed for longer than this.
    pub fn new(max_size: usize, max_idle: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(max_size),
            max_size: max_size.max(1),
            max_idle,
            last_push: None,
        }
    }

    /// Add one item and restart the idle timer.
    pub fn push(&mut self, item: T) {
        self.buffer.push(item);
        self.last_push = Some(Instant::now());
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_size
    }

    /// `true` when the buffer is full or has been idle for more than `max_idle`.
    pub fn should_flush(&self) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        if self.is_full() {
            return true;
        }
        self.last_push.is_some_and(|at| at.elapsed() > self.max_idle)
    }

    /// Take everything buffered and reset.
    pub fn flush(&mut self) -> Vec<T> {
        self.last_push = None;
        std::mem::take(&mut self.buffer)
    }

    /// Flush only if a threshold is met.
    pub fn try_flush(&mut self) -> Option<Vec<T>> {
        if self.should_flush() {
            Some(self.flush())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
