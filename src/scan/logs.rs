//! Bounded, subscribable log feed for scan progress

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

/// Maximum number of lines kept for polling readers
pub const DEFAULT_LOG_CAPACITY: usize = 500;

const BROADCAST_CAPACITY: usize = 1024;

/// Ring buffer of the most recent log lines plus a broadcast channel for live
/// subscribers. Pushing never waits on readers; slow subscribers lag and skip.
pub struct LogFeed {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
    tx: broadcast::Sender<String>,
}

impl LogFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(BROADCAST_CAPACITY))),
            capacity: capacity.max(1),
            tx,
        }
    }

    /// Append a line, mirroring it to tracing
    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(target: "scan", "{}", line);

        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.push_back(line.clone());
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }

        // no subscribers is fine
        let _ = self.tx.send(line);
    }

    /// Lines currently held, oldest first
    pub fn snapshot(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for LogFeed {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
