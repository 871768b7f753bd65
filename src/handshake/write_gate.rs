use std::collections::VecDeque;

use bytes::Bytes;

/// Writes held back until the handshake has been decided.
#[derive(Debug, Default)]
pub struct PendingWrites {
    queue: VecDeque<Bytes>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: Bytes) {
        self.queue.push_back(data);
    }

    /// Hands out every queued write in arrival order, leaving the queue empty.
    pub fn drain(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.queue.drain(..)
    }

    pub fn discard(&mut self) {
        if !self.queue.is_empty() {
            log::debug!("Discarding {} pending writes", self.queue.len());
        }
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
