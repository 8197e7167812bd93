//! Pending local change queue.
//!
//! Holds edits the server has not acknowledged yet, in the order they were
//! made. Entries leave the queue only through [`PendingQueue::acknowledge`];
//! a full queue refuses new edits instead of dropping old ones.

use std::collections::VecDeque;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::model::PendingChange;
use crate::protocol::Limits;

pub struct PendingQueue {
    queue: VecDeque<PendingChange>,
    max_size: usize,
}

impl PendingQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Append an edit. Fails with `ValidationFailure` when the queue is full.
    pub fn enqueue(&mut self, change: PendingChange) -> SyncResult<()> {
        if self.queue.len() >= self.max_size {
            return Err(SyncError::ValidationFailure(format!(
                "pending queue is full ({} edits)",
                self.max_size
            )));
        }
        self.queue.push_back(change);
        Ok(())
    }

    /// Copy of the oldest entries that fit one submit frame.
    pub fn snapshot(&self, limits: &Limits) -> Vec<PendingChange> {
        let count = limits.fitting(self.queue.iter().map(|c| c.payload.len()));
        self.queue.iter().take(count).cloned().collect()
    }

    /// Drop the oldest `count` entries once the server has versioned them.
    pub fn acknowledge(&mut self, count: usize) -> Vec<PendingChange> {
        let count = count.min(self.queue.len());
        self.queue.drain(..count).collect()
    }

    /// Acknowledge the head entry if it carries `id`.
    ///
    /// Used when a replayed change turns out to be our own edit whose
    /// acknowledgement was lost with the connection.
    pub fn acknowledge_if_head(&mut self, id: Uuid) -> bool {
        if self.queue.front().is_some_and(|c| c.id == id) {
            self.queue.pop_front();
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Total payload bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|c| c.payload.len()).sum()
    }
}
