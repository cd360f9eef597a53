//! # Usage Tracker
//!
//! Pending GPU accesses of a single buffer object.
//!
//! Every job that references a BO appends one [`UsageRecord`] per access at
//! submit time and retires it once its queue reports the job's sequence
//! number as complete. The ledger is an ordered, append-only list rather than
//! a set: a queue may have a read and a later write in flight at the same
//! time, and each must be retirable on its own.

use alloc::vec::Vec;

use magma_core::{AccessMask, Error, QueueId, Result, SeqNo};

// =============================================================================
// USAGE RECORD
// =============================================================================

/// One pending GPU access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecord {
    /// Queue the job was submitted to
    pub queue: QueueId,
    /// Job writes the buffer
    pub write: bool,
    /// Sequence number the queue signals on completion
    pub seqnum: SeqNo,
}

impl UsageRecord {
    /// Access kind as a mask
    #[inline]
    pub const fn access(&self) -> AccessMask {
        AccessMask::for_access(self.write)
    }
}

// =============================================================================
// RECORD / RETIRE OUTCOMES
// =============================================================================

/// What a retire did to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Retired {
    /// Number of records removed
    pub removed: usize,
    /// The queue had records before and has none now
    pub queue_drained: bool,
}

// =============================================================================
// USAGE LEDGER
// =============================================================================

/// Ordered ledger of pending accesses
#[derive(Debug, Default)]
pub struct UsageLedger {
    records: Vec<UsageRecord>,
}

impl UsageLedger {
    /// Create an empty ledger
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Append a pending access
    ///
    /// Returns `true` when this is the first pending record of `queue`.
    /// Sequence numbers may repeat but never go backwards within a queue. A
    /// record identical to the newest one of its queue is not stored twice.
    pub fn record(&mut self, queue: QueueId, write: bool, seqnum: SeqNo) -> Result<bool> {
        let newest = self.records.iter().rev().find(|r| r.queue == queue);

        let first_for_queue = match newest {
            None => true,
            Some(last) if seqnum < last.seqnum => return Err(Error::InvalidArgument),
            Some(last) if last.seqnum == seqnum && last.write == write => return Ok(false),
            Some(_) => false,
        };

        self.records.push(UsageRecord {
            queue,
            write,
            seqnum,
        });

        Ok(first_for_queue)
    }

    /// Drop every record of `queue` up to and including `completed`
    pub fn retire(&mut self, queue: QueueId, completed: SeqNo) -> Retired {
        let before = self.records.len();
        let had_queue = self.has_queue(queue);

        self.records
            .retain(|r| r.queue != queue || r.seqnum > completed);

        Retired {
            removed: before - self.records.len(),
            queue_drained: had_queue && !self.has_queue(queue),
        }
    }

    /// Aggregate pending accesses over all queues
    pub fn pending_access_mask(&self) -> AccessMask {
        self.records
            .iter()
            .fold(AccessMask::empty(), |mask, r| mask | r.access())
    }

    /// Pending accesses of a single queue
    pub fn queue_access_mask(&self, queue: QueueId) -> AccessMask {
        self.records
            .iter()
            .filter(|r| r.queue == queue)
            .fold(AccessMask::empty(), |mask, r| mask | r.access())
    }

    /// Check whether `queue` has anything in flight
    pub fn has_queue(&self, queue: QueueId) -> bool {
        self.records.iter().any(|r| r.queue == queue)
    }

    /// Forget everything (cache insert and resurrection)
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Check if idle
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of pending records
    pub fn len(&self) -> usize {
        self.records.len()
    }
}
