//! # Synchronization Primitives
//!
//! Queue identifiers, submission sequence numbers and GPU access masks used to
//! track pending work on buffer objects.

use core::fmt;

// =============================================================================
// QUEUE
// =============================================================================

/// Identifier of a GPU submission queue
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct QueueId(u32);

impl QueueId {
    /// Create a queue identifier
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw identifier
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue({})", self.0)
    }
}

/// Monotonic per-queue submission sequence number
pub type SeqNo = u64;

// =============================================================================
// ACCESS MASK
// =============================================================================

bitflags::bitflags! {
    /// Kinds of GPU access pending on a buffer object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessMask: u32 {
        /// GPU reads the buffer
        const READ = 1 << 1;
        /// GPU writes the buffer
        const WRITE = 1 << 2;
        /// Both
        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl AccessMask {
    /// Mask for a single access
    #[inline]
    pub const fn for_access(write: bool) -> Self {
        if write {
            Self::WRITE
        } else {
            Self::READ
        }
    }

    /// Accesses a CPU wait has to drain
    ///
    /// CPU reads only conflict with GPU writes; CPU writes conflict with
    /// both.
    #[inline]
    pub const fn wait_target(wait_readers: bool) -> Self {
        if wait_readers {
            Self::RW
        } else {
            Self::WRITE
        }
    }
}
