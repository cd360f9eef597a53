//! # Buffer Object
//!
//! The allocation unit of the driver and its two ownership counters.
//!
//! A BO is owned from two sides at once:
//!
//! - `refcnt` counts CPU-side owners (application handles, state trackers).
//! - `gpu_refcnt` counts queues with unretired usage records.
//!
//! Both counters are plain atomics. The BO may only be cached or destroyed
//! once both are zero, and whichever side gets there last runs the release.
//! A claim flag makes that release happen exactly once even when both sides
//! hit zero concurrently. The release decision itself lives in
//! [`crate::device`], which owns the provider and the cache.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use magma_core::{
    AccessMask, BoFlags, BufferHandle, ByteSize, CpuMapping, DmaBufFd, GpuAddr,
    ProviderAllocation, QueueId,
};
use spin::Mutex;

use crate::usage::UsageLedger;

/// Cache slot value of a BO that is not cached
pub(crate) const NO_SLOT: u32 = u32::MAX;

// =============================================================================
// BUFFER OBJECT
// =============================================================================

/// A GPU buffer object
#[derive(Debug)]
pub struct BufferObject {
    /// Provider handle
    handle: BufferHandle,
    /// GPU address
    gpu_addr: GpuAddr,
    /// Size of the backing allocation
    size: ByteSize,
    /// `BoFlags` bits; SHARED and DELAY_MMAP can change after creation
    flags: AtomicU32,
    /// CPU-side owners
    refcnt: AtomicU32,
    /// Queues with pending usage
    gpu_refcnt: AtomicU32,
    /// Set by the thread that performs the release
    released: AtomicBool,
    /// Pending GPU accesses
    usage: Mutex<UsageLedger>,
    /// CPU mapping, if any
    mapping: Mutex<Option<CpuMapping>>,
    /// Monotonic ns of last cache insert or hit
    last_used: AtomicU64,
    /// Index into the cache arena, `NO_SLOT` when not cached
    cache_slot: AtomicU32,
    /// dma-buf this BO was imported from or first exported as
    shared_fd: Mutex<Option<DmaBufFd>>,
    /// Debug label
    label: Mutex<&'static str>,
}

impl BufferObject {
    pub(crate) fn new(alloc: ProviderAllocation, flags: BoFlags, label: &'static str) -> Self {
        Self {
            handle: alloc.handle,
            gpu_addr: alloc.gpu_addr,
            size: alloc.size,
            flags: AtomicU32::new(flags.bits()),
            refcnt: AtomicU32::new(1),
            gpu_refcnt: AtomicU32::new(0),
            released: AtomicBool::new(false),
            usage: Mutex::new(UsageLedger::new()),
            mapping: Mutex::new(None),
            last_used: AtomicU64::new(0),
            cache_slot: AtomicU32::new(NO_SLOT),
            shared_fd: Mutex::new(None),
            label: Mutex::new(label),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Provider handle
    #[inline]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// GPU address
    #[inline]
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Size of the backing allocation
    #[inline]
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Current flags
    #[inline]
    pub fn flags(&self) -> BoFlags {
        BoFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Aliased across processes
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.flags().contains(BoFlags::SHARED)
    }

    /// CPU-side reference count
    #[inline]
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::SeqCst)
    }

    /// GPU-side reference count
    #[inline]
    pub fn gpu_refcnt(&self) -> u32 {
        self.gpu_refcnt.load(Ordering::SeqCst)
    }

    /// Currently sitting in the BO cache
    #[inline]
    pub fn is_cached(&self) -> bool {
        self.cache_slot.load(Ordering::Acquire) != NO_SLOT
    }

    /// Monotonic timestamp of the last cache insert or hit
    #[inline]
    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    /// CPU address of the mapping, if mapped
    pub fn cpu_ptr(&self) -> Option<NonNull<u8>> {
        self.mapping.lock().as_ref().map(CpuMapping::as_ptr)
    }

    /// Check if mapped
    pub fn is_mapped(&self) -> bool {
        self.mapping.lock().is_some()
    }

    /// dma-buf descriptor this BO was imported from or first exported as
    pub fn shared_fd(&self) -> Option<DmaBufFd> {
        *self.shared_fd.lock()
    }

    /// Debug label
    pub fn label(&self) -> &'static str {
        *self.label.lock()
    }

    /// Pending GPU accesses over all queues
    pub fn pending_access_mask(&self) -> AccessMask {
        self.usage.lock().pending_access_mask()
    }

    /// Pending GPU accesses of one queue
    pub fn queue_access_mask(&self, queue: QueueId) -> AccessMask {
        self.usage.lock().queue_access_mask(queue)
    }

    /// Number of pending usage records
    pub fn pending_usage_count(&self) -> usize {
        self.usage.lock().len()
    }

    // =========================================================================
    // CPU refcount
    // =========================================================================

    /// Take an additional CPU reference
    #[inline]
    pub fn reference(&self) {
        if self.refcnt.fetch_add(1, Ordering::SeqCst) == 0 {
            log::warn!("bo {:?}: reference to released buffer object", self.handle);
        }
    }

    /// Drop a CPU reference; returns `true` for the thread that hit zero
    pub(crate) fn drop_reference(&self) -> bool {
        let old = self
            .refcnt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match old {
            Ok(1) => true,
            Ok(_) => false,
            Err(_) => {
                log::warn!("bo {:?}: unreference of dead buffer object", self.handle);
                false
            }
        }
    }

    // =========================================================================
    // GPU refcount and usage
    // =========================================================================

    /// Record a pending access; bumps `gpu_refcnt` for a queue's first record
    pub(crate) fn record_usage(
        &self,
        queue: QueueId,
        write: bool,
        seqnum: u64,
    ) -> magma_core::Result<()> {
        let mut usage = self.usage.lock();
        if usage.record(queue, write, seqnum)? {
            self.gpu_refcnt.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Retire a queue's completed records
    ///
    /// Returns `true` for the caller that drove `gpu_refcnt` to zero.
    pub(crate) fn retire(&self, queue: QueueId, completed: u64) -> bool {
        let mut usage = self.usage.lock();
        let retired = usage.retire(queue, completed);
        if !retired.queue_drained {
            return false;
        }
        self.gpu_refcnt.fetch_sub(1, Ordering::SeqCst) == 1
    }

    // =========================================================================
    // Release bookkeeping
    // =========================================================================

    /// Claim the release; only one caller per lifetime wins
    pub(crate) fn try_claim_release(&self) -> bool {
        self.released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Bring a cached BO back to life for a new owner
    pub(crate) fn resurrect(&self, now_ns: u64, flags: BoFlags) {
        self.usage.lock().clear();
        self.last_used.store(now_ns, Ordering::Relaxed);
        self.flags.store(flags.bits(), Ordering::Release);
        self.gpu_refcnt.store(0, Ordering::SeqCst);
        self.refcnt.store(1, Ordering::SeqCst);
        self.released.store(false, Ordering::SeqCst);
    }

    /// Prepare for a cache insert
    pub(crate) fn park(&self, now_ns: u64) {
        self.usage.lock().clear();
        self.last_used.store(now_ns, Ordering::Relaxed);
    }

    pub(crate) fn cache_slot(&self) -> u32 {
        self.cache_slot.load(Ordering::Acquire)
    }

    pub(crate) fn set_cache_slot(&self, slot: u32) {
        self.cache_slot.store(slot, Ordering::Release);
    }

    pub(crate) fn set_label(&self, label: &'static str) {
        *self.label.lock() = label;
    }

    /// One-way promotion to a shared BO
    pub(crate) fn mark_shared(&self, fd: DmaBufFd) {
        self.flags.fetch_or(BoFlags::SHARED.bits(), Ordering::AcqRel);
        self.shared_fd.lock().get_or_insert(fd);
    }

    // =========================================================================
    // Mapping
    // =========================================================================

    pub(crate) fn mapping(&self) -> &Mutex<Option<CpuMapping>> {
        &self.mapping
    }

    pub(crate) fn take_mapping(&self) -> Option<CpuMapping> {
        self.mapping.lock().take()
    }
}

static_assertions::assert_impl_all!(BufferObject: Send, Sync);
