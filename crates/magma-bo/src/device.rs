//! # Buffer Object Device
//!
//! Per-device front end tying the provider, the BO cache and the shared-BO
//! table together.
//!
//! ## Release decision
//!
//! The release path runs once per BO lifetime, on whichever side reaches zero
//! last:
//!
//! ```text
//!  unreference ──► refcnt == 0 ──┐
//!                                ├──► gpu_refcnt > 0 ? ──► defer
//!  retire ──► gpu_refcnt == 0 ───┘          │ no
//!                                           ▼
//!                              CACHEABLE ? ──► cache insert
//!                                           │ no
//!                                           ▼
//!                                    munmap + destroy
//! ```
//!
//! Shared BOs skip all of this: the last CPU reference destroys them on the
//! spot, because the kernel keeps aliased memory alive for other processes
//! and in-flight jobs on its own.
//!
//! ## Locking
//!
//! - Cache: one lock, never held across a provider call.
//! - Shared table: serializes import, export promotion and the final release
//!   of shared BOs, so an import can never pick up a handle that is being
//!   destroyed. Taken before the cache lock when both are needed.
//! - Per-BO locks guard the usage ledger and the mapping.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use magma_core::{
    AccessMask, BoFlags, BufferHandle, ByteSize, DmaBufFd, Error, MemoryProvider, QueueId,
    Result, SeqNo, PAGE_SIZE,
};
use spin::Mutex;

use crate::bo::BufferObject;
use crate::cache::{BoCache, CacheStats};
use crate::config::BoCacheConfig;

// =============================================================================
// STATISTICS
// =============================================================================

/// Device-level statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// BOs allocated from the provider
    pub created: u64,
    /// BOs handed back to the provider
    pub destroyed: u64,
    /// BOs created from foreign dma-bufs
    pub imported: u64,
    /// dma-buf descriptors handed out
    pub exported: u64,
    /// Provider errors swallowed on release paths
    pub release_failures: u64,
}

#[derive(Debug, Default)]
struct DeviceCounters {
    created: AtomicU64,
    destroyed: AtomicU64,
    imported: AtomicU64,
    exported: AtomicU64,
    release_failures: AtomicU64,
}

impl DeviceCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DeviceStats {
        DeviceStats {
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            imported: self.imported.load(Ordering::Relaxed),
            exported: self.exported.load(Ordering::Relaxed),
            release_failures: self.release_failures.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// BO DEVICE
// =============================================================================

/// Buffer object manager for one GPU device
#[derive(Debug)]
pub struct BoDevice<P: MemoryProvider> {
    provider: P,
    cache: BoCache,
    /// Shared BOs by kernel handle
    shared: Mutex<HashMap<BufferHandle, Arc<BufferObject>>>,
    counters: DeviceCounters,
}

impl<P: MemoryProvider> BoDevice<P> {
    /// Create a device with the default cache configuration
    pub fn new(provider: P) -> Self {
        Self::build(provider, BoCacheConfig::default())
    }

    /// Create a device with a custom cache configuration
    pub fn with_config(provider: P, config: BoCacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(provider, config))
    }

    fn build(provider: P, config: BoCacheConfig) -> Self {
        Self {
            provider,
            cache: BoCache::new(config),
            shared: Mutex::new(HashMap::new()),
            counters: DeviceCounters::default(),
        }
    }

    /// Underlying provider
    pub fn provider(&self) -> &P {
        &self.provider
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a buffer object
    ///
    /// The size is rounded up to whole pages. Idle cached BOs are reused when
    /// one fits; otherwise the provider allocates, and on `OutOfMemory` the
    /// whole cache is released and the allocation retried once.
    pub fn create(&self, size: u64, flags: BoFlags, label: &'static str) -> Result<Arc<BufferObject>> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        flags.validate()?;
        let size = ByteSize::from_bytes(size)
            .checked_align_up(PAGE_SIZE)
            .ok_or(Error::InvalidArgument)?;

        if let Some(bo) = self.allocate_from_cache(size, flags) {
            bo.set_label(label);
            log::debug!("bo {:?} ({}): reused {} from cache", bo.handle(), label, bo.size());
            self.map_if_needed(&bo, flags)?;
            return Ok(bo);
        }

        let alloc = match self.provider.create(size, flags) {
            Err(err) if err.is_out_of_memory() => {
                log::debug!("bo create {} ({}): out of memory, evicting cache", size, label);
                self.evict_all();
                self.provider.create(size, flags)?
            }
            other => other?,
        };

        let bo = Arc::new(BufferObject::new(alloc, flags, label));
        DeviceCounters::bump(&self.counters.created);
        log::debug!("bo {:?} ({}): created {} at {}", bo.handle(), label, bo.size(), bo.gpu_addr());

        self.map_if_needed(&bo, flags)?;
        Ok(bo)
    }

    /// Pull a matching idle BO out of the cache and hand it to a new owner
    ///
    /// The BO comes back with `refcnt == 1`, no pending usage and a fresh
    /// `last_used` stamp.
    pub fn allocate_from_cache(&self, size: ByteSize, flags: BoFlags) -> Option<Arc<BufferObject>> {
        let bo = self.cache.fetch(size, flags)?;
        bo.resurrect(self.provider.now_ns(), flags);
        Some(bo)
    }

    fn map_if_needed(&self, bo: &Arc<BufferObject>, flags: BoFlags) -> Result<()> {
        if !flags.wants_eager_mapping() {
            return Ok(());
        }
        if let Err(err) = self.mmap(bo) {
            log::warn!("bo {:?}: mmap failed: {}", bo.handle(), err);
            self.discard(bo);
            return Err(err);
        }
        Ok(())
    }

    /// Drop the creator's reference of a BO that never left `create`
    fn discard(&self, bo: &BufferObject) {
        if bo.drop_reference() && bo.try_claim_release() {
            self.destroy(bo);
        }
    }

    // =========================================================================
    // CPU references
    // =========================================================================

    /// Take an additional CPU reference
    #[inline]
    pub fn reference(&self, bo: &BufferObject) {
        bo.reference();
    }

    /// Drop a CPU reference; the last one releases the BO
    pub fn unreference(&self, bo: &Arc<BufferObject>) {
        if bo.is_shared() {
            let mut shared = self.shared.lock();
            if bo.drop_reference() && bo.try_claim_release() {
                shared.remove(&bo.handle());
                log::debug!("bo {:?}: releasing shared buffer", bo.handle());
                self.destroy(bo);
            }
            return;
        }

        if bo.drop_reference() {
            self.release(bo);
        }
    }

    /// Cache or destroy a BO whose CPU references are gone
    fn release(&self, bo: &Arc<BufferObject>) {
        if bo.gpu_refcnt() > 0 {
            log::debug!(
                "bo {:?}: release deferred, {} queue(s) in flight",
                bo.handle(),
                bo.gpu_refcnt()
            );
            return;
        }
        if !bo.try_claim_release() {
            return;
        }

        if bo.flags().contains(BoFlags::CACHEABLE) && !bo.is_shared() {
            let now = self.provider.now_ns();
            bo.park(now);
            let evicted = self.cache.insert(Arc::clone(bo), now);
            if evicted.iter().any(|e| Arc::ptr_eq(e, bo)) {
                log::debug!("bo {:?}: evicted on cache insert", bo.handle());
            } else {
                log::debug!("bo {:?}: parked in cache", bo.handle());
            }
            self.destroy_all(&evicted);
        } else {
            self.destroy(bo);
        }
    }

    // =========================================================================
    // GPU usage
    // =========================================================================

    /// Note that a job on `queue` accesses `bo` until `seqnum` completes
    pub fn record_usage(&self, bo: &BufferObject, queue: QueueId, write: bool, seqnum: SeqNo) -> Result<()> {
        bo.record_usage(queue, write, seqnum)?;
        log::trace!(
            "bo {:?}: {} on {:?} until seqno {}",
            bo.handle(),
            if write { "write" } else { "read" },
            queue,
            seqnum
        );
        Ok(())
    }

    /// Retire the accesses of `queue` up to `completed`
    ///
    /// When this drains the last queue of a BO nobody holds on the CPU any
    /// more, the deferred release runs here.
    pub fn retire(&self, bo: &Arc<BufferObject>, queue: QueueId, completed: SeqNo) {
        if bo.retire(queue, completed) && bo.refcnt() == 0 {
            self.release(bo);
        }
    }

    /// Pending GPU accesses of `bo`
    pub fn pending_access_mask(&self, bo: &BufferObject) -> AccessMask {
        bo.pending_access_mask()
    }

    /// Wait for the GPU to finish with `bo`
    ///
    /// With `wait_readers == false` only pending writes are waited for, which
    /// is enough before a CPU read. Returns without touching the provider when
    /// nothing relevant is pending. Shared BOs always ask the provider, since
    /// other processes may be using them.
    pub fn wait(&self, bo: &BufferObject, timeout_ns: u64, wait_readers: bool) -> Result<()> {
        let target = AccessMask::wait_target(wait_readers);
        let pending = if bo.is_shared() {
            target
        } else {
            bo.pending_access_mask() & target
        };

        if pending.is_empty() {
            return Ok(());
        }

        if self.provider.wait(bo.handle(), timeout_ns, pending)? {
            Ok(())
        } else {
            log::debug!("bo {:?}: wait timed out after {} ns", bo.handle(), timeout_ns);
            Err(Error::Timeout)
        }
    }

    // =========================================================================
    // CPU access
    // =========================================================================

    /// Map `bo` for the CPU if it is not mapped yet
    pub fn mmap(&self, bo: &BufferObject) -> Result<()> {
        if bo.flags().contains(BoFlags::INVISIBLE) {
            return Err(Error::InvalidArgument);
        }

        let mut mapping = bo.mapping().lock();
        if mapping.is_none() {
            *mapping = Some(self.provider.mmap(bo.handle(), bo.size())?);
        }
        Ok(())
    }

    /// Drop stale CPU cache lines of a range before reading GPU output
    pub fn mem_invalidate(&self, bo: &BufferObject, offset: u64, length: u64) -> Result<()> {
        check_range(bo, offset, length)?;
        if !bo.is_mapped() {
            return Ok(());
        }
        self.provider.invalidate(bo.handle(), offset, length)
    }

    /// Write back CPU writes of a range before the GPU consumes them
    pub fn mem_clean(&self, bo: &BufferObject, offset: u64, length: u64) -> Result<()> {
        check_range(bo, offset, length)?;
        if !bo.is_mapped() {
            return Ok(());
        }
        self.provider.clean(bo.handle(), offset, length)
    }

    // =========================================================================
    // Import / export
    // =========================================================================

    /// Wrap a dma-buf from another process or device
    ///
    /// Importing a buffer this device already tracks returns the existing BO
    /// with one more reference.
    pub fn import(&self, fd: DmaBufFd) -> Result<Arc<BufferObject>> {
        let mut shared = self.shared.lock();
        let alloc = self.provider.import(fd)?;

        if let Some(bo) = shared.get(&alloc.handle) {
            bo.reference();
            log::debug!("bo {:?}: re-imported from fd {}", bo.handle(), fd.raw());
            return Ok(Arc::clone(bo));
        }

        let bo = Arc::new(BufferObject::new(alloc, BoFlags::SHARED, "imported"));
        bo.mark_shared(fd);
        shared.insert(alloc.handle, Arc::clone(&bo));
        DeviceCounters::bump(&self.counters.imported);
        log::debug!("bo {:?}: imported {} from fd {}", bo.handle(), bo.size(), fd.raw());
        Ok(bo)
    }

    /// Hand out a dma-buf for `bo`
    ///
    /// The first export promotes the BO to shared for the rest of its life.
    /// Exporting a BO sitting in the cache takes it out and hands the caller
    /// its one reference. A BO nobody owns any more is `InvalidArgument`.
    pub fn export(&self, bo: &Arc<BufferObject>) -> Result<DmaBufFd> {
        if bo.flags().contains(BoFlags::GROWABLE) {
            return Err(Error::UnsupportedOperation);
        }

        let mut shared = self.shared.lock();

        // A cached BO has no owner; the exporter becomes its owner
        let revived = !bo.is_shared() && self.cache.remove(bo);
        if revived {
            bo.resurrect(self.provider.now_ns(), bo.flags());
            log::debug!("bo {:?}: taken out of cache for export", bo.handle());
        } else if bo.refcnt() == 0 {
            return Err(Error::InvalidArgument);
        }

        let fd = match self.provider.export(bo.handle()) {
            Ok(fd) => fd,
            Err(err) => {
                if revived && bo.drop_reference() {
                    self.release(bo);
                }
                return Err(err);
            }
        };

        if !bo.is_shared() {
            log::debug!("bo {:?}: promoted to shared", bo.handle());
        }
        bo.mark_shared(fd);
        shared
            .entry(bo.handle())
            .or_insert_with(|| Arc::clone(bo));

        DeviceCounters::bump(&self.counters.exported);
        Ok(fd)
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Release every cached BO to the provider
    pub fn evict_all(&self) {
        let evicted = self.cache.drain();
        if !evicted.is_empty() {
            log::debug!("bo cache: evicting all {} entries", evicted.len());
        }
        self.destroy_all(&evicted);
    }

    /// Release least recently used cached BOs until at most `max_bytes` stay
    pub fn trim_to_budget(&self, max_bytes: u64) {
        let evicted = self.cache.trim(max_bytes);
        if !evicted.is_empty() {
            log::debug!("bo cache: trimmed {} entries to {} bytes", evicted.len(), max_bytes);
        }
        self.destroy_all(&evicted);
    }

    /// Bytes held by the cache
    pub fn cached_bytes(&self) -> u64 {
        self.cache.cached_bytes()
    }

    /// Cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Device statistics
    pub fn stats(&self) -> DeviceStats {
        self.counters.snapshot()
    }

    // =========================================================================
    // Destruction
    // =========================================================================

    fn destroy_all(&self, bos: &[Arc<BufferObject>]) {
        for bo in bos {
            self.destroy(bo);
        }
    }

    /// Unmap and free; failures are logged and counted, never returned
    fn destroy(&self, bo: &BufferObject) {
        if let Some(mapping) = bo.take_mapping() {
            if let Err(err) = self.provider.munmap(bo.handle(), mapping) {
                self.release_failed(bo, "munmap", err);
            }
        }
        if let Err(err) = self.provider.destroy(bo.handle()) {
            self.release_failed(bo, "destroy", err);
        }
        DeviceCounters::bump(&self.counters.destroyed);
    }

    fn release_failed(&self, bo: &BufferObject, what: &str, err: Error) {
        DeviceCounters::bump(&self.counters.release_failures);
        log::warn!("bo {:?} ({}): {} failed: {}", bo.handle(), bo.label(), what, err);
    }
}

impl<P: MemoryProvider> Drop for BoDevice<P> {
    fn drop(&mut self) {
        self.evict_all();
    }
}

fn check_range(bo: &BufferObject, offset: u64, length: u64) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= bo.size().as_bytes() => Ok(()),
        _ => Err(Error::InvalidArgument),
    }
}
