//! # Memory Provider
//!
//! The kernel-facing boundary of the buffer-object layer.
//!
//! A provider owns the real memory operations: it creates and destroys
//! allocations, maps them for the CPU, moves them across process boundaries
//! and waits on the GPU. Everything above it (pooling, refcounting, usage
//! tracking) lives in `magma-bo` and only ever talks to the kernel through
//! this trait.
//!
//! ## Release paths
//!
//! Some kernels free an allocation by unmapping its GPU address, others need
//! an explicit free call on the handle, and the right choice can differ per
//! allocation class. The provider records that choice when it creates the
//! allocation and dispatches on it inside [`MemoryProvider::destroy`]; callers
//! never select a release protocol.

use crate::error::Result;
use crate::memory::{BoFlags, CpuMapping};
use crate::sync::AccessMask;
use crate::types::{BufferHandle, ByteSize, DmaBufFd, GpuAddr};

// =============================================================================
// ALLOCATION DESCRIPTOR
// =============================================================================

/// What the provider hands back for a new or imported allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderAllocation {
    /// Kernel handle
    pub handle: BufferHandle,
    /// GPU virtual address
    pub gpu_addr: GpuAddr,
    /// Size of the backing allocation
    pub size: ByteSize,
}

// =============================================================================
// PROVIDER TRAIT
// =============================================================================

/// Kernel memory provider
pub trait MemoryProvider: Send + Sync {
    /// Allocate GPU memory
    ///
    /// Fails with `OutOfMemory` when the kernel is out of memory and
    /// `InvalidArgument` when it rejects the flag set.
    fn create(&self, size: ByteSize, flags: BoFlags) -> Result<ProviderAllocation>;

    /// Release an allocation through whichever path it was created for
    fn destroy(&self, handle: BufferHandle) -> Result<()>;

    /// Map an allocation into the CPU address space
    fn mmap(&self, handle: BufferHandle, size: ByteSize) -> Result<CpuMapping>;

    /// Tear down a mapping produced by [`MemoryProvider::mmap`]
    fn munmap(&self, handle: BufferHandle, mapping: CpuMapping) -> Result<()>;

    /// Resolve a foreign dma-buf to a local allocation
    ///
    /// Importing the same underlying buffer twice yields the same handle.
    fn import(&self, fd: DmaBufFd) -> Result<ProviderAllocation>;

    /// Produce a fresh dma-buf descriptor for an allocation
    fn export(&self, handle: BufferHandle) -> Result<DmaBufFd>;

    /// Block until the GPU accesses in `access` have drained
    ///
    /// Returns `Ok(false)` when `timeout_ns` expired first. Implementations
    /// must sleep in the kernel rather than spin.
    fn wait(&self, handle: BufferHandle, timeout_ns: u64, access: AccessMask) -> Result<bool>;

    /// Discard stale CPU cache lines before the CPU reads GPU output
    fn invalidate(&self, handle: BufferHandle, offset: u64, length: u64) -> Result<()>;

    /// Write back CPU cache lines before the GPU consumes CPU output
    fn clean(&self, handle: BufferHandle, offset: u64, length: u64) -> Result<()>;

    /// Monotonic clock in nanoseconds, used to age cached buffer objects
    fn now_ns(&self) -> u64;
}

impl<P: MemoryProvider + ?Sized> MemoryProvider for &P {
    fn create(&self, size: ByteSize, flags: BoFlags) -> Result<ProviderAllocation> {
        (**self).create(size, flags)
    }

    fn destroy(&self, handle: BufferHandle) -> Result<()> {
        (**self).destroy(handle)
    }

    fn mmap(&self, handle: BufferHandle, size: ByteSize) -> Result<CpuMapping> {
        (**self).mmap(handle, size)
    }

    fn munmap(&self, handle: BufferHandle, mapping: CpuMapping) -> Result<()> {
        (**self).munmap(handle, mapping)
    }

    fn import(&self, fd: DmaBufFd) -> Result<ProviderAllocation> {
        (**self).import(fd)
    }

    fn export(&self, handle: BufferHandle) -> Result<DmaBufFd> {
        (**self).export(handle)
    }

    fn wait(&self, handle: BufferHandle, timeout_ns: u64, access: AccessMask) -> Result<bool> {
        (**self).wait(handle, timeout_ns, access)
    }

    fn invalidate(&self, handle: BufferHandle, offset: u64, length: u64) -> Result<()> {
        (**self).invalidate(handle, offset, length)
    }

    fn clean(&self, handle: BufferHandle, offset: u64, length: u64) -> Result<()> {
        (**self).clean(handle, offset, length)
    }

    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}
