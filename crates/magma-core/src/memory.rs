//! # Memory Management Primitives
//!
//! Buffer-object allocation flags and CPU mappings.

use core::ptr::NonNull;

use crate::error::{Error, Result};
use crate::types::ByteSize;

/// Granularity of every provider allocation
pub const PAGE_SIZE: u64 = 4096;

// =============================================================================
// BUFFER OBJECT FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Capabilities requested for a buffer object
    ///
    /// Flags are independent bits chosen per allocation at runtime. The only
    /// cross-flag rule is checked by [`BoFlags::validate`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BoFlags: u32 {
        /// Region holds shader code
        const EXECUTE = 1 << 0;
        /// Lazily backed, grows on GPU page fault. Requires `INVISIBLE`
        const GROWABLE = 1 << 1;
        /// Never mapped to the CPU
        const INVISIBLE = 1 << 2;
        /// Not mapped at allocation time; mapped on first CPU use
        const DELAY_MMAP = 1 << 3;
        /// Aliased across processes (imported or exported), never pooled
        const SHARED = 1 << 4;
        /// Event memory the kernel can signal
        const EVENT = 1 << 5;
        /// Returned to the BO cache on release
        const CACHEABLE = 1 << 6;
    }
}

impl BoFlags {
    /// Flags that describe how a BO is currently used rather than what was
    /// allocated. They do not take part in cache matching.
    pub const EPHEMERAL: Self = Self::DELAY_MMAP.union(Self::SHARED);

    /// Reject flag combinations no provider can satisfy
    pub fn validate(self) -> Result<()> {
        if self.contains(Self::GROWABLE) && !self.contains(Self::INVISIBLE) {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Flags that must match exactly for a cached BO to be reused
    #[inline]
    pub const fn cache_key(self) -> Self {
        self.difference(Self::EPHEMERAL)
    }

    /// Whether allocation should map the BO right away
    #[inline]
    pub const fn wants_eager_mapping(self) -> bool {
        !self.intersects(Self::INVISIBLE.union(Self::DELAY_MMAP))
    }
}

// =============================================================================
// CPU MAPPING
// =============================================================================

/// CPU view of a provider allocation
///
/// The mapping is owned by exactly one buffer object and handed back to the
/// provider through `munmap` when that BO is destroyed.
#[derive(Debug)]
pub struct CpuMapping {
    ptr: NonNull<u8>,
    len: ByteSize,
}

impl CpuMapping {
    /// Wrap a mapping returned by the kernel
    ///
    /// # Safety
    /// `ptr` must point to `len` bytes that stay mapped until the mapping is
    /// passed back to the provider that created it.
    pub unsafe fn new(ptr: NonNull<u8>, len: ByteSize) -> Self {
        Self { ptr, len }
    }

    /// Base CPU address
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Mapped length
    #[inline]
    pub fn len(&self) -> ByteSize {
        self.len
    }
}

// SAFETY: the mapping is plain memory; synchronizing access to the bytes is
// the caller's business, exactly as with the GPU side.
unsafe impl Send for CpuMapping {}
// SAFETY: see above
unsafe impl Sync for CpuMapping {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growable_requires_invisible() {
        assert_eq!(BoFlags::GROWABLE.validate(), Err(Error::InvalidArgument));
        assert!((BoFlags::GROWABLE | BoFlags::INVISIBLE).validate().is_ok());
        assert!(BoFlags::empty().validate().is_ok());
    }

    #[test]
    fn test_cache_key_drops_ephemeral_bits() {
        let flags = BoFlags::CACHEABLE | BoFlags::DELAY_MMAP | BoFlags::EXECUTE;
        assert_eq!(flags.cache_key(), BoFlags::CACHEABLE | BoFlags::EXECUTE);
    }

    #[test]
    fn test_eager_mapping() {
        assert!(BoFlags::CACHEABLE.wants_eager_mapping());
        assert!(!BoFlags::INVISIBLE.wants_eager_mapping());
        assert!(!BoFlags::DELAY_MMAP.wants_eager_mapping());
    }
}
