//! # Cache Configuration
//!
//! Tuning knobs for the BO cache.

use magma_core::{ByteSize, Error, Result};

/// One second in nanoseconds
const NSEC_PER_SEC: u64 = 1_000_000_000;

// =============================================================================
// CACHE CONFIGURATION
// =============================================================================

/// BO cache configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoCacheConfig {
    /// log2 of the smallest size class; smaller BOs share its bucket
    pub min_bucket_shift: u32,
    /// log2 of the largest size class; larger BOs share its bucket
    pub max_bucket_shift: u32,
    /// Entries idle for longer than this are released on the next insert
    pub stale_after_ns: Option<u64>,
    /// Upper bound on cached bytes, enforced on every insert
    pub max_cached_bytes: Option<u64>,
}

impl BoCacheConfig {
    /// 4 KiB to 4 MiB classes, two second idle limit, no byte budget
    pub const fn new() -> Self {
        Self {
            min_bucket_shift: 12,
            max_bucket_shift: 22,
            stale_after_ns: Some(2 * NSEC_PER_SEC),
            max_cached_bytes: None,
        }
    }

    /// Keep entries until explicitly evicted
    pub const fn unbounded() -> Self {
        Self {
            stale_after_ns: None,
            ..Self::new()
        }
    }

    /// Default classes with a hard byte budget
    pub const fn with_budget(max_cached_bytes: u64) -> Self {
        Self {
            max_cached_bytes: Some(max_cached_bytes),
            ..Self::new()
        }
    }

    /// Size class of a BO of `size` bytes
    pub fn size_class(&self, size: u64) -> u32 {
        let log2 = ByteSize::from_bytes(size).log2_floor();
        log2.clamp(self.min_bucket_shift, self.max_bucket_shift) - self.min_bucket_shift
    }

    /// Reject inverted or oversized class ranges
    pub fn validate(&self) -> Result<()> {
        if self.min_bucket_shift > self.max_bucket_shift || self.max_bucket_shift >= 64 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for BoCacheConfig {
    fn default() -> Self {
        Self::new()
    }
}
