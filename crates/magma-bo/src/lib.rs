//! # MAGMA Buffer Objects
//!
//! GPU buffer object management: pooled reuse, dual CPU/GPU reference
//! counting, pending-access tracking and dma-buf sharing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         BoDevice<P>                             │
//! │                                                                 │
//! │  ┌───────────────────┐  ┌────────────────┐  ┌────────────────┐  │
//! │  │   BufferObject    │  │    BoCache     │  │  Shared table  │  │
//! │  │ refcnt/gpu_refcnt │  │ buckets + LRU  │  │ import/export  │  │
//! │  │   UsageLedger     │  │ (slot arena)   │  │                │  │
//! │  └───────────────────┘  └────────────────┘  └────────────────┘  │
//! │           │                     │                    │          │
//! │  ┌────────┴─────────────────────┴────────────────────┴───────┐  │
//! │  │                 MemoryProvider (kernel)                   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! - `create` reuses a cached BO when one fits, otherwise allocates.
//! - Submission code calls `record_usage` per job and `retire` on completion.
//! - The last `unreference` (or the last `retire` after it) parks cacheable
//!   BOs in the cache and destroys everything else.
//! - `export` and `import` move BOs across processes; shared BOs are never
//!   cached.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod bo;
pub mod cache;
pub mod config;
pub mod device;
pub mod usage;

#[cfg(test)]
mod mock;

// Re-exports
pub use bo::BufferObject;
pub use cache::{BoCache, CacheStats};
pub use config::BoCacheConfig;
pub use device::{BoDevice, DeviceStats};
pub use usage::{UsageLedger, UsageRecord};
