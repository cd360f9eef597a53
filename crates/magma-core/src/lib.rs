//! # MAGMA Core
//!
//! Foundational types and the memory-provider boundary for the MAGMA
//! buffer-object stack.
//!
//! This crate holds everything the buffer-object layer shares with the
//! kernel-facing side of the driver: strongly typed addresses and sizes,
//! allocation flags, GPU access masks, and the [`MemoryProvider`] trait that
//! a kernel backend implements.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      magma-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │  Provider   │  │   Types     │  │     Error           │  │
//! │  │  (create,   │  │ (GpuAddr,   │  │   Handling          │  │
//! │  │ mmap, wait) │  │  ByteSize)  │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(any(test, feature = "std"))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod memory;
pub mod provider;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use error::{Error, Result};
pub use memory::{BoFlags, CpuMapping, PAGE_SIZE};
pub use provider::{MemoryProvider, ProviderAllocation};
pub use sync::{AccessMask, QueueId, SeqNo};
pub use types::*;
