//! # MAGMA Error Handling
//!
//! Error types for the buffer-object stack.
//!
//! Error handling in MAGMA follows these principles:
//! - Errors are typed and categorized
//! - No panics in production code paths
//! - Errors are `no_std` compatible
//! - Release paths never surface errors; they log and count them instead

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// MAGMA Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// MAGMA unified error type
///
/// The first four variants are the ones the buffer-object layer produces
/// itself. The remaining ones are reported by memory providers and passed
/// through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Buffer Object Errors
    // =========================================================================
    /// Zero size, incompatible flag combination or out-of-range access
    InvalidArgument,
    /// Provider allocation failed, even after evicting the BO cache
    OutOfMemory,
    /// A wait exceeded its deadline
    Timeout,
    /// The allocation class does not support the requested operation
    UnsupportedOperation,

    // =========================================================================
    // Provider Errors
    // =========================================================================
    /// CPU mapping of an allocation failed
    MappingFailed,
    /// The provider does not know the handle or file descriptor
    NotFound,
    /// Raw failure code reported by the kernel driver
    ProviderFault(i32),
}

impl Error {
    /// Whether retrying after releasing cached memory may help
    #[inline]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::OutOfMemory => write!(f, "out of GPU memory"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::UnsupportedOperation => write!(f, "operation not supported"),
            Self::MappingFailed => write!(f, "memory mapping failed"),
            Self::NotFound => write!(f, "resource not found"),
            Self::ProviderFault(code) => write!(f, "provider fault (errno {})", code),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
