//! FFI status codes returned by every `extern "C"` function.

use quarry_alloc::ConfigError;
use quarry_core::AllocError;

/// Status codes returned by every Quarry C function.
///
/// Zero is success; negative values are errors. Codes are stable across
/// releases.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuarryStatus {
    /// Success.
    Ok = 0,
    /// Handle is stale, destroyed, or was never issued on this thread.
    InvalidHandle = -1,
    /// Null pointer, out-of-range flag, or foreign pointer/allocation.
    InvalidArgument = -2,
    /// The allocator (or one of its ancestors) could not satisfy a request.
    OutOfMemory = -3,
    /// Request larger than a fixed-slot allocator's slot.
    SizeExceedsSlot = -4,
    /// Size arithmetic overflowed.
    Overflow = -5,
    /// Rejected allocator configuration.
    ConfigError = -6,
    /// The operation is not available for this kind of allocator.
    Unsupported = -7,
    /// A Rust panic was caught at the boundary.
    Panicked = -128,
}

impl From<&AllocError> for QuarryStatus {
    fn from(e: &AllocError) -> Self {
        match e {
            AllocError::OutOfMemory { .. } => QuarryStatus::OutOfMemory,
            AllocError::SizeExceedsSlot { .. } => QuarryStatus::SizeExceedsSlot,
            AllocError::Overflow => QuarryStatus::Overflow,
        }
    }
}

impl From<&ConfigError> for QuarryStatus {
    fn from(_e: &ConfigError) -> Self {
        QuarryStatus::ConfigError
    }
}
