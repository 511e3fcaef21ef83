//! Allocation error type shared by every strategy.

use std::error::Error;
use std::fmt;

/// Errors returned by [`Allocator::allocate`](crate::Allocator::allocate)
/// and by every operation that grows storage through an allocator.
///
/// Invalid pool handles are not an error: lookups report them as `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The parent allocator (or the OS) could not satisfy the request.
    OutOfMemory {
        /// Number of bytes requested from the failing allocator.
        requested: usize,
    },
    /// A fixed-slot allocator was asked for more than one slot can hold.
    SizeExceedsSlot {
        /// Number of bytes requested.
        requested: usize,
        /// Size of a single slot in bytes.
        slot_size: usize,
    },
    /// Size arithmetic (header, alignment or element count) overflowed.
    Overflow,
}

impl AllocError {
    /// Whether this error reports memory exhaustion.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: requested {requested} bytes")
            }
            Self::SizeExceedsSlot {
                requested,
                slot_size,
            } => {
                write!(
                    f,
                    "allocation of {requested} bytes exceeds slot size of {slot_size} bytes"
                )
            }
            Self::Overflow => write!(f, "allocation size overflow"),
        }
    }
}

impl Error for AllocError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_sizes() {
        let e = AllocError::OutOfMemory { requested: 4096 };
        assert_eq!(e.to_string(), "out of memory: requested 4096 bytes");

        let e = AllocError::SizeExceedsSlot {
            requested: 100,
            slot_size: 64,
        };
        assert!(e.to_string().contains("100"));
        assert!(e.to_string().contains("64"));
    }

    #[test]
    fn out_of_memory_predicate() {
        assert!(AllocError::OutOfMemory { requested: 1 }.is_out_of_memory());
        assert!(!AllocError::Overflow.is_out_of_memory());
    }
}
