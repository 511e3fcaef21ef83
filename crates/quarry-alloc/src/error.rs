//! Allocator configuration errors.

use std::error::Error;
use std::fmt;

/// Errors produced when validating an allocator configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Block size of zero bytes.
    ZeroBlockSize,
    /// Slot size of zero bytes.
    ZeroSlotSize,
    /// Slab configured to hold zero slots.
    ZeroSlotCount,
    /// `slot_size * slots_per_slab` does not fit in `usize`.
    SlabTooLarge {
        /// Rounded slot size in bytes.
        slot_size: usize,
        /// Requested slots per slab.
        slots_per_slab: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroBlockSize => write!(f, "block size must be non-zero"),
            Self::ZeroSlotSize => write!(f, "slot size must be non-zero"),
            Self::ZeroSlotCount => write!(f, "slab must hold at least one slot"),
            Self::SlabTooLarge {
                slot_size,
                slots_per_slab,
            } => {
                write!(
                    f,
                    "slab of {slots_per_slab} slots of {slot_size} bytes overflows usize"
                )
            }
        }
    }
}

impl Error for ConfigError {}
