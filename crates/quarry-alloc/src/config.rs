//! Allocator configuration parameters.
//!
//! Validated at construction; all values are immutable after creation.

use quarry_core::{align_up, MIN_ALIGN};

use crate::error::ConfigError;

/// Configuration for [`Arena`](crate::Arena).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Size of each block requested from the parent, in bytes.
    ///
    /// Requests larger than this get a dedicated block of exactly their
    /// size. Default: 1 MiB.
    pub block_size: usize,
}

impl ArenaConfig {
    /// Default block size: 1 MiB.
    pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

    /// Create a config with the given block size.
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }

    /// Check that the config describes a usable arena.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ZeroBlockSize`] when `block_size` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_block_size(self.block_size)
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BLOCK_SIZE)
    }
}

/// Configuration for [`Heap`](crate::Heap).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Size of each block requested from the parent, in bytes.
    ///
    /// Default: 1 MiB.
    pub block_size: usize,
}

impl HeapConfig {
    /// Default block size: 1 MiB.
    pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

    /// Create a config with the given block size.
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }

    /// Check that the config describes a usable heap.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ZeroBlockSize`] when `block_size` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_block_size(self.block_size)
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BLOCK_SIZE)
    }
}

/// Configuration for [`FastAllocator`](crate::FastAllocator).
///
/// A slab holds `slots_per_slab` fixed-size slots. Each slot is at least
/// [`MIN_ALIGN`] bytes so a freed slot can hold its free-list link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FastConfig {
    /// Largest allocation the allocator accepts, in bytes.
    pub slot_size: usize,
    /// Number of slots per slab requested from the parent.
    pub slots_per_slab: usize,
}

impl FastConfig {
    /// Default slot size: 64 bytes.
    pub const DEFAULT_SLOT_SIZE: usize = 64;

    /// Default slots per slab: 16384 (1 MiB at the default slot size).
    pub const DEFAULT_SLOTS_PER_SLAB: usize = 16 * 1024;

    /// Create a config with the given slot size and slab capacity.
    pub fn new(slot_size: usize, slots_per_slab: usize) -> Self {
        Self {
            slot_size,
            slots_per_slab,
        }
    }

    /// Slot size after rounding up to [`MIN_ALIGN`].
    pub fn rounded_slot_size(&self) -> usize {
        align_up(self.slot_size.max(MIN_ALIGN), MIN_ALIGN)
    }

    /// Bytes per slab, or `None` on overflow.
    pub fn slab_bytes(&self) -> Option<usize> {
        self.rounded_slot_size().checked_mul(self.slots_per_slab)
    }

    /// Check that the config describes a usable slab allocator.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_size == 0 {
            return Err(ConfigError::ZeroSlotSize);
        }
        if self.slots_per_slab == 0 {
            return Err(ConfigError::ZeroSlotCount);
        }
        if self.slot_size > usize::MAX - MIN_ALIGN || self.slab_bytes().is_none() {
            return Err(ConfigError::SlabTooLarge {
                slot_size: self.slot_size,
                slots_per_slab: self.slots_per_slab,
            });
        }
        Ok(())
    }
}

impl Default for FastConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SLOT_SIZE, Self::DEFAULT_SLOTS_PER_SLAB)
    }
}

fn validate_block_size(block_size: usize) -> Result<(), ConfigError> {
    if block_size == 0 {
        Err(ConfigError::ZeroBlockSize)
    } else {
        Ok(())
    }
}
