//! Offset-only variants of the heap and slab allocators.
//!
//! These manage the integer range `[0, heap_size)` of a buffer owned by
//! someone else. They never touch memory: bookkeeping lives in ordinary
//! vectors and every allocation is described by an [`OffsetAllocation`].
//! `metadata` locates the right free list on `free` without re-deriving it
//! from the offset.
//!
//! Both allocators also track which records are live, so callers handed a
//! record from outside (see `quarry-ffi`) can check it with `is_live` before
//! freeing it.

use std::collections::HashMap;

use quarry_core::AllocError;

use crate::size_class::{class_for, class_size, CLASS_COUNT};

/// A sub-range of an externally owned buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OffsetAllocation {
    /// Start of the range, in units of the managed buffer.
    pub offset: u64,
    /// Requested size of the range.
    pub size: u64,
    /// Size class ([`OffsetHeap`]) or slot index ([`OffsetFastAllocator`]).
    pub metadata: u32,
}

impl OffsetAllocation {
    /// One past the last unit of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

fn out_of_memory(size: u64) -> AllocError {
    AllocError::OutOfMemory {
        requested: usize::try_from(size).unwrap_or(usize::MAX),
    }
}

/// Size-classed free-list allocator over `[0, heap_size)`.
#[derive(Debug)]
pub struct OffsetHeap {
    heap_size: u64,
    /// First never-allocated offset.
    cursor: u64,
    free_lists: Vec<Vec<u64>>,
    used: u64,
    /// Offset to size class of every live allocation.
    live: HashMap<u64, u32>,
}

impl OffsetHeap {
    /// Manage a range of `heap_size` units.
    pub fn new(heap_size: u64) -> Self {
        Self {
            heap_size,
            cursor: 0,
            free_lists: vec![Vec::new(); CLASS_COUNT],
            used: 0,
            live: HashMap::new(),
        }
    }

    /// Reserve a range of at least `size` units, rounded up to its class.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when neither the class free list nor the
    /// untouched tail of the range can serve the request, and
    /// [`AllocError::Overflow`] when `size` has no class.
    pub fn allocate(&mut self, size: u64) -> Result<OffsetAllocation, AllocError> {
        let class = class_for(size).ok_or(AllocError::Overflow)?;
        let extent = class_size(class);
        let offset = match self.free_lists[class as usize].pop() {
            Some(offset) => offset,
            None => {
                let end = self
                    .cursor
                    .checked_add(extent)
                    .filter(|&end| end <= self.heap_size)
                    .ok_or_else(|| out_of_memory(size))?;
                let offset = self.cursor;
                self.cursor = end;
                offset
            }
        };
        self.used += extent;
        self.live.insert(offset, class);
        Ok(OffsetAllocation {
            offset,
            size,
            metadata: class,
        })
    }

    /// Whether `allocation` is a record this heap handed out and has not
    /// taken back since.
    pub fn is_live(&self, allocation: &OffsetAllocation) -> bool {
        class_for(allocation.size) == Some(allocation.metadata)
            && allocation
                .offset
                .checked_add(class_size(allocation.metadata))
                .is_some_and(|end| end <= self.cursor)
            && self.live.get(&allocation.offset) == Some(&allocation.metadata)
    }

    /// Return `allocation` to its class free list.
    ///
    /// `allocation` must be live and come from this heap. Records that fail
    /// [`is_live`](Self::is_live) are ignored in release builds.
    pub fn free(&mut self, allocation: OffsetAllocation) {
        let live = self.is_live(&allocation);
        debug_assert!(live, "offset {} is not live", allocation.offset);
        if !live {
            return;
        }
        self.live.remove(&allocation.offset);
        self.free_lists[allocation.metadata as usize].push(allocation.offset);
        self.used -= class_size(allocation.metadata);
    }

    /// Forget every allocation.
    pub fn clear(&mut self) {
        self.cursor = 0;
        self.free_lists.iter_mut().for_each(Vec::clear);
        self.used = 0;
        self.live.clear();
    }

    /// Units reserved by live allocations, rounded to their classes.
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Number of live allocations.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Size of the managed range.
    pub fn heap_size(&self) -> u64 {
        self.heap_size
    }
}

/// Fixed-slot allocator over `[0, heap_size)`.
///
/// The range is divided into `heap_size / slot_size` slots; any remainder
/// is never handed out.
#[derive(Debug)]
pub struct OffsetFastAllocator {
    heap_size: u64,
    slot_size: u64,
    slot_count: u32,
    /// Slots below this index have been handed out at least once.
    next_fresh: u32,
    free: Vec<u32>,
    /// One bit per slot below `next_fresh`, set while the slot is live.
    live_bits: Vec<u64>,
    live: usize,
}

impl OffsetFastAllocator {
    /// Manage `heap_size` units as slots of `slot_size` units.
    ///
    /// # Panics
    ///
    /// Panics if `slot_size` is zero.
    pub fn new(heap_size: u64, slot_size: u64) -> Self {
        assert!(slot_size > 0, "slot size must be non-zero");
        let slot_count = u32::try_from(heap_size / slot_size).unwrap_or(u32::MAX);
        Self {
            heap_size,
            slot_size,
            slot_count,
            next_fresh: 0,
            free: Vec::new(),
            live_bits: Vec::new(),
            live: 0,
        }
    }

    /// Reserve one slot for a request of `size` units.
    ///
    /// # Errors
    ///
    /// [`AllocError::SizeExceedsSlot`] when `size > slot_size`, and
    /// [`AllocError::OutOfMemory`] when every slot is live.
    pub fn allocate(&mut self, size: u64) -> Result<OffsetAllocation, AllocError> {
        if size > self.slot_size {
            return Err(AllocError::SizeExceedsSlot {
                requested: usize::try_from(size).unwrap_or(usize::MAX),
                slot_size: usize::try_from(self.slot_size).unwrap_or(usize::MAX),
            });
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.next_fresh < self.slot_count => {
                if self.next_fresh % 64 == 0 {
                    self.live_bits.push(0);
                }
                self.next_fresh += 1;
                self.next_fresh - 1
            }
            None => return Err(out_of_memory(size)),
        };
        self.set_live(index, true);
        self.live += 1;
        Ok(OffsetAllocation {
            offset: u64::from(index) * self.slot_size,
            size,
            metadata: index,
        })
    }

    fn set_live(&mut self, index: u32, live: bool) {
        let (word, bit) = (index as usize / 64, index % 64);
        if live {
            self.live_bits[word] |= 1 << bit;
        } else {
            self.live_bits[word] &= !(1 << bit);
        }
    }

    /// Whether `allocation` is a record this allocator handed out and has
    /// not taken back since.
    pub fn is_live(&self, allocation: &OffsetAllocation) -> bool {
        let index = allocation.metadata;
        index < self.next_fresh
            && allocation.size <= self.slot_size
            && allocation.offset == u64::from(index) * self.slot_size
            && self.live_bits[index as usize / 64] & (1 << (index % 64)) != 0
    }

    /// Return `allocation`'s slot to the free list.
    ///
    /// `allocation` must be live and come from this allocator. Records that
    /// fail [`is_live`](Self::is_live) are ignored in release builds.
    pub fn free(&mut self, allocation: OffsetAllocation) {
        let index = allocation.metadata;
        let live = self.is_live(&allocation);
        debug_assert!(live, "slot {index} is not live");
        if !live {
            return;
        }
        self.set_live(index, false);
        self.free.push(index);
        self.live -= 1;
    }

    /// Forget every allocation.
    pub fn clear(&mut self) {
        self.next_fresh = 0;
        self.free.clear();
        self.live_bits.clear();
        self.live = 0;
    }

    /// Units reserved by live allocations.
    pub fn used(&self) -> u64 {
        self.live as u64 * self.slot_size
    }

    /// Number of live allocations.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Size of every slot.
    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    /// Number of slots in the range.
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Size of the managed range.
    pub fn heap_size(&self) -> u64 {
        self.heap_size
    }
}
