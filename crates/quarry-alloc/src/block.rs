//! Parent-owned blocks and growable block chains.
//!
//! A [`Block`] is one region requested from a parent allocator with a bump
//! cursor. A [`BlockChain`] is the index-addressed list of blocks an
//! allocator owns; it overflows into a new block when the current one is
//! full and keeps blocks across `reset` so a cleared allocator refills
//! them in order before asking the parent for more.

#![allow(unsafe_code)]

use std::ptr::{self, NonNull};

use quarry_core::{checked_align_up, AllocError, Allocator, ClearFlag, MIN_ALIGN};
use smallvec::SmallVec;

/// A single region obtained from a parent allocator, with bump allocation.
pub(crate) struct Block {
    /// Start of the region. Aligned to [`MIN_ALIGN`].
    base: NonNull<u8>,
    /// Usable bytes starting at `base`.
    capacity: usize,
    /// Bump pointer: bytes handed out so far.
    cursor: usize,
}

impl Block {
    /// Request a block of `capacity` bytes from `parent`.
    pub(crate) fn acquire<A: Allocator + ?Sized>(
        parent: &A,
        capacity: usize,
    ) -> Result<Self, AllocError> {
        let base = parent.allocate(capacity, ClearFlag::NoClear)?;
        Ok(Self {
            base,
            capacity,
            cursor: 0,
        })
    }

    /// Return the block's region to `parent`.
    ///
    /// # Safety
    ///
    /// `parent` must be the allocator this block was acquired from, and no
    /// pointer into the block may be used afterwards.
    pub(crate) unsafe fn release<A: Allocator + ?Sized>(self, parent: &A) {
        // SAFETY: `base` came from `parent.allocate` and is freed once,
        // because `self` is consumed.
        unsafe { parent.free(self.base) }
    }

    /// Bump-allocate `size` bytes at `align`.
    ///
    /// Returns `None` if the remaining capacity is insufficient.
    pub(crate) fn bump(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let base_addr = self.base.as_ptr() as usize;
        let start = checked_align_up(base_addr.checked_add(self.cursor)?, align)? - base_addr;
        let end = start.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.cursor = end;
        // SAFETY: `start <= end <= capacity`, so the offset stays inside
        // the region returned by the parent.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) })
    }

    /// Move the bump pointer back to `cursor`.
    pub(crate) fn rewind(&mut self, cursor: usize) {
        debug_assert!(
            cursor <= self.cursor,
            "rewind to {cursor} past cursor {}",
            self.cursor
        );
        self.cursor = cursor;
    }

    /// Reset the bump pointer to zero, optionally zeroing the used bytes.
    pub(crate) fn reset(&mut self, clear: ClearFlag) {
        if clear.is_clear() {
            // SAFETY: the first `cursor` bytes lie inside the region.
            unsafe { ptr::write_bytes(self.base.as_ptr(), 0, self.cursor) };
        }
        self.cursor = 0;
    }

    /// Whether `p` points into this block's region.
    pub(crate) fn contains(&self, p: NonNull<u8>) -> bool {
        let base = self.base.as_ptr() as usize;
        let addr = p.as_ptr() as usize;
        addr >= base && addr < base + self.capacity
    }

    pub(crate) fn used(&self) -> usize {
        self.cursor
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Position inside a [`BlockChain`]: block index and cursor within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChainPosition {
    pub(crate) block: usize,
    pub(crate) offset: usize,
}

/// A growable, index-addressed list of [`Block`]s.
///
/// Allocations never straddle blocks: a request that does not fit in the
/// current block moves on to the next retained block or a new one sized
/// `max(block_size, request)`.
pub(crate) struct BlockChain {
    blocks: SmallVec<[Block; 4]>,
    block_size: usize,
    /// Index of the block currently being filled. Zero when empty.
    current: usize,
}

impl BlockChain {
    pub(crate) fn new(block_size: usize) -> Self {
        Self {
            blocks: SmallVec::new(),
            block_size,
            current: 0,
        }
    }

    /// Bump-allocate `size` bytes at `align`, growing through `parent`.
    pub(crate) fn bump<A: Allocator + ?Sized>(
        &mut self,
        parent: &A,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // Try the current block first.
        if let Some(block) = self.blocks.get_mut(self.current) {
            if let Some(p) = block.bump(size, align) {
                return Ok(p);
            }
        }

        // Current block full: walk forward through blocks retained by reset.
        while self.current + 1 < self.blocks.len() {
            self.current += 1;
            let block = &mut self.blocks[self.current];
            block.reset(ClearFlag::NoClear);
            if let Some(p) = block.bump(size, align) {
                return Ok(p);
            }
        }

        // Worst-case padding when the block base is only MIN_ALIGN-aligned.
        let padding = align.saturating_sub(MIN_ALIGN);
        let needed = size.checked_add(padding).ok_or(AllocError::Overflow)?;
        let capacity = self.block_size.max(needed);
        let mut block = Block::acquire(parent, capacity)?;
        let Some(p) = block.bump(size, align) else {
            // SAFETY: acquired from `parent` just above; nothing was handed out.
            unsafe { block.release(parent) };
            return Err(AllocError::OutOfMemory { requested: size });
        };
        self.blocks.push(block);
        self.current = self.blocks.len() - 1;
        tracing::debug!(
            capacity,
            index = self.current,
            "acquired block from parent"
        );
        Ok(p)
    }

    /// Current fill position.
    pub(crate) fn position(&self) -> ChainPosition {
        ChainPosition {
            block: self.current,
            offset: self.blocks.get(self.current).map_or(0, Block::used),
        }
    }

    /// Whether `pos` is at or behind the current fill position.
    pub(crate) fn is_behind(&self, pos: ChainPosition) -> bool {
        if self.blocks.is_empty() {
            return pos.block == 0 && pos.offset == 0;
        }
        pos.block <= self.current && pos.offset <= self.blocks[pos.block].used()
    }

    /// Restore an earlier position, returning later blocks to `parent`.
    ///
    /// # Safety
    ///
    /// `parent` must be the allocator the blocks were acquired from, and no
    /// allocation made after `pos` was captured may be used afterwards.
    pub(crate) unsafe fn restore<A: Allocator + ?Sized>(&mut self, parent: &A, pos: ChainPosition) {
        // SAFETY: forwarded caller contract.
        unsafe { self.release_from(parent, pos.block + 1) };
        self.current = pos.block;
        if let Some(block) = self.blocks.get_mut(pos.block) {
            block.rewind(pos.offset);
        }
    }

    /// Reset every block's cursor, keeping the blocks for reuse.
    pub(crate) fn reset(&mut self, clear: ClearFlag) {
        for block in &mut self.blocks {
            block.reset(clear);
        }
        self.current = 0;
    }

    /// Return every block to `parent`.
    ///
    /// # Safety
    ///
    /// As for [`restore`](Self::restore): no pointer into the chain may be
    /// used afterwards.
    pub(crate) unsafe fn release_all<A: Allocator + ?Sized>(&mut self, parent: &A) {
        // SAFETY: forwarded caller contract.
        unsafe { self.release_from(parent, 0) };
        self.current = 0;
    }

    unsafe fn release_from<A: Allocator + ?Sized>(&mut self, parent: &A, keep: usize) {
        let mut released = 0usize;
        while self.blocks.len() > keep {
            if let Some(block) = self.blocks.pop() {
                // SAFETY: each block is popped, hence released, exactly once.
                unsafe { block.release(parent) };
                released += 1;
            }
        }
        if released > 0 {
            tracing::debug!(released, kept = self.blocks.len(), "released blocks to parent");
        }
    }

    /// Whether `p` points into any block of the chain.
    pub(crate) fn contains(&self, p: NonNull<u8>) -> bool {
        self.blocks.iter().any(|b| b.contains(p))
    }

    /// Bytes handed out across all blocks.
    pub(crate) fn used(&self) -> usize {
        self.blocks.iter().map(Block::used).sum()
    }

    /// Total bytes owned across all blocks.
    pub(crate) fn capacity(&self) -> usize {
        self.blocks.iter().map(Block::capacity).sum()
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }
}
