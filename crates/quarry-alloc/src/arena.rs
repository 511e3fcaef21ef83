//! Block-chained bump allocator with marker-based scoped rewind.
//!
//! [`Arena`] hands out memory by bumping a cursor through a chain of blocks
//! requested from its parent. Individual frees are no-ops; memory comes back
//! in bulk through [`Arena::set_marker`], [`Arena::clear`] or
//! [`Arena::release`].
//!
//! Markers follow stack discipline: a later marker must be restored or
//! abandoned before an earlier one is restored. [`ArenaScope`] enforces this
//! lexically by restoring its marker on drop.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use quarry_core::{AllocError, Allocator, ClearFlag, MIN_ALIGN};

use crate::block::{BlockChain, ChainPosition};
use crate::config::ArenaConfig;
use crate::error::ConfigError;

/// Counter for unique [`ArenaId`] allocation.
static ARENA_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique per-instance identifier for an [`Arena`].
///
/// Lets [`Arena::set_marker`] reject markers captured from a different
/// arena (checked in debug builds).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ArenaId(u64);

impl ArenaId {
    fn next() -> Self {
        Self(ARENA_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Checkpoint of an [`Arena`]'s fill state.
///
/// Restoring it with [`Arena::set_marker`] returns every block acquired
/// after it to the parent and moves the cursor of the marker's block back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub struct ArenaMarker {
    arena: ArenaId,
    position: ChainPosition,
}

impl ArenaMarker {
    /// Index of the block that was current when the marker was taken.
    pub fn block(&self) -> usize {
        self.position.block
    }

    /// Cursor within that block, in bytes.
    pub fn offset(&self) -> usize {
        self.position.offset
    }
}

/// A bump allocator over blocks requested from a parent allocator.
///
/// # Example
///
/// ```
/// use quarry_alloc::{Arena, ArenaConfig, OsAllocator};
/// use quarry_core::ClearFlag;
///
/// let os = OsAllocator::new();
/// let arena = Arena::new(&os, ArenaConfig::new(4096)).unwrap();
/// let marker = arena.marker();
/// let a = arena.push(128, ClearFlag::Clear).unwrap();
/// arena.set_marker(marker);
/// let b = arena.push(128, ClearFlag::Clear).unwrap();
/// assert_eq!(a, b);
/// ```
pub struct Arena<A: Allocator> {
    parent: A,
    chain: RefCell<BlockChain>,
    id: ArenaId,
}

impl<A: Allocator> Arena<A> {
    /// Create an arena that requests blocks from `parent`.
    ///
    /// No memory is requested until the first push.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid.
    pub fn new(parent: A, config: ArenaConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            parent,
            chain: RefCell::new(BlockChain::new(config.block_size)),
            id: ArenaId::next(),
        })
    }

    /// Create an arena with [`ArenaConfig::DEFAULT_BLOCK_SIZE`] blocks.
    pub fn with_defaults(parent: A) -> Self {
        Self {
            parent,
            chain: RefCell::new(BlockChain::new(ArenaConfig::DEFAULT_BLOCK_SIZE)),
            id: ArenaId::next(),
        }
    }

    /// The allocator this arena requests blocks from.
    pub fn parent(&self) -> &A {
        &self.parent
    }

    /// Bump-allocate `size` bytes aligned to [`MIN_ALIGN`].
    ///
    /// # Errors
    ///
    /// Propagates [`AllocError`] from the parent when a new block is needed
    /// and cannot be obtained.
    pub fn push(&self, size: usize, clear: ClearFlag) -> Result<NonNull<u8>, AllocError> {
        self.push_aligned(size, MIN_ALIGN, clear)
    }

    /// Bump-allocate `size` bytes aligned to `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    ///
    /// # Errors
    ///
    /// As for [`push`](Self::push).
    pub fn push_aligned(
        &self,
        size: usize,
        align: usize,
        clear: ClearFlag,
    ) -> Result<NonNull<u8>, AllocError> {
        assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        let p = self.chain.borrow_mut().bump(&self.parent, size, align)?;
        if clear.is_clear() {
            // SAFETY: `p` is valid for `size` freshly bumped bytes.
            unsafe { ptr::write_bytes(p.as_ptr(), 0, size) };
        }
        Ok(p)
    }

    /// Move `value` into the arena.
    ///
    /// The value is never dropped by the arena; it is forgotten when its
    /// memory is rewound, cleared or released.
    ///
    /// # Errors
    ///
    /// As for [`push`](Self::push).
    pub fn push_value<T>(&self, value: T) -> Result<NonNull<T>, AllocError> {
        let p = self
            .push_aligned(mem::size_of::<T>(), mem::align_of::<T>(), ClearFlag::NoClear)?
            .cast::<T>();
        // SAFETY: `p` is aligned for `T` and valid for `size_of::<T>()` bytes.
        unsafe { p.as_ptr().write(value) };
        Ok(p)
    }

    /// Allocate space for one zero-filled `T`.
    ///
    /// The memory is only a valid `T` if all-zero bytes are a valid `T`.
    ///
    /// # Errors
    ///
    /// As for [`push`](Self::push).
    pub fn push_zeroed<T>(&self) -> Result<NonNull<T>, AllocError> {
        Ok(self
            .push_aligned(mem::size_of::<T>(), mem::align_of::<T>(), ClearFlag::Clear)?
            .cast())
    }

    /// Allocate room for `count` values of `T`.
    ///
    /// # Errors
    ///
    /// [`AllocError::Overflow`] if `count * size_of::<T>()` overflows,
    /// otherwise as for [`push`](Self::push).
    pub fn push_array<T>(&self, count: usize, clear: ClearFlag) -> Result<NonNull<[T]>, AllocError> {
        let size = mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(AllocError::Overflow)?;
        let p = self
            .push_aligned(size, mem::align_of::<T>(), clear)?
            .cast::<T>();
        Ok(NonNull::slice_from_raw_parts(p, count))
    }

    /// Copy `values` into the arena.
    ///
    /// # Errors
    ///
    /// As for [`push_array`](Self::push_array).
    pub fn push_slice<T: Copy>(&self, values: &[T]) -> Result<NonNull<[T]>, AllocError> {
        let dst = self.push_array::<T>(values.len(), ClearFlag::NoClear)?;
        // SAFETY: `dst` is a fresh, aligned region for `values.len()` `T`s
        // and cannot overlap `values`.
        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), dst.cast::<T>().as_ptr(), values.len());
        }
        Ok(dst)
    }

    /// Capture the current fill state.
    pub fn marker(&self) -> ArenaMarker {
        ArenaMarker {
            arena: self.id,
            position: self.chain.borrow().position(),
        }
    }

    /// Rebuild a marker from a block index and offset.
    ///
    /// Returns `None` unless the position is at or behind the current fill
    /// state. Used where markers cross a boundary as plain integers.
    pub fn marker_at(&self, block: usize, offset: usize) -> Option<ArenaMarker> {
        let position = ChainPosition { block, offset };
        self.chain.borrow().is_behind(position).then_some(ArenaMarker {
            arena: self.id,
            position,
        })
    }

    /// Rewind to `marker`.
    ///
    /// Every block acquired after the marker's block goes back to the
    /// parent and the marker's block cursor returns to the marker's offset.
    /// A marker captured on an empty arena keeps the first block, reset to
    /// zero, so scoped loops do not thrash the parent.
    ///
    /// Memory handed out after the marker must not be used afterwards; this
    /// is not checked. Markers must be restored in LIFO order.
    pub fn set_marker(&self, marker: ArenaMarker) {
        debug_assert_eq!(marker.arena, self.id, "marker belongs to another arena");
        let mut chain = self.chain.borrow_mut();
        debug_assert!(
            marker.position.block < chain.len().max(1),
            "marker block {} past chain of {} blocks",
            marker.position.block,
            chain.len()
        );
        // SAFETY: blocks were acquired from `self.parent`; using memory
        // from after the marker is a documented caller contract violation.
        unsafe { chain.restore(&self.parent, marker.position) };
        tracing::trace!(
            block = marker.position.block,
            offset = marker.position.offset,
            "arena rewound to marker"
        );
    }

    /// Open a scope that rewinds the arena when dropped.
    pub fn scope(&self) -> ArenaScope<'_, A> {
        ArenaScope {
            marker: self.marker(),
            arena: self,
        }
    }

    /// Reset the arena without returning blocks to the parent.
    ///
    /// Later pushes refill the retained blocks in order. With
    /// [`ClearFlag::Clear`], the bytes handed out so far are zeroed.
    pub fn clear(&self, clear: ClearFlag) {
        self.chain.borrow_mut().reset(clear);
    }

    /// Return every block to the parent.
    ///
    /// The arena is empty afterwards and grows again on the next push.
    pub fn release(&self) {
        // SAFETY: blocks were acquired from `self.parent`; memory from a
        // released arena must not be used (caller contract).
        unsafe { self.chain.borrow_mut().release_all(&self.parent) };
    }

    /// Bytes handed out since the arena was created, cleared or rewound.
    pub fn used(&self) -> usize {
        self.chain.borrow().used()
    }

    /// Total bytes held in blocks from the parent.
    pub fn capacity(&self) -> usize {
        self.chain.borrow().capacity()
    }

    /// Number of blocks currently owned.
    pub fn block_count(&self) -> usize {
        self.chain.borrow().len()
    }
}

impl<A: Allocator> Allocator for Arena<A> {
    fn allocate(&self, size: usize, clear: ClearFlag) -> Result<NonNull<u8>, AllocError> {
        self.push(size, clear)
    }

    /// No-op: arena memory is reclaimed by markers, `clear` or `release`.
    unsafe fn free(&self, _memory: NonNull<u8>) {}
}

impl<A: Allocator> Drop for Arena<A> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<A: Allocator> fmt::Debug for Arena<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("used", &self.used())
            .field("capacity", &self.capacity())
            .field("blocks", &self.block_count())
            .finish()
    }
}

/// RAII guard that rewinds its arena to the marker taken at creation.
///
/// Scopes nest: an inner scope must be dropped before its outer scope,
/// which the borrow checker enforces when scopes are lexically nested.
#[must_use = "ArenaScope rewinds immediately if not held"]
pub struct ArenaScope<'a, A: Allocator> {
    arena: &'a Arena<A>,
    marker: ArenaMarker,
}

impl<'a, A: Allocator> ArenaScope<'a, A> {
    /// The arena this scope rewinds.
    pub fn arena(&self) -> &'a Arena<A> {
        self.arena
    }

    /// The marker restored on drop.
    pub fn marker(&self) -> ArenaMarker {
        self.marker
    }
}

impl<A: Allocator> std::ops::Deref for ArenaScope<'_, A> {
    type Target = Arena<A>;

    fn deref(&self) -> &Arena<A> {
        self.arena
    }
}

impl<A: Allocator> Drop for ArenaScope<'_, A> {
    fn drop(&mut self) {
        self.arena.set_marker(self.marker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_test_utils::{CountingAllocator, FailingAllocator};

    fn small_arena(parent: &CountingAllocator) -> Arena<&CountingAllocator> {
        Arena::new(parent, ArenaConfig::new(256)).unwrap()
    }

    #[test]
    fn first_push_acquires_block_lazily() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        assert_eq!(parent.total_allocations(), 0);
        arena.push(10, ClearFlag::NoClear).unwrap();
        assert_eq!(parent.total_allocations(), 1);
        assert_eq!(arena.block_count(), 1);
    }

    #[test]
    fn pushes_within_block_do_not_overlap() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        let a = arena.push(40, ClearFlag::NoClear).unwrap().as_ptr() as usize;
        let b = arena.push(40, ClearFlag::NoClear).unwrap().as_ptr() as usize;
        assert!(b >= a + 40);
        assert!(arena.used() <= arena.capacity());
    }

    #[test]
    fn marker_round_trip_without_push_keeps_used() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        arena.push(100, ClearFlag::NoClear).unwrap();
        let used = arena.used();
        let m = arena.marker();
        arena.set_marker(m);
        assert_eq!(arena.used(), used);
    }

    #[test]
    fn rewind_then_push_returns_same_region() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        arena.push(16, ClearFlag::NoClear).unwrap();
        let m = arena.marker();
        let first = arena.push(64, ClearFlag::NoClear).unwrap();
        arena.set_marker(m);
        let second = arena.push(64, ClearFlag::NoClear).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn marker_at_accepts_only_positions_behind_cursor() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        assert!(arena.marker_at(0, 0).is_some());
        assert!(arena.marker_at(0, 16).is_none());

        arena.push(48, ClearFlag::NoClear).unwrap();
        let m = arena.marker();
        assert_eq!(arena.marker_at(m.block(), m.offset()), Some(m));
        assert!(arena.marker_at(0, m.offset() + 1).is_none());
        assert!(arena.marker_at(1, 0).is_none());

        let rebuilt = arena.marker_at(0, 16).unwrap();
        arena.set_marker(rebuilt);
        assert_eq!(arena.used(), 16);
    }

    #[test]
    fn marker_on_empty_arena_keeps_first_block() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        let m = arena.marker();
        let first = arena.push(64, ClearFlag::NoClear).unwrap();
        arena.set_marker(m);
        assert_eq!(arena.used(), 0);
        let second = arena.push(64, ClearFlag::NoClear).unwrap();
        assert_eq!(first, second);
        assert_eq!(parent.total_allocations(), 1);
    }

    #[test]
    fn set_marker_returns_later_blocks_to_parent() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        arena.push(200, ClearFlag::NoClear).unwrap();
        let m = arena.marker();
        arena.push(200, ClearFlag::NoClear).unwrap();
        arena.push(200, ClearFlag::NoClear).unwrap();
        assert_eq!(arena.block_count(), 3);

        arena.set_marker(m);
        assert_eq!(arena.block_count(), 1);
        assert_eq!(parent.live_allocations(), 1);
        assert_eq!(arena.used(), 200);
    }

    #[test]
    fn nested_scopes_rewind_in_order() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        arena.push(32, ClearFlag::NoClear).unwrap();
        {
            let outer = arena.scope();
            outer.push(32, ClearFlag::NoClear).unwrap();
            let after_outer = outer.used();
            {
                let inner = outer.scope();
                inner.push(500, ClearFlag::NoClear).unwrap();
                assert_eq!(arena.block_count(), 2);
            }
            assert_eq!(arena.used(), after_outer);
            assert_eq!(arena.block_count(), 1);
        }
        assert_eq!(arena.used(), 32);
    }

    #[test]
    fn clear_keeps_blocks_and_reuses_them() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        let first = arena.push(200, ClearFlag::NoClear).unwrap();
        arena.push(200, ClearFlag::NoClear).unwrap();
        assert_eq!(parent.total_allocations(), 2);

        arena.clear(ClearFlag::NoClear);
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.block_count(), 2);
        assert_eq!(arena.push(200, ClearFlag::NoClear).unwrap(), first);
        arena.push(200, ClearFlag::NoClear).unwrap();
        assert_eq!(parent.total_allocations(), 2);
    }

    #[test]
    fn clear_flag_zeroes_pushed_memory() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        let p = arena.push(64, ClearFlag::NoClear).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 0xFF, 64) };
        arena.clear(ClearFlag::NoClear);
        let q = arena.push(64, ClearFlag::Clear).unwrap();
        assert_eq!(p, q);
        let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn release_returns_everything() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        arena.push(200, ClearFlag::NoClear).unwrap();
        arena.push(200, ClearFlag::NoClear).unwrap();
        arena.release();
        assert_eq!(parent.live_allocations(), 0);
        assert_eq!(arena.capacity(), 0);
    }

    #[test]
    fn drop_releases_blocks() {
        let parent = CountingAllocator::new();
        {
            let arena = small_arena(&parent);
            arena.push(10, ClearFlag::NoClear).unwrap();
        }
        assert_eq!(parent.live_allocations(), 0);
    }

    #[test]
    fn typed_pushes_are_aligned_and_initialised() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        arena.push(1, ClearFlag::NoClear).unwrap();

        let v = arena.push_value(0x1122_3344_5566_7788u64).unwrap();
        assert_eq!(v.as_ptr() as usize % mem::align_of::<u64>(), 0);
        assert_eq!(unsafe { *v.as_ptr() }, 0x1122_3344_5566_7788);

        let z = arena.push_zeroed::<[u32; 4]>().unwrap();
        assert_eq!(unsafe { *z.as_ptr() }, [0; 4]);

        let s = arena.push_slice(&[1u16, 2, 3]).unwrap();
        assert_eq!(unsafe { s.as_ref() }, &[1, 2, 3]);

        let arr = arena.push_array::<u32>(8, ClearFlag::Clear).unwrap();
        assert_eq!(arr.len(), 8);
        assert!(unsafe { arr.as_ref() }.iter().all(|&x| x == 0));
    }

    #[test]
    fn array_size_overflow_is_reported() {
        let parent = CountingAllocator::new();
        let arena = small_arena(&parent);
        assert_eq!(
            arena.push_array::<u64>(usize::MAX, ClearFlag::NoClear),
            Err(AllocError::Overflow)
        );
    }

    #[test]
    fn parent_out_of_memory_propagates_unchanged() {
        let parent = FailingAllocator::with_budget(1);
        let arena = Arena::new(&parent, ArenaConfig::new(128)).unwrap();
        arena.push(100, ClearFlag::NoClear).unwrap();
        let err = arena.push(100, ClearFlag::NoClear).unwrap_err();
        assert_eq!(err, AllocError::OutOfMemory { requested: 128 });
    }

    #[test]
    fn zero_block_size_rejected() {
        let parent = CountingAllocator::new();
        assert!(Arena::new(&parent, ArenaConfig::new(0)).is_err());
    }

    #[cfg(not(miri))]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn live_pushes_never_overlap(sizes in proptest::collection::vec(0usize..300, 1..40)) {
                let parent = CountingAllocator::new();
                let arena = Arena::new(&parent, ArenaConfig::new(512)).unwrap();
                let mut ranges = Vec::new();
                for &size in &sizes {
                    let p = arena.push(size, ClearFlag::NoClear).unwrap().as_ptr() as usize;
                    ranges.push((p, p + size));
                }
                ranges.sort_unstable();
                for pair in ranges.windows(2) {
                    prop_assert!(pair[0].1 <= pair[1].0);
                }
                prop_assert!(arena.used() <= arena.capacity());
            }

            #[test]
            fn scoped_pushes_leave_used_unchanged(
                before in 0usize..200,
                inside in proptest::collection::vec(1usize..600, 0..10),
            ) {
                let parent = CountingAllocator::new();
                let arena = Arena::new(&parent, ArenaConfig::new(256)).unwrap();
                arena.push(before, ClearFlag::NoClear).unwrap();
                let used = arena.used();
                let blocks = arena.block_count();
                {
                    let scope = arena.scope();
                    for &size in &inside {
                        scope.push(size, ClearFlag::NoClear).unwrap();
                    }
                }
                prop_assert_eq!(arena.used(), used);
                prop_assert_eq!(arena.block_count(), blocks);
            }
        }
    }
}
