//! Size-classed free-list heap over a chain of parent blocks.
//!
//! Every chunk is a 16-byte [`ChunkHeader`] followed by a payload whose size
//! is the power-of-two class of the request. Freed chunks are pushed onto
//! their class's intrusive free list (the `next` link lives in the payload)
//! and are handed out again before any fresh bump. Chunks are never split
//! or coalesced.

#![allow(unsafe_code)]

use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};

use quarry_core::{AllocError, Allocator, ClearFlag, MIN_ALIGN};

use crate::block::BlockChain;
use crate::config::HeapConfig;
use crate::error::ConfigError;
use crate::size_class::{class_for, class_size, CLASS_COUNT};

const LIVE_CANARY: u32 = 0x4C49_5645;
const FREE_CANARY: u32 = 0xF4EE_F4EE;

/// Per-chunk bookkeeping written just before the payload.
#[repr(C)]
struct ChunkHeader {
    class: u32,
    canary: u32,
    _reserved: u64,
}

const HEADER: usize = mem::size_of::<ChunkHeader>();

const _: () = assert!(HEADER == MIN_ALIGN);

type FreeLink = Option<NonNull<u8>>;

/// General-purpose allocator with one free list per power-of-two class.
///
/// `allocate` pops the class's free list if it is non-empty, otherwise bumps
/// a new chunk out of the current block, moving on to retained blocks and
/// finally to a new block from the parent. `free` is O(1).
///
/// Freed chunks keep their class forever; a heap that serves many different
/// sizes over its lifetime fragments accordingly. Use [`clear`](Self::clear)
/// between phases to reset it without returning blocks.
pub struct Heap<A: Allocator> {
    parent: A,
    chain: RefCell<BlockChain>,
    free_lists: RefCell<[FreeLink; CLASS_COUNT]>,
    live: Cell<usize>,
}

impl<A: Allocator> Heap<A> {
    /// Create a heap that requests blocks from `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid.
    pub fn new(parent: A, config: HeapConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(parent, config.block_size))
    }

    /// Create a heap with [`HeapConfig::DEFAULT_BLOCK_SIZE`] blocks.
    pub fn with_defaults(parent: A) -> Self {
        Self::build(parent, HeapConfig::DEFAULT_BLOCK_SIZE)
    }

    fn build(parent: A, block_size: usize) -> Self {
        Self {
            parent,
            chain: RefCell::new(BlockChain::new(block_size)),
            free_lists: RefCell::new([None; CLASS_COUNT]),
            live: Cell::new(0),
        }
    }

    /// The allocator this heap requests blocks from.
    pub fn parent(&self) -> &A {
        &self.parent
    }

    /// Reset the heap, keeping its blocks for reuse.
    ///
    /// Every outstanding allocation becomes invalid. With
    /// [`ClearFlag::Clear`], all bytes handed out so far are zeroed.
    pub fn clear(&self, clear: ClearFlag) {
        self.chain.borrow_mut().reset(clear);
        *self.free_lists.borrow_mut() = [None; CLASS_COUNT];
        self.live.set(0);
    }

    /// Return every block to the parent.
    pub fn release(&self) {
        *self.free_lists.borrow_mut() = [None; CLASS_COUNT];
        // SAFETY: blocks came from `self.parent`; using memory from a
        // released heap is a caller contract violation.
        unsafe { self.chain.borrow_mut().release_all(&self.parent) };
        self.live.set(0);
    }

    /// Whether `p` lies inside a block owned by this heap.
    pub fn owns(&self, p: NonNull<u8>) -> bool {
        self.chain.borrow().contains(p)
    }

    /// Number of allocations not yet freed.
    pub fn live(&self) -> usize {
        self.live.get()
    }

    /// Bytes bumped out of blocks, headers included.
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

    /// Length of the free list for `class`. Walks the list.
    ///
    /// # Panics
    ///
    /// Panics if `class >= CLASS_COUNT`.
    pub fn free_count(&self, class: u32) -> usize {
        let mut count = 0;
        let mut cursor = self.free_lists.borrow()[class as usize];
        while let Some(p) = cursor {
            count += 1;
            // SAFETY: every node on a free list is a freed payload whose
            // first word holds the next link.
            cursor = unsafe { p.cast::<FreeLink>().as_ptr().read() };
        }
        count
    }

    fn bump_chunk(&self, class: u32, payload: usize) -> Result<NonNull<u8>, AllocError> {
        let chunk_len = HEADER.checked_add(payload).ok_or(AllocError::Overflow)?;
        let chunk = self
            .chain
            .borrow_mut()
            .bump(&self.parent, chunk_len, MIN_ALIGN)?;
        // SAFETY: `chunk` is MIN_ALIGN-aligned and valid for `chunk_len`
        // bytes, so the header fits and the payload starts inside it.
        unsafe {
            chunk.cast::<ChunkHeader>().as_ptr().write(ChunkHeader {
                class,
                canary: LIVE_CANARY,
                _reserved: 0,
            });
            Ok(NonNull::new_unchecked(chunk.as_ptr().add(HEADER)))
        }
    }
}

/// Header of the chunk whose payload starts at `payload`.
///
/// # Safety
///
/// `payload` must have been returned by a [`Heap`].
unsafe fn header_of(payload: NonNull<u8>) -> *mut ChunkHeader {
    // SAFETY: every heap payload is preceded by its header.
    unsafe { payload.as_ptr().sub(HEADER).cast() }
}

impl<A: Allocator> Allocator for Heap<A> {
    fn allocate(&self, size: usize, clear: ClearFlag) -> Result<NonNull<u8>, AllocError> {
        let class = class_for(size as u64).ok_or(AllocError::Overflow)?;
        let payload = usize::try_from(class_size(class)).map_err(|_| AllocError::Overflow)?;

        let reused = {
            let mut lists = self.free_lists.borrow_mut();
            let head = lists[class as usize];
            if let Some(p) = head {
                // SAFETY: `p` heads the free list, so it is a freed payload
                // of this class holding the next link in its first word.
                unsafe {
                    lists[class as usize] = p.cast::<FreeLink>().as_ptr().read();
                    let header = header_of(p);
                    debug_assert_eq!((*header).canary, FREE_CANARY, "free list corrupted");
                    (*header).canary = LIVE_CANARY;
                }
            }
            head
        };

        let p = match reused {
            Some(p) => p,
            None => self.bump_chunk(class, payload)?,
        };
        if clear.is_clear() {
            // SAFETY: the payload is valid for `payload >= size` bytes.
            unsafe { ptr::write_bytes(p.as_ptr(), 0, size) };
        }
        self.live.set(self.live.get() + 1);
        Ok(p)
    }

    unsafe fn free(&self, memory: NonNull<u8>) {
        debug_assert!(self.owns(memory), "pointer not owned by this heap");
        // SAFETY: caller guarantees `memory` came from this heap and is
        // live, so its header is intact.
        unsafe {
            let header = header_of(memory);
            debug_assert_eq!(
                (*header).canary,
                LIVE_CANARY,
                "double free or foreign pointer"
            );
            (*header).canary = FREE_CANARY;
            let class = (*header).class as usize;
            let mut lists = self.free_lists.borrow_mut();
            memory.cast::<FreeLink>().as_ptr().write(lists[class]);
            lists[class] = Some(memory);
        }
        self.live.set(self.live.get().saturating_sub(1));
    }
}

impl<A: Allocator> Drop for Heap<A> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<A: Allocator> fmt::Debug for Heap<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("live", &self.live())
            .field("used", &self.used())
            .field("capacity", &self.capacity())
            .field("blocks", &self.block_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_test_utils::{CountingAllocator, FailingAllocator};

    fn heap(parent: &CountingAllocator, block: usize) -> Heap<&CountingAllocator> {
        Heap::new(parent, HeapConfig::new(block)).unwrap()
    }

    #[test]
    fn freed_chunk_is_reused_before_bumping() {
        let parent = CountingAllocator::new();
        let heap = heap(&parent, 1024);
        let a = heap.allocate(64, ClearFlag::NoClear).unwrap();
        let b = heap.allocate(64, ClearFlag::NoClear).unwrap();
        let (a_addr, b_addr) = (a.as_ptr() as usize, b.as_ptr() as usize);
        assert!(a_addr + 64 <= b_addr || b_addr + 64 <= a_addr);

        unsafe { heap.free(a) };
        let c = heap.allocate(64, ClearFlag::NoClear).unwrap();
        assert_eq!(c, a);
        assert_eq!(parent.total_allocations(), 1);
        assert_eq!(heap.block_count(), 1);
    }

    #[test]
    fn classes_have_separate_free_lists() {
        let parent = CountingAllocator::new();
        let heap = heap(&parent, 1024);
        let small = heap.allocate(16, ClearFlag::NoClear).unwrap();
        unsafe { heap.free(small) };
        assert_eq!(heap.free_count(0), 1);

        let big = heap.allocate(100, ClearFlag::NoClear).unwrap();
        assert_ne!(big, small);
        assert_eq!(heap.free_count(0), 1);
    }

    #[test]
    fn allocations_are_min_aligned_and_owned() {
        let parent = CountingAllocator::new();
        let heap = heap(&parent, 256);
        for size in [0, 1, 15, 16, 17, 200, 1000] {
            let p = heap.allocate(size, ClearFlag::NoClear).unwrap();
            assert_eq!(p.as_ptr() as usize % MIN_ALIGN, 0);
            assert!(heap.owns(p));
        }
    }

    #[test]
    fn clear_flag_zeroes_reused_chunk() {
        let parent = CountingAllocator::new();
        let heap = heap(&parent, 1024);
        let p = heap.allocate(48, ClearFlag::NoClear).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 0xCD, 48) };
        unsafe { heap.free(p) };
        let q = heap.allocate(48, ClearFlag::Clear).unwrap();
        assert_eq!(p, q);
        let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), 48) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn clear_resets_free_lists_and_keeps_blocks() {
        let parent = CountingAllocator::new();
        let heap = heap(&parent, 128);
        let first = heap.allocate(64, ClearFlag::NoClear).unwrap();
        let freed = heap.allocate(64, ClearFlag::NoClear).unwrap();
        unsafe { heap.free(freed) };
        assert_eq!(heap.block_count(), 2);

        heap.clear(ClearFlag::NoClear);
        assert_eq!(heap.live(), 0);
        assert_eq!(heap.free_count(class_for(64).unwrap()), 0);
        assert_eq!(heap.allocate(64, ClearFlag::NoClear).unwrap(), first);
        assert_eq!(parent.total_allocations(), 2);
    }

    #[test]
    fn release_and_drop_return_blocks() {
        let parent = CountingAllocator::new();
        {
            let heap = heap(&parent, 128);
            heap.allocate(500, ClearFlag::NoClear).unwrap();
            heap.allocate(10, ClearFlag::NoClear).unwrap();
            heap.release();
            assert_eq!(parent.live_allocations(), 0);
            heap.allocate(10, ClearFlag::NoClear).unwrap();
        }
        assert_eq!(parent.live_allocations(), 0);
    }

    #[test]
    fn parent_out_of_memory_propagates() {
        let parent = FailingAllocator::with_budget(0);
        let heap = Heap::new(&parent, HeapConfig::new(64)).unwrap();
        assert!(heap.allocate(8, ClearFlag::NoClear).unwrap_err().is_out_of_memory());
    }

    #[test]
    fn huge_request_overflows() {
        let parent = CountingAllocator::new();
        let heap = heap(&parent, 64);
        assert_eq!(
            heap.allocate(usize::MAX, ClearFlag::NoClear),
            Err(AllocError::Overflow)
        );
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_detected_in_debug() {
        let parent = CountingAllocator::new();
        let heap = heap(&parent, 256);
        let p = heap.allocate(32, ClearFlag::NoClear).unwrap();
        unsafe {
            heap.free(p);
            heap.free(p);
        }
    }

    #[cfg(not(miri))]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Debug)]
        enum Op {
            Alloc(usize),
            Free(usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0usize..600).prop_map(Op::Alloc),
                any::<usize>().prop_map(Op::Free),
            ]
        }

        proptest! {
            #[test]
            fn live_chunks_never_overlap(ops in proptest::collection::vec(op(), 1..80)) {
                let parent = CountingAllocator::new();
                let heap = Heap::new(&parent, HeapConfig::new(512)).unwrap();
                let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
                for op in ops {
                    match op {
                        Op::Alloc(size) => {
                            let p = heap.allocate(size, ClearFlag::NoClear).unwrap();
                            prop_assert!(heap.owns(p));
                            live.push((p, size));
                        }
                        Op::Free(i) if !live.is_empty() => {
                            let (p, _) = live.swap_remove(i % live.len());
                            unsafe { heap.free(p) };
                        }
                        Op::Free(_) => {}
                    }
                    let mut ranges: Vec<(usize, usize)> = live
                        .iter()
                        .map(|&(p, n)| (p.as_ptr() as usize, p.as_ptr() as usize + n))
                        .collect();
                    ranges.sort_unstable();
                    for pair in ranges.windows(2) {
                        prop_assert!(pair[0].1 <= pair[1].0);
                    }
                }
                prop_assert_eq!(heap.live(), live.len());
            }
        }
    }
}
