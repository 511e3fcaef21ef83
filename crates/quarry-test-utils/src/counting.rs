//! Instrumented root allocators.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use indexmap::IndexMap;
use quarry_core::{AllocError, Allocator, ClearFlag, MIN_ALIGN};

/// Root allocator over the global heap that records every live region.
///
/// Regions still live when the allocator drops are returned to the global
/// heap, so a test that forgets to free does not leak.
pub struct CountingAllocator {
    /// Address -> size of every live region, in allocation order.
    live: RefCell<IndexMap<usize, usize>>,
    total: Cell<usize>,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self {
            live: RefCell::new(IndexMap::new()),
            total: Cell::new(0),
        }
    }

    /// Regions allocated and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live.borrow().len()
    }

    /// Bytes in live regions, as requested.
    pub fn live_bytes(&self) -> usize {
        self.live.borrow().values().sum()
    }

    /// Successful allocations over the allocator's lifetime.
    pub fn total_allocations(&self) -> usize {
        self.total.get()
    }

    /// Whether `p` is the start of a live region.
    pub fn is_live(&self, p: NonNull<u8>) -> bool {
        self.live.borrow().contains_key(&(p.as_ptr() as usize))
    }

    fn layout(size: usize) -> Result<Layout, AllocError> {
        Layout::from_size_align(size.max(1), MIN_ALIGN).map_err(|_| AllocError::Overflow)
    }
}

impl Default for CountingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for CountingAllocator {
    fn allocate(&self, size: usize, clear: ClearFlag) -> Result<NonNull<u8>, AllocError> {
        let layout = Self::layout(size)?;
        // SAFETY: `layout` has non-zero size.
        let raw = unsafe {
            if clear.is_clear() {
                alloc::alloc_zeroed(layout)
            } else {
                alloc::alloc(layout)
            }
        };
        let p = NonNull::new(raw).ok_or(AllocError::OutOfMemory { requested: size })?;
        self.live.borrow_mut().insert(p.as_ptr() as usize, size);
        self.total.set(self.total.get() + 1);
        Ok(p)
    }

    unsafe fn free(&self, memory: NonNull<u8>) {
        let size = self
            .live
            .borrow_mut()
            .shift_remove(&(memory.as_ptr() as usize));
        let Some(size) = size else {
            panic!("free of pointer {memory:p} not live in CountingAllocator");
        };
        if let Ok(layout) = Self::layout(size) {
            // SAFETY: `memory` was allocated with this exact layout.
            unsafe { alloc::dealloc(memory.as_ptr(), layout) };
        }
    }
}

impl Drop for CountingAllocator {
    fn drop(&mut self) {
        for (addr, size) in self.live.get_mut().drain(..) {
            if let Ok(layout) = Self::layout(size) {
                // SAFETY: every entry is a live region with this layout.
                unsafe { alloc::dealloc(addr as *mut u8, layout) };
            }
        }
    }
}

/// Allocator that serves `budget` requests and then reports out of memory.
///
/// Successful requests are served by an inner [`CountingAllocator`].
pub struct FailingAllocator {
    inner: CountingAllocator,
    remaining: Cell<usize>,
}

impl FailingAllocator {
    pub fn with_budget(budget: usize) -> Self {
        Self {
            inner: CountingAllocator::new(),
            remaining: Cell::new(budget),
        }
    }

    /// The allocator serving successful requests.
    pub fn inner(&self) -> &CountingAllocator {
        &self.inner
    }

    /// Requests still allowed to succeed.
    pub fn remaining(&self) -> usize {
        self.remaining.get()
    }
}

impl Allocator for FailingAllocator {
    fn allocate(&self, size: usize, clear: ClearFlag) -> Result<NonNull<u8>, AllocError> {
        let remaining = self.remaining.get();
        if remaining == 0 {
            return Err(AllocError::OutOfMemory { requested: size });
        }
        self.remaining.set(remaining - 1);
        self.inner.allocate(size, clear)
    }

    unsafe fn free(&self, memory: NonNull<u8>) {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.free(memory) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_live_and_total() {
        let a = CountingAllocator::new();
        let p = a.allocate(24, ClearFlag::Clear).unwrap();
        let q = a.allocate(8, ClearFlag::NoClear).unwrap();
        assert_eq!(p.as_ptr() as usize % MIN_ALIGN, 0);
        assert_eq!(a.live_bytes(), 32);
        unsafe { a.free(p) };
        assert!(!a.is_live(p));
        assert!(a.is_live(q));
        assert_eq!(a.live_allocations(), 1);
        assert_eq!(a.total_allocations(), 2);
    }

    #[test]
    fn budget_exhausts() {
        let a = FailingAllocator::with_budget(1);
        a.allocate(8, ClearFlag::NoClear).unwrap();
        assert_eq!(
            a.allocate(8, ClearFlag::NoClear),
            Err(AllocError::OutOfMemory { requested: 8 })
        );
        assert_eq!(a.inner().live_allocations(), 1);
    }

    #[test]
    #[should_panic(expected = "not live")]
    fn foreign_free_panics() {
        let a = CountingAllocator::new();
        let mut x = 0u8;
        unsafe { a.free(NonNull::from(&mut x)) };
    }
}
