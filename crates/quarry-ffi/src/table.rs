//! Per-thread handle tables mapping `u64` handles to owned objects.
//!
//! Each table is a generational [`Pool`] rooted at the OS provider, so a
//! destroyed handle carries a stale generation and resolves to `None`
//! instead of to whatever now occupies its slot. Double-destroy is a safe
//! `InvalidHandle`. Handle `0` is never issued.

use quarry_alloc::OsAllocator;
use quarry_collections::Pool;
use quarry_core::AllocError;

/// Slot+generation table of FFI-owned objects.
pub(crate) struct HandleTable<T> {
    entries: Pool<T, OsAllocator>,
}

impl<T> HandleTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Pool::new(OsAllocator::new()),
        }
    }

    /// Take ownership of `value` and return its handle.
    pub(crate) fn insert(&mut self, value: T) -> Result<u64, AllocError> {
        Ok(self.entries.allocate(value)?.id())
    }

    pub(crate) fn get(&self, handle: u64) -> Option<&T> {
        self.entries.get(self.entries.handle_from_id(handle))
    }

    pub(crate) fn get_mut(&mut self, handle: u64) -> Option<&mut T> {
        let handle = self.entries.handle_from_id(handle);
        self.entries.get_mut(handle)
    }

    /// Give ownership of the value behind `handle` back to the caller.
    pub(crate) fn remove(&mut self, handle: u64) -> Option<T> {
        let handle = self.entries.handle_from_id(handle);
        self.entries.free(handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
