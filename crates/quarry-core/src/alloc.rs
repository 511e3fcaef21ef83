//! The allocator capability.
//!
//! [`Allocator`] is the minimal contract shared by every strategy: hand out
//! a region, take it back. Strategies are leaf-composable; an arena can sit
//! on a heap which sits on the OS provider, and containers accept any of
//! them.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::AllocError;

/// Whether a freshly handed-out region must be zero-filled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ClearFlag {
    /// Zero the region before returning it.
    Clear,
    /// Return the region with whatever bytes it already holds.
    #[default]
    NoClear,
}

impl ClearFlag {
    /// Whether this flag requests zero-fill.
    #[inline]
    pub fn is_clear(self) -> bool {
        matches!(self, Self::Clear)
    }
}

/// A source of raw byte regions.
///
/// Methods take `&self` so that one allocator can back several containers
/// at once. Implementations keep their bookkeeping in `Cell`/`RefCell` and
/// are not thread-safe: sharing an instance across threads requires
/// external locking.
///
/// Every pointer returned by [`allocate`](Allocator::allocate) is aligned to
/// at least [`MIN_ALIGN`](crate::MIN_ALIGN) and valid for `size` bytes until
/// it is passed to [`free`](Allocator::free) or the allocator is cleared,
/// rewound or released.
pub trait Allocator {
    /// Allocate `size` bytes, zero-filled when `clear` is [`ClearFlag::Clear`].
    ///
    /// A zero-byte request yields a non-null, aligned pointer that must not
    /// be dereferenced. Whether it is distinct from other zero-byte results
    /// depends on the strategy.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] when this allocator or its parent cannot
    /// satisfy the request. The error is propagated unchanged from the
    /// parent; allocators never retry internally.
    fn allocate(&self, size: usize, clear: ClearFlag) -> Result<NonNull<u8>, AllocError>;

    /// Return a region to this allocator.
    ///
    /// # Safety
    ///
    /// `memory` must have been returned by `allocate` on this same
    /// allocator, must not have been freed already, and must not be used
    /// after this call. Double frees corrupt the allocator's free lists.
    unsafe fn free(&self, memory: NonNull<u8>);
}

impl<A: Allocator + ?Sized> Allocator for &A {
    #[inline]
    fn allocate(&self, size: usize, clear: ClearFlag) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate(size, clear)
    }

    #[inline]
    unsafe fn free(&self, memory: NonNull<u8>) {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).free(memory) }
    }
}

impl<A: Allocator + ?Sized> Allocator for Box<A> {
    #[inline]
    fn allocate(&self, size: usize, clear: ClearFlag) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate(size, clear)
    }

    #[inline]
    unsafe fn free(&self, memory: NonNull<u8>) {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).free(memory) }
    }
}

impl<A: Allocator + ?Sized> Allocator for Rc<A> {
    #[inline]
    fn allocate(&self, size: usize, clear: ClearFlag) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate(size, clear)
    }

    #[inline]
    unsafe fn free(&self, memory: NonNull<u8>) {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).free(memory) }
    }
}
