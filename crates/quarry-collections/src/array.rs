//! Growable contiguous array over an explicit allocator.

#![allow(unsafe_code)]

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::slice;

use quarry_core::{AllocError, Allocator, ClearFlag, MIN_ALIGN};

/// Smallest non-zero capacity a growing array jumps to.
const MIN_GROWTH: usize = 4;

/// A growable array whose storage comes from an [`Allocator`].
///
/// Growth doubles the capacity (at least four slots) or jumps
/// straight to the requested size, copies the elements to the new buffer
/// and frees the old one. Growth failures are reported as [`AllocError`]
/// and leave the array unchanged.
///
/// Element types must not need more than [`MIN_ALIGN`] alignment.
/// Zero-sized element types never allocate.
pub struct Array<T, A: Allocator> {
    ptr: NonNull<T>,
    len: usize,
    cap: usize,
    alloc: A,
    _owns: PhantomData<T>,
}

impl<T, A: Allocator> Array<T, A> {
    const ALIGN_OK: () = assert!(
        mem::align_of::<T>() <= MIN_ALIGN,
        "element alignment exceeds allocator alignment"
    );

    const IS_ZST: bool = mem::size_of::<T>() == 0;

    /// Create an empty array. Does not allocate.
    pub fn new(alloc: A) -> Self {
        let () = Self::ALIGN_OK;
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            cap: if Self::IS_ZST { usize::MAX } else { 0 },
            alloc,
            _owns: PhantomData,
        }
    }

    /// Create an empty array with room for `capacity` elements.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's error.
    pub fn with_capacity(alloc: A, capacity: usize) -> Result<Self, AllocError> {
        let mut array = Self::new(alloc);
        array.reserve(capacity)?;
        Ok(array)
    }

    /// Create an array holding clones of `items`.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's error.
    pub fn from_slice(alloc: A, items: &[T]) -> Result<Self, AllocError>
    where
        T: Clone,
    {
        let mut array = Self::with_capacity(alloc, items.len())?;
        array.extend_from_slice(items)?;
        Ok(array)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Elements the current buffer can hold without growing.
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// The allocator backing this array.
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// View the elements as a slice.
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` slots are initialised; `ptr` is dangling
        // but aligned when `len == 0`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// View the elements as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as for `as_slice`, with unique access through `&mut self`.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Append `value`, growing if full.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's error; `value` is dropped.
    pub fn push(&mut self, value: T) -> Result<(), AllocError> {
        if self.len == self.cap {
            self.grow_to(self.len.checked_add(1).ok_or(AllocError::Overflow)?)?;
        }
        // SAFETY: `len < cap` after growing, so the slot is in bounds and
        // uninitialised.
        unsafe { self.ptr.as_ptr().add(self.len).write(value) };
        self.len += 1;
        Ok(())
    }

    /// Append clones of every element of `items`.
    ///
    /// Grows at most once.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's error; nothing is appended.
    pub fn extend_from_slice(&mut self, items: &[T]) -> Result<(), AllocError>
    where
        T: Clone,
    {
        let needed = self.len.checked_add(items.len()).ok_or(AllocError::Overflow)?;
        if needed > self.cap {
            self.grow_to(needed)?;
        }
        for item in items {
            // SAFETY: capacity covers `needed`; `len` advances per write so
            // a panicking clone leaves a consistent array.
            unsafe { self.ptr.as_ptr().add(self.len).write(item.clone()) };
            self.len += 1;
        }
        Ok(())
    }

    /// Remove and return the last element.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // SAFETY: slot `len` was initialised and is now outside the array.
        Some(unsafe { self.ptr.as_ptr().add(self.len).read() })
    }

    /// Drop elements past `len`. No-op if the array is already shorter.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        let tail = self.len - len;
        self.len = len;
        // SAFETY: the `tail` slots after `len` are initialised and no
        // longer part of the array.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr().add(len),
                tail,
            ));
        }
    }

    /// Drop every element, keeping the buffer.
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Drop every element and return the buffer to the allocator.
    ///
    /// The array is empty afterwards and grows again on the next push.
    pub fn release(&mut self) {
        self.clear();
        self.free_buffer();
        self.ptr = NonNull::dangling();
        if !Self::IS_ZST {
            self.cap = 0;
        }
    }

    /// Ensure room for exactly `additional` more elements.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's error; the array is unchanged.
    pub fn reserve(&mut self, additional: usize) -> Result<(), AllocError> {
        let needed = self.len.checked_add(additional).ok_or(AllocError::Overflow)?;
        if needed > self.cap {
            self.reallocate(needed)?;
        }
        Ok(())
    }

    /// Resize to `len`, filling new slots with clones of `value`.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's error; the array is unchanged.
    pub fn resize(&mut self, len: usize, value: T) -> Result<(), AllocError>
    where
        T: Clone,
    {
        self.resize_with(len, || value.clone())
    }

    /// Resize to `len`, filling new slots with the results of `fill`.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's error; the array is unchanged.
    pub fn resize_with<F>(&mut self, len: usize, mut fill: F) -> Result<(), AllocError>
    where
        F: FnMut() -> T,
    {
        if len <= self.len {
            self.truncate(len);
            return Ok(());
        }
        if len > self.cap {
            self.grow_to(len)?;
        }
        while self.len < len {
            // SAFETY: `len <= cap`, slot is uninitialised.
            unsafe { self.ptr.as_ptr().add(self.len).write(fill()) };
            self.len += 1;
        }
        Ok(())
    }

    /// Swap in a fresh buffer of exactly `len` elements produced by `fill`,
    /// then move every old element, in order, into `place` along with the
    /// new contents. The old buffer is freed afterwards.
    ///
    /// Used for rehashing, where the new layout depends on each element.
    pub(crate) fn rebuild_with<F, P>(
        &mut self,
        len: usize,
        mut fill: F,
        mut place: P,
    ) -> Result<(), AllocError>
    where
        F: FnMut() -> T,
        P: FnMut(T, &mut [T]),
    {
        let old_ptr = self.ptr;
        let old_len = self.len;
        let old_cap = self.cap;

        let fresh = if Self::IS_ZST || len == 0 {
            NonNull::dangling()
        } else {
            let bytes = len
                .checked_mul(mem::size_of::<T>())
                .ok_or(AllocError::Overflow)?;
            self.alloc.allocate(bytes, ClearFlag::NoClear)?.cast::<T>()
        };
        for i in 0..len {
            // SAFETY: `fresh` holds `len` slots; each is written once.
            unsafe { fresh.as_ptr().add(i).write(fill()) };
        }

        self.ptr = fresh;
        self.len = len;
        if !Self::IS_ZST {
            self.cap = len;
        }
        for i in 0..old_len {
            // SAFETY: old slot `i` is initialised and read exactly once; the
            // old buffer is no longer reachable through `self`.
            let item = unsafe { old_ptr.as_ptr().add(i).read() };
            place(item, self.as_mut_slice());
        }
        if !Self::IS_ZST && old_cap > 0 {
            // SAFETY: a non-zero capacity means `old_ptr` came from `alloc`.
            unsafe { self.alloc.free(old_ptr.cast()) };
        }
        Ok(())
    }

    /// Grow to hold at least `needed` elements using the doubling policy.
    fn grow_to(&mut self, needed: usize) -> Result<(), AllocError> {
        let doubled = self.cap.saturating_mul(2).max(MIN_GROWTH);
        self.reallocate(doubled.max(needed))
    }

    fn reallocate(&mut self, new_cap: usize) -> Result<(), AllocError> {
        if Self::IS_ZST {
            return Ok(());
        }
        let bytes = new_cap
            .checked_mul(mem::size_of::<T>())
            .ok_or(AllocError::Overflow)?;
        let fresh = self.alloc.allocate(bytes, ClearFlag::NoClear)?.cast::<T>();
        // SAFETY: the new buffer holds `new_cap >= len` elements and is
        // disjoint from the old one.
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr(), fresh.as_ptr(), self.len) };
        tracing::debug!(from = self.cap, to = new_cap, "array buffer grown");
        self.free_buffer();
        self.ptr = fresh;
        self.cap = new_cap;
        Ok(())
    }

    fn free_buffer(&mut self) {
        if !Self::IS_ZST && self.cap > 0 {
            // SAFETY: a non-zero capacity means `ptr` came from `alloc`.
            unsafe { self.alloc.free(self.ptr.cast()) };
        }
    }
}

impl<T, A: Allocator> Drop for Array<T, A> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T, A: Allocator> Deref for Array<T, A> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T, A: Allocator> DerefMut for Array<T, A> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<'a, T, A: Allocator> IntoIterator for &'a Array<T, A> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

impl<'a, T, A: Allocator> IntoIterator for &'a mut Array<T, A> {
    type Item = &'a mut T;
    type IntoIter = slice::IterMut<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_mut_slice().iter_mut()
    }
}

impl<T: fmt::Debug, A: Allocator> fmt::Debug for Array<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}
