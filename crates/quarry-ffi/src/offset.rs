//! Offset allocator FFI: sub-allocate an externally owned buffer by offset.
//!
//! These allocators never touch memory, so they need no parent handle.
//! Allocation records cross the boundary by value as
//! [`QuarryOffsetAllocation`]; records that are not currently live on the
//! given allocator (never handed out, already freed, or malformed) are
//! rejected before any bookkeeping changes.

use std::cell::RefCell;

use quarry_alloc::{OffsetAllocation, OffsetFastAllocator, OffsetHeap};
use quarry_core::AllocError;

use crate::status::QuarryStatus;
use crate::table::HandleTable;
use crate::types::QuarryOffsetAllocation;

enum OffsetObject {
    Heap(OffsetHeap),
    Fast(OffsetFastAllocator),
}

impl OffsetObject {
    fn allocate(&mut self, size: u64) -> Result<OffsetAllocation, AllocError> {
        match self {
            Self::Heap(heap) => heap.allocate(size),
            Self::Fast(fast) => fast.allocate(size),
        }
    }

    /// Whether `a` is a live record of this allocator.
    fn accepts(&self, a: &OffsetAllocation) -> bool {
        match self {
            Self::Heap(heap) => heap.is_live(a),
            Self::Fast(fast) => fast.is_live(a),
        }
    }

    fn free(&mut self, a: OffsetAllocation) {
        match self {
            Self::Heap(heap) => heap.free(a),
            Self::Fast(fast) => fast.free(a),
        }
    }

    fn clear(&mut self) {
        match self {
            Self::Heap(heap) => heap.clear(),
            Self::Fast(fast) => fast.clear(),
        }
    }
}

thread_local! {
    static OFFSET_ALLOCATORS: RefCell<HandleTable<OffsetObject>> =
        RefCell::new(HandleTable::new());
}

fn register(object: OffsetObject) -> Result<u64, QuarryStatus> {
    OFFSET_ALLOCATORS
        .with_borrow_mut(|table| table.insert(object))
        .map_err(|e| QuarryStatus::from(&e))
}

// ── FFI functions ───────────────────────────────────────────────

/// Create a size-classed offset heap over `[0, heap_size)`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_offset_heap_create(heap_size: u64, out: *mut u64) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        match register(OffsetObject::Heap(OffsetHeap::new(heap_size))) {
            Ok(handle) => {
                // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
                unsafe { *out = handle };
                QuarryStatus::Ok as i32
            }
            Err(status) => status as i32,
        }
    })
}

/// Create a fixed-slot offset allocator over `[0, heap_size)`.
///
/// A zero `slot_size` is rejected with `ConfigError`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_offset_fast_create(heap_size: u64, slot_size: u64, out: *mut u64) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        if slot_size == 0 {
            return QuarryStatus::ConfigError as i32;
        }
        let fast = OffsetFastAllocator::new(heap_size, slot_size);
        match register(OffsetObject::Fast(fast)) {
            Ok(handle) => {
                // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
                unsafe { *out = handle };
                QuarryStatus::Ok as i32
            }
            Err(status) => status as i32,
        }
    })
}

/// Reserve a range of at least `size` units. Returns the record via `out`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_offset_allocate(
    handle: u64,
    size: u64,
    out: *mut QuarryOffsetAllocation,
) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        let result = OFFSET_ALLOCATORS
            .with_borrow_mut(|table| table.get_mut(handle).map(|object| object.allocate(size)));
        match result {
            Some(Ok(allocation)) => {
                // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
                unsafe { *out = allocation.into() };
                QuarryStatus::Ok as i32
            }
            Some(Err(e)) => QuarryStatus::from(&e) as i32,
            None => QuarryStatus::InvalidHandle as i32,
        }
    })
}

/// Return a range previously reserved on `handle`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_offset_free(handle: u64, allocation: QuarryOffsetAllocation) -> i32 {
    ffi_guard!({
        let allocation = OffsetAllocation::from(allocation);
        OFFSET_ALLOCATORS.with_borrow_mut(|table| match table.get_mut(handle) {
            Some(object) if object.accepts(&allocation) => {
                object.free(allocation);
                QuarryStatus::Ok as i32
            }
            Some(_) => QuarryStatus::InvalidArgument as i32,
            None => QuarryStatus::InvalidHandle as i32,
        })
    })
}

/// Forget every range reserved on `handle`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_offset_clear(handle: u64) -> i32 {
    ffi_guard!({
        OFFSET_ALLOCATORS.with_borrow_mut(|table| match table.get_mut(handle) {
            Some(object) => {
                object.clear();
                QuarryStatus::Ok as i32
            }
            None => QuarryStatus::InvalidHandle as i32,
        })
    })
}

/// Destroy an offset allocator handle.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_offset_destroy(handle: u64) -> i32 {
    ffi_guard!({
        match OFFSET_ALLOCATORS.with_borrow_mut(|table| table.remove(handle)) {
            Some(_) => QuarryStatus::Ok as i32,
            None => QuarryStatus::InvalidHandle as i32,
        }
    })
}


#[cfg(all(test, not(miri)))]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn create(heap: bool) -> u64 {
        let mut h: u64 = 0;
        let status = if heap {
            quarry_offset_heap_create(4096, &mut h)
        } else {
            quarry_offset_fast_create(4096, 48, &mut h)
        };
        assert_eq!(status, QuarryStatus::Ok as i32);
        h
    }

    proptest! {
        #[test]
        fn offset_ranges_stay_disjoint_through_the_c_surface(
            heap in any::<bool>(),
            ops in proptest::collection::vec((0u8..4, 0u64..=48, any::<usize>()), 1..120),
        ) {
            let h = create(heap);
            let mut live: Vec<QuarryOffsetAllocation> = Vec::new();
            let mut freed: Vec<QuarryOffsetAllocation> = Vec::new();
            for (op, size, pick) in ops {
                match op {
                    0 | 1 => {
                        let mut a = QuarryOffsetAllocation::default();
                        if quarry_offset_allocate(h, size, &mut a) == QuarryStatus::Ok as i32 {
                            freed.retain(|f| f.offset != a.offset);
                            live.push(a);
                        }
                    }
                    2 if !live.is_empty() => {
                        let a = live.swap_remove(pick % live.len());
                        prop_assert_eq!(quarry_offset_free(h, a), QuarryStatus::Ok as i32);
                        freed.push(a);
                    }
                    _ if !freed.is_empty() => {
                        let a = freed[pick % freed.len()];
                        prop_assert_eq!(
                            quarry_offset_free(h, a),
                            QuarryStatus::InvalidArgument as i32
                        );
                    }
                    _ => {}
                }
                let mut ranges: Vec<_> = live.iter().map(|a| (a.offset, a.offset + a.size)).collect();
                ranges.sort_unstable();
                prop_assert!(ranges.iter().all(|&(_, end)| end <= 4096));
                prop_assert!(ranges.windows(2).all(|w| w[0].1 <= w[1].0));
            }
            prop_assert_eq!(quarry_offset_destroy(h), QuarryStatus::Ok as i32);
        }
    }
}
