//! Generational pool FFI over `u64` payloads.
//!
//! Pools store their slots in memory from an allocator handle and hand out
//! element handles packed as `(generation << 32) | index`. A freed element
//! handle stays invalid even after its slot is reused.

use std::cell::RefCell;

use quarry_collections::Pool;

use crate::allocator::{shared_allocator, SharedAllocator};
use crate::status::QuarryStatus;
use crate::table::HandleTable;

type FfiPool = Pool<u64, SharedAllocator>;

thread_local! {
    static POOLS: RefCell<HandleTable<FfiPool>> = RefCell::new(HandleTable::new());
}

// ── FFI functions ───────────────────────────────────────────────

/// Create a pool whose slots live in memory from `allocator`.
///
/// `capacity` slots are reserved up front; zero defers the first
/// reservation to the first allocation.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_pool_create(allocator: u64, capacity: usize, out: *mut u64) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        let Some(allocator) = shared_allocator(allocator) else {
            return QuarryStatus::InvalidHandle as i32;
        };
        let pool = match Pool::with_capacity(allocator, capacity) {
            Ok(pool) => pool,
            Err(e) => return QuarryStatus::from(&e) as i32,
        };
        match POOLS.with_borrow_mut(|table| table.insert(pool)) {
            Ok(handle) => {
                // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
                unsafe { *out = handle };
                QuarryStatus::Ok as i32
            }
            Err(e) => QuarryStatus::from(&e) as i32,
        }
    })
}

/// Store `value` and return its element handle via `out`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_pool_allocate(pool: u64, value: u64, out: *mut u64) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        let result = POOLS.with_borrow_mut(|table| table.get_mut(pool).map(|p| p.allocate(value)));
        match result {
            Some(Ok(element)) => {
                // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
                unsafe { *out = element.id() };
                QuarryStatus::Ok as i32
            }
            Some(Err(e)) => QuarryStatus::from(&e) as i32,
            None => QuarryStatus::InvalidHandle as i32,
        }
    })
}

/// Read the value behind `element` into `out`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_pool_get(pool: u64, element: u64, out: *mut u64) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        let value = POOLS.with_borrow(|table| {
            let pool = table.get(pool)?;
            pool.get(pool.handle_from_id(element)).copied()
        });
        match value {
            Some(value) => {
                // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
                unsafe { *out = value };
                QuarryStatus::Ok as i32
            }
            None => QuarryStatus::InvalidHandle as i32,
        }
    })
}

/// Overwrite the value behind `element`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_pool_set(pool: u64, element: u64, value: u64) -> i32 {
    ffi_guard!({
        let stored = POOLS.with_borrow_mut(|table| {
            let pool = table.get_mut(pool)?;
            let handle = pool.handle_from_id(element);
            *pool.get_mut(handle)? = value;
            Some(())
        });
        match stored {
            Some(()) => QuarryStatus::Ok as i32,
            None => QuarryStatus::InvalidHandle as i32,
        }
    })
}

/// Free `element`. Its handle, and every copy of it, becomes invalid.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_pool_free(pool: u64, element: u64) -> i32 {
    ffi_guard!({
        let freed = POOLS.with_borrow_mut(|table| {
            let pool = table.get_mut(pool)?;
            let handle = pool.handle_from_id(element);
            pool.free(handle)
        });
        match freed {
            Some(_) => QuarryStatus::Ok as i32,
            None => QuarryStatus::InvalidHandle as i32,
        }
    })
}

/// Number of live elements, written to `out`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_pool_len(pool: u64, out: *mut usize) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        match POOLS.with_borrow(|table| table.get(pool).map(Pool::len)) {
            Some(len) => {
                // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
                unsafe { *out = len };
                QuarryStatus::Ok as i32
            }
            None => QuarryStatus::InvalidHandle as i32,
        }
    })
}

/// Destroy a pool, returning its slot array to the allocator.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_pool_destroy(pool: u64) -> i32 {
    ffi_guard!({
        let removed = POOLS.with_borrow_mut(|table| table.remove(pool));
        match removed {
            Some(pool) => {
                drop(pool);
                QuarryStatus::Ok as i32
            }
            None => QuarryStatus::InvalidHandle as i32,
        }
    })
}

#[cfg(all(test, not(miri)))]
mod tests {
    use super::*;
    use crate::allocator::{quarry_allocator_destroy, quarry_heap_create, quarry_os_create};

    const OK: i32 = QuarryStatus::Ok as i32;
    const INVALID: i32 = QuarryStatus::InvalidHandle as i32;

    fn heap() -> (u64, u64) {
        let mut os: u64 = 0;
        assert_eq!(quarry_os_create(&mut os), OK);
        let mut heap: u64 = 0;
        assert_eq!(quarry_heap_create(os, 4096, &mut heap), OK);
        (os, heap)
    }

    #[test]
    fn allocate_get_set_free() {
        let (os, heap) = heap();
        let mut pool: u64 = 0;
        assert_eq!(quarry_pool_create(heap, 8, &mut pool), OK);

        let mut e: u64 = 0;
        assert_eq!(quarry_pool_allocate(pool, 17, &mut e), OK);
        let mut v: u64 = 0;
        assert_eq!(quarry_pool_get(pool, e, &mut v), OK);
        assert_eq!(v, 17);
        assert_eq!(quarry_pool_set(pool, e, 99), OK);
        assert_eq!(quarry_pool_get(pool, e, &mut v), OK);
        assert_eq!(v, 99);

        let mut len = 0usize;
        assert_eq!(quarry_pool_len(pool, &mut len), OK);
        assert_eq!(len, 1);

        assert_eq!(quarry_pool_free(pool, e), OK);
        assert_eq!(quarry_pool_free(pool, e), INVALID);
        assert_eq!(quarry_pool_get(pool, e, &mut v), INVALID);

        assert_eq!(quarry_pool_destroy(pool), OK);
        quarry_allocator_destroy(heap);
        quarry_allocator_destroy(os);
    }

    #[test]
    fn stale_element_handle_after_slot_reuse() {
        let (os, heap) = heap();
        let mut pool: u64 = 0;
        assert_eq!(quarry_pool_create(heap, 0, &mut pool), OK);
        let mut first: u64 = 0;
        assert_eq!(quarry_pool_allocate(pool, 1, &mut first), OK);
        assert_eq!(quarry_pool_free(pool, first), OK);
        let mut second: u64 = 0;
        assert_eq!(quarry_pool_allocate(pool, 2, &mut second), OK);

        assert_eq!(first as u32, second as u32);
        assert_ne!(first, second);
        assert_eq!(quarry_pool_set(pool, first, 5), INVALID);
        quarry_pool_destroy(pool);
        quarry_allocator_destroy(heap);
        quarry_allocator_destroy(os);
    }

    #[test]
    fn pool_keeps_destroyed_allocator_alive() {
        let (os, heap) = heap();
        let mut pool: u64 = 0;
        assert_eq!(quarry_pool_create(heap, 4, &mut pool), OK);
        assert_eq!(quarry_allocator_destroy(heap), OK);
        assert_eq!(quarry_allocator_destroy(os), OK);

        let mut e: u64 = 0;
        for i in 0..32 {
            assert_eq!(quarry_pool_allocate(pool, i, &mut e), OK);
        }
        assert_eq!(quarry_pool_destroy(pool), OK);
        assert_eq!(quarry_pool_destroy(pool), INVALID);
    }

    #[test]
    fn unknown_allocator_is_invalid_handle() {
        let mut pool: u64 = 0;
        assert_eq!(quarry_pool_create(12345, 4, &mut pool), INVALID);
    }
}
