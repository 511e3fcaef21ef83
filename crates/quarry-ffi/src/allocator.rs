//! Allocator FFI: build allocator trees behind opaque handles.
//!
//! A C caller creates an OS root with [`quarry_os_create`], then stacks
//! arenas, heaps and fast allocators on top of any existing handle. Each
//! child keeps its parent alive through a counted reference, so handles
//! may be destroyed in any order.

use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::rc::Rc;

use quarry_alloc::{Arena, ArenaConfig, FastAllocator, FastConfig, Heap, HeapConfig, OsAllocator};
use quarry_core::Allocator;

use crate::status::QuarryStatus;
use crate::table::HandleTable;
use crate::types::{parse_clear_flag, QuarryArenaMarker};

/// Default arena and heap block size: 1 MiB.
pub const QUARRY_DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Default number of slots per fast allocator slab.
pub const QUARRY_DEFAULT_SLOTS_PER_SLAB: usize = 16 * 1024;

/// Parent reference shared by every child allocator created over FFI.
pub(crate) type SharedAllocator = Rc<dyn Allocator>;

#[derive(Clone)]
pub(crate) enum AllocatorObject {
    Os(Rc<OsAllocator>),
    Arena(Rc<Arena<SharedAllocator>>),
    Heap(Rc<Heap<SharedAllocator>>),
    Fast(Rc<FastAllocator<SharedAllocator>>),
}

impl AllocatorObject {
    fn shared(&self) -> SharedAllocator {
        match self {
            Self::Os(a) => Rc::clone(a) as SharedAllocator,
            Self::Arena(a) => Rc::clone(a) as SharedAllocator,
            Self::Heap(a) => Rc::clone(a) as SharedAllocator,
            Self::Fast(a) => Rc::clone(a) as SharedAllocator,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Os(_) => "os",
            Self::Arena(_) => "arena",
            Self::Heap(_) => "heap",
            Self::Fast(_) => "fast",
        }
    }
}

thread_local! {
    static ALLOCATORS: RefCell<HandleTable<AllocatorObject>> = RefCell::new(HandleTable::new());
}

fn lookup(handle: u64) -> Option<AllocatorObject> {
    ALLOCATORS.with_borrow(|table| table.get(handle).cloned())
}

/// Counted reference to the allocator behind `handle`.
pub(crate) fn shared_allocator(handle: u64) -> Option<SharedAllocator> {
    lookup(handle).map(|object| object.shared())
}

fn register(object: AllocatorObject) -> Result<u64, QuarryStatus> {
    let kind = object.kind();
    let handle = ALLOCATORS
        .with_borrow_mut(|table| table.insert(object))
        .map_err(|e| QuarryStatus::from(&e))?;
    tracing::debug!(handle, kind, "allocator handle created");
    Ok(handle)
}

// ── FFI functions ───────────────────────────────────────────────

/// Create a root allocator backed by OS virtual memory. Returns handle via
/// `out`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_os_create(out: *mut u64) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        match register(AllocatorObject::Os(Rc::new(OsAllocator::new()))) {
            Ok(handle) => {
                // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
                unsafe { *out = handle };
                QuarryStatus::Ok as i32
            }
            Err(status) => status as i32,
        }
    })
}

/// Create an arena drawing `block_size`-byte blocks from `parent`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_arena_create(parent: u64, block_size: usize, out: *mut u64) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        let Some(parent) = shared_allocator(parent) else {
            return QuarryStatus::InvalidHandle as i32;
        };
        let arena = match Arena::new(parent, ArenaConfig::new(block_size)) {
            Ok(arena) => arena,
            Err(e) => return QuarryStatus::from(&e) as i32,
        };
        match register(AllocatorObject::Arena(Rc::new(arena))) {
            Ok(handle) => {
                // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
                unsafe { *out = handle };
                QuarryStatus::Ok as i32
            }
            Err(status) => status as i32,
        }
    })
}

/// Create a free-list heap drawing `block_size`-byte blocks from `parent`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_heap_create(parent: u64, block_size: usize, out: *mut u64) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        let Some(parent) = shared_allocator(parent) else {
            return QuarryStatus::InvalidHandle as i32;
        };
        let heap = match Heap::new(parent, HeapConfig::new(block_size)) {
            Ok(heap) => heap,
            Err(e) => return QuarryStatus::from(&e) as i32,
        };
        match register(AllocatorObject::Heap(Rc::new(heap))) {
            Ok(handle) => {
                // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
                unsafe { *out = handle };
                QuarryStatus::Ok as i32
            }
            Err(status) => status as i32,
        }
    })
}

/// Create a fixed-slot allocator with slabs of `slots_per_slab` slots of
/// `slot_size` bytes drawn from `parent`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_fast_create(
    parent: u64,
    slot_size: usize,
    slots_per_slab: usize,
    out: *mut u64,
) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        let Some(parent) = shared_allocator(parent) else {
            return QuarryStatus::InvalidHandle as i32;
        };
        let fast = match FastAllocator::new(parent, FastConfig::new(slot_size, slots_per_slab)) {
            Ok(fast) => fast,
            Err(e) => return QuarryStatus::from(&e) as i32,
        };
        match register(AllocatorObject::Fast(Rc::new(fast))) {
            Ok(handle) => {
                // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
                unsafe { *out = handle };
                QuarryStatus::Ok as i32
            }
            Err(status) => status as i32,
        }
    })
}

/// Destroy an allocator handle.
///
/// The allocator itself is dropped once no child allocator or pool refers
/// to it; dropping returns all of its memory to its parent.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_allocator_destroy(handle: u64) -> i32 {
    ffi_guard!({
        let removed = ALLOCATORS.with_borrow_mut(|table| table.remove(handle));
        match removed {
            Some(object) => {
                tracing::debug!(handle, kind = object.kind(), "allocator handle destroyed");
                drop(object);
                QuarryStatus::Ok as i32
            }
            None => QuarryStatus::InvalidHandle as i32,
        }
    })
}

/// Allocate `size` bytes. `clear` is a [`QuarryClearFlag`](crate::QuarryClearFlag)
/// value. Returns the address via `out`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_allocate(
    handle: u64,
    size: usize,
    clear: i32,
    out: *mut *mut c_void,
) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        let Some(clear) = parse_clear_flag(clear) else {
            return QuarryStatus::InvalidArgument as i32;
        };
        let Some(allocator) = shared_allocator(handle) else {
            return QuarryStatus::InvalidHandle as i32;
        };
        match allocator.allocate(size, clear) {
            Ok(p) => {
                // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
                unsafe { *out = p.as_ptr().cast() };
                QuarryStatus::Ok as i32
            }
            Err(e) => QuarryStatus::from(&e) as i32,
        }
    })
}

/// Return `ptr` to the allocator behind `handle`.
///
/// `ptr` must come from [`quarry_allocate`] on the same handle and must not
/// have been freed. Heap and fast allocators reject pointers outside their
/// blocks with `InvalidArgument`; for arenas this is a no-op.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_free(handle: u64, ptr: *mut c_void) -> i32 {
    ffi_guard!({
        let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
            return QuarryStatus::InvalidArgument as i32;
        };
        let Some(object) = lookup(handle) else {
            return QuarryStatus::InvalidHandle as i32;
        };
        let owned = match &object {
            AllocatorObject::Heap(heap) => heap.owns(ptr),
            AllocatorObject::Fast(fast) => fast.owns(ptr),
            AllocatorObject::Os(_) | AllocatorObject::Arena(_) => true,
        };
        if !owned {
            return QuarryStatus::InvalidArgument as i32;
        }
        // SAFETY: caller guarantees `ptr` is a live allocation from this
        // handle's allocator.
        unsafe { object.shared().free(ptr) };
        QuarryStatus::Ok as i32
    })
}

/// Capture an arena's fill state. Returns the marker via `out`.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_arena_get_marker(handle: u64, out: *mut QuarryArenaMarker) -> i32 {
    ffi_guard!({
        if out.is_null() {
            return QuarryStatus::InvalidArgument as i32;
        }
        let marker = match lookup(handle) {
            Some(AllocatorObject::Arena(arena)) => arena.marker(),
            Some(_) => return QuarryStatus::Unsupported as i32,
            None => return QuarryStatus::InvalidHandle as i32,
        };
        // SAFETY: `out` is non-null; caller guarantees it is valid and aligned.
        unsafe {
            *out = QuarryArenaMarker {
                block: marker.block() as u64,
                offset: marker.offset() as u64,
            }
        };
        QuarryStatus::Ok as i32
    })
}

/// Rewind an arena to `marker`, returning later blocks to its parent.
///
/// Markers ahead of the arena's current fill state are rejected with
/// `InvalidArgument`. Memory allocated after the marker must not be used
/// afterwards.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_arena_set_marker(handle: u64, marker: QuarryArenaMarker) -> i32 {
    ffi_guard!({
        let arena = match lookup(handle) {
            Some(AllocatorObject::Arena(arena)) => arena,
            Some(_) => return QuarryStatus::Unsupported as i32,
            None => return QuarryStatus::InvalidHandle as i32,
        };
        let (Ok(block), Ok(offset)) = (usize::try_from(marker.block), usize::try_from(marker.offset))
        else {
            return QuarryStatus::InvalidArgument as i32;
        };
        match arena.marker_at(block, offset) {
            Some(marker) => {
                arena.set_marker(marker);
                QuarryStatus::Ok as i32
            }
            None => QuarryStatus::InvalidArgument as i32,
        }
    })
}

/// Forget every allocation while keeping the allocator's blocks.
///
/// Not available on OS allocators.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_allocator_clear(handle: u64, clear: i32) -> i32 {
    ffi_guard!({
        let Some(clear) = parse_clear_flag(clear) else {
            return QuarryStatus::InvalidArgument as i32;
        };
        match lookup(handle) {
            Some(AllocatorObject::Arena(arena)) => arena.clear(clear),
            Some(AllocatorObject::Heap(heap)) => heap.clear(clear),
            Some(AllocatorObject::Fast(fast)) => fast.clear(clear),
            Some(AllocatorObject::Os(_)) => return QuarryStatus::Unsupported as i32,
            None => return QuarryStatus::InvalidHandle as i32,
        }
        QuarryStatus::Ok as i32
    })
}

/// Return every block to the parent. The handle stays valid and the
/// allocator grows again on the next allocation.
///
/// Not available on OS allocators.
#[no_mangle]
#[allow(unsafe_code)]
pub extern "C" fn quarry_allocator_release(handle: u64) -> i32 {
    ffi_guard!({
        match lookup(handle) {
            Some(AllocatorObject::Arena(arena)) => arena.release(),
            Some(AllocatorObject::Heap(heap)) => heap.release(),
            Some(AllocatorObject::Fast(fast)) => fast.release(),
            Some(AllocatorObject::Os(_)) => return QuarryStatus::Unsupported as i32,
            None => return QuarryStatus::InvalidHandle as i32,
        }
        QuarryStatus::Ok as i32
    })
}

#[cfg(all(test, not(miri)))]
mod tests {
    use super::*;
    use crate::types::QuarryClearFlag;

    const OK: i32 = QuarryStatus::Ok as i32;
    const NO_CLEAR: i32 = QuarryClearFlag::NoClear as i32;
    const CLEAR: i32 = QuarryClearFlag::Clear as i32;

    fn os() -> u64 {
        let mut h: u64 = 0;
        assert_eq!(quarry_os_create(&mut h), OK);
        h
    }

    fn alloc(handle: u64, size: usize, clear: i32) -> *mut u8 {
        let mut p: *mut c_void = std::ptr::null_mut();
        assert_eq!(quarry_allocate(handle, size, clear, &mut p), OK);
        p.cast()
    }

    #[test]
    fn default_constants_match_configs() {
        assert_eq!(QUARRY_DEFAULT_BLOCK_SIZE, ArenaConfig::DEFAULT_BLOCK_SIZE);
        assert_eq!(QUARRY_DEFAULT_BLOCK_SIZE, HeapConfig::DEFAULT_BLOCK_SIZE);
        assert_eq!(
            QUARRY_DEFAULT_SLOTS_PER_SLAB,
            FastConfig::DEFAULT_SLOTS_PER_SLAB
        );
    }

    #[test]
    fn create_and_destroy_os() {
        let h = os();
        assert_ne!(h, 0);
        assert_eq!(quarry_allocator_destroy(h), OK);
    }

    #[test]
    fn double_destroy_returns_invalid_handle() {
        let h = os();
        assert_eq!(quarry_allocator_destroy(h), OK);
        assert_eq!(
            quarry_allocator_destroy(h),
            QuarryStatus::InvalidHandle as i32
        );
    }

    #[test]
    fn null_out_returns_invalid_argument() {
        assert_eq!(
            quarry_os_create(std::ptr::null_mut()),
            QuarryStatus::InvalidArgument as i32
        );
        let h = os();
        assert_eq!(
            quarry_allocate(h, 8, NO_CLEAR, std::ptr::null_mut()),
            QuarryStatus::InvalidArgument as i32
        );
        quarry_allocator_destroy(h);
    }

    #[test]
    fn bad_clear_flag_is_rejected() {
        let h = os();
        let mut p: *mut c_void = std::ptr::null_mut();
        assert_eq!(
            quarry_allocate(h, 8, 7, &mut p),
            QuarryStatus::InvalidArgument as i32
        );
        assert!(p.is_null());
        quarry_allocator_destroy(h);
    }

    #[test]
    #[allow(unsafe_code)]
    fn os_allocate_write_free() {
        let h = os();
        let p = alloc(h, 100, CLEAR);
        assert_eq!(p as usize % quarry_core::MIN_ALIGN, 0);
        // SAFETY: 100 freshly committed bytes.
        let bytes = unsafe { std::slice::from_raw_parts_mut(p, 100) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes.fill(0xAB);
        assert_eq!(quarry_free(h, p.cast()), OK);
        quarry_allocator_destroy(h);
    }

    #[test]
    fn zero_block_size_is_config_error() {
        let root = os();
        let mut h: u64 = 0;
        assert_eq!(
            quarry_arena_create(root, 0, &mut h),
            QuarryStatus::ConfigError as i32
        );
        assert_eq!(
            quarry_fast_create(root, 0, 16, &mut h),
            QuarryStatus::ConfigError as i32
        );
        quarry_allocator_destroy(root);
    }

    #[test]
    fn child_of_unknown_parent_is_invalid_handle() {
        let mut h: u64 = 0;
        assert_eq!(
            quarry_heap_create(0, 4096, &mut h),
            QuarryStatus::InvalidHandle as i32
        );
    }

    #[test]
    fn arena_marker_round_trip() {
        let root = os();
        let mut arena: u64 = 0;
        assert_eq!(quarry_arena_create(root, 4096, &mut arena), OK);
        alloc(arena, 32, NO_CLEAR);

        let mut marker = QuarryArenaMarker::default();
        assert_eq!(quarry_arena_get_marker(arena, &mut marker), OK);
        let first = alloc(arena, 256, NO_CLEAR);
        assert_eq!(quarry_arena_set_marker(arena, marker), OK);
        let second = alloc(arena, 256, NO_CLEAR);
        assert_eq!(first, second);

        let ahead = QuarryArenaMarker {
            block: 5,
            offset: 0,
        };
        assert_eq!(
            quarry_arena_set_marker(arena, ahead),
            QuarryStatus::InvalidArgument as i32
        );

        quarry_allocator_destroy(arena);
        quarry_allocator_destroy(root);
    }

    #[test]
    fn marker_ops_on_heap_are_unsupported() {
        let root = os();
        let mut heap: u64 = 0;
        assert_eq!(quarry_heap_create(root, 4096, &mut heap), OK);
        let mut marker = QuarryArenaMarker::default();
        assert_eq!(
            quarry_arena_get_marker(heap, &mut marker),
            QuarryStatus::Unsupported as i32
        );
        assert_eq!(
            quarry_allocator_clear(root, NO_CLEAR),
            QuarryStatus::Unsupported as i32
        );
        quarry_allocator_destroy(heap);
        quarry_allocator_destroy(root);
    }

    #[test]
    fn heap_reuses_freed_chunk_and_rejects_foreign_pointer() {
        let root = os();
        let mut heap: u64 = 0;
        assert_eq!(quarry_heap_create(root, 1024, &mut heap), OK);
        let a = alloc(heap, 64, NO_CLEAR);
        assert_eq!(quarry_free(heap, a.cast()), OK);
        assert_eq!(alloc(heap, 64, NO_CLEAR), a);

        let foreign = alloc(root, 64, NO_CLEAR);
        assert_eq!(
            quarry_free(heap, foreign.cast()),
            QuarryStatus::InvalidArgument as i32
        );
        assert_eq!(quarry_free(root, foreign.cast()), OK);
        quarry_allocator_destroy(heap);
        quarry_allocator_destroy(root);
    }

    #[test]
    fn fast_oversize_request_reports_slot_error() {
        let root = os();
        let mut fast: u64 = 0;
        assert_eq!(quarry_fast_create(root, 32, 8, &mut fast), OK);
        let mut p: *mut c_void = std::ptr::null_mut();
        assert_eq!(
            quarry_allocate(fast, 33, NO_CLEAR, &mut p),
            QuarryStatus::SizeExceedsSlot as i32
        );
        let slot = alloc(fast, 32, NO_CLEAR);
        assert_eq!(quarry_free(fast, slot.cast()), OK);
        quarry_allocator_destroy(fast);
        quarry_allocator_destroy(root);
    }

    #[test]
    fn parent_outlives_its_destroyed_handle() {
        let root = os();
        let mut heap: u64 = 0;
        assert_eq!(quarry_heap_create(root, 4096, &mut heap), OK);
        assert_eq!(quarry_allocator_destroy(root), OK);

        // The heap still draws blocks from the OS root it holds.
        let p = alloc(heap, 128, CLEAR);
        assert_eq!(quarry_free(heap, p.cast()), OK);
        assert_eq!(quarry_allocator_clear(heap, CLEAR), OK);
        assert_eq!(quarry_allocator_release(heap), OK);
        assert_eq!(quarry_allocator_destroy(heap), OK);
    }
}
