//! Containers running on the real allocation strategies.

use quarry_alloc::{Arena, ArenaConfig, FastAllocator, FastConfig, Heap, HeapConfig, OsAllocator};
use quarry_collections::{Array, HashMap, Pool};
use quarry_core::{Allocator, ClearFlag};
use quarry_test_utils::{init_tracing, ranges_disjoint, CountingAllocator, FailingAllocator};

#[test]
fn array_on_heap_on_os() {
    init_tracing();
    let os = OsAllocator::new();
    let heap = Heap::new(&os, HeapConfig::new(64 * 1024)).unwrap();
    let mut array = Array::new(&heap);
    for i in 0..1000u32 {
        array.push(i).unwrap();
    }
    assert!(array.iter().copied().eq(0..1000));
    array.clear();
    assert!(array.is_empty());
    array.release();
    assert_eq!(heap.live(), 0);
}

#[test]
fn growth_frees_old_buffer_into_heap_free_list() {
    let parent = CountingAllocator::new();
    let heap = Heap::new(&parent, HeapConfig::new(4096)).unwrap();
    let mut array = Array::new(&heap);
    for i in 0..4u64 {
        array.push(i).unwrap();
    }
    array.push(4).unwrap();
    // Only the grown buffer is live; the 4-slot buffer went back to the heap.
    assert_eq!(heap.live(), 1);
}

#[test]
fn hash_map_in_scoped_arena() {
    let parent = CountingAllocator::new();
    let arena = Arena::new(&parent, ArenaConfig::new(16 * 1024)).unwrap();
    let used = arena.used();
    {
        let scope = arena.scope();
        let mut map = HashMap::new(&*scope);
        for k in 0..200u32 {
            map.insert(k, k * 2).unwrap();
        }
        for k in 0..200u32 {
            assert_eq!(map[&k], k * 2);
        }
    }
    assert_eq!(arena.used(), used);
}

#[test]
fn pool_on_fast_allocator() {
    let parent = CountingAllocator::new();
    let fast = FastAllocator::new(&parent, FastConfig::new(4096, 4)).unwrap();
    let mut pool = Pool::with_capacity(&fast, 64).unwrap();
    let handles: Vec<_> = (0..64).map(|i| pool.allocate(i).unwrap()).collect();
    for (i, &h) in handles.iter().enumerate() {
        assert_eq!(pool[h], i);
    }
    assert_eq!(fast.live(), 1);
}

#[test]
fn parent_out_of_memory_reaches_container_unchanged() {
    let parent = FailingAllocator::with_budget(0);
    let heap = Heap::new(&parent, HeapConfig::new(1024)).unwrap();
    let mut array: Array<u8, _> = Array::new(&heap);
    let err = array.push(1).unwrap_err();
    assert!(err.is_out_of_memory());
    assert!(array.is_empty());
}

#[test]
fn heap_concrete_reuse_scenario() {
    let parent = CountingAllocator::new();
    let heap = Heap::new(&parent, HeapConfig::new(1024)).unwrap();
    let a = heap.allocate(64, ClearFlag::NoClear).unwrap();
    let b = heap.allocate(64, ClearFlag::NoClear).unwrap();
    let ranges = [
        (a.as_ptr() as usize, a.as_ptr() as usize + 64),
        (b.as_ptr() as usize, b.as_ptr() as usize + 64),
    ];
    assert!(ranges_disjoint(&ranges));
    unsafe { heap.free(a) };
    assert_eq!(heap.allocate(64, ClearFlag::NoClear).unwrap(), a);
    assert_eq!(parent.total_allocations(), 1);
}

#[test]
fn scoped_reuse_returns_identical_region() {
    let os = OsAllocator::new();
    let arena = Arena::with_defaults(&os);
    arena.push(24, ClearFlag::NoClear).unwrap();
    let marker = arena.marker();
    let first = arena.push(256, ClearFlag::Clear).unwrap();
    arena.set_marker(marker);
    let second = arena.push(256, ClearFlag::Clear).unwrap();
    assert_eq!(first, second);
}
