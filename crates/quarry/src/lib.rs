//! Quarry: composable allocation strategies and allocator-backed containers.
//!
//! This is the top-level facade crate that re-exports the public API from
//! the Quarry sub-crates. For most users, adding `quarry` as a single
//! dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use quarry::prelude::*;
//!
//! let os = OsAllocator::new();
//! let heap = Heap::with_defaults(&os);
//! let arena = Arena::with_defaults(&heap);
//!
//! {
//!     let scope = arena.scope();
//!     let mut names = HashMap::new(&*scope);
//!     names.insert(7u32, 49u64).unwrap();
//!     assert_eq!(names[&7], 49);
//! } // Everything pushed inside the scope is reclaimed here.
//!
//! let mut pool = Pool::new(&heap);
//! let h = pool.allocate("entity").unwrap();
//! assert_eq!(pool[h], "entity");
//! pool.free(h);
//! assert!(pool.get(h).is_none());
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`core`] | `quarry-core` | `Allocator` trait, `ClearFlag`, `AllocError`, alignment |
//! | [`alloc`] | `quarry-alloc` | OS provider, arena, heap, fast, offset allocators |
//! | [`collections`] | `quarry-collections` | `Array`, `HashMap`, `Pool` |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// The allocator capability, error type and alignment helpers
/// (`quarry-core`).
pub use quarry_core as core;

/// Allocation strategies (`quarry-alloc`).
///
/// Every strategy takes its parent allocator at construction; the
/// [`alloc::OsAllocator`] is the usual root.
pub use quarry_alloc as alloc;

/// Allocator-backed containers (`quarry-collections`).
pub use quarry_collections as collections;

/// Common imports for typical Quarry usage.
///
/// ```rust
/// use quarry::prelude::*;
/// ```
pub mod prelude {
    // Capability
    pub use quarry_core::{AllocError, Allocator, ClearFlag, MIN_ALIGN};

    // Strategies
    pub use quarry_alloc::{
        Arena, ArenaConfig, ArenaMarker, ArenaScope, ConfigError, FastAllocator, FastConfig,
        Heap, HeapConfig, OffsetAllocation, OffsetFastAllocator, OffsetHeap, OsAllocator,
    };

    // Containers
    pub use quarry_collections::{Array, Handle, HashMap, Pool};
}
