//! Allocator-backed containers for Quarry.
//!
//! Every container takes its allocator at construction and routes all
//! storage through it, so the same code can run on an arena, a heap, a slab
//! or the OS provider.
//!
//! - [`Array`]: growable contiguous array.
//! - [`HashMap`]: open-addressed hash map with linear probing.
//! - [`Pool`]: generational object pool addressed by [`Handle`]s.
//!
//! Growth failures surface as [`AllocError`](quarry_core::AllocError) and
//! leave the container as it was.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod array;
pub mod hashmap;
pub mod pool;

pub use array::Array;
pub use hashmap::HashMap;
pub use pool::{Handle, Pool, PoolId};
