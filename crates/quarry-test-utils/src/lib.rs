//! Test utilities and instrumented allocators for Quarry development.
//!
//! Provides [`CountingAllocator`], a root allocator over the global heap
//! that tracks every live region, and [`FailingAllocator`], which runs out
//! of memory after a fixed number of requests. [`fixtures`] holds helpers
//! shared by unit and integration tests.

#![deny(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

mod counting;

pub use counting::{CountingAllocator, FailingAllocator};
pub use fixtures::{init_tracing, ranges_disjoint};
