//! Allocation strategies for Quarry.
//!
//! Every strategy implements [`Allocator`](quarry_core::Allocator) and is
//! constructed with an explicit parent allocator from which it requests its
//! blocks, so strategies compose into a tree rooted at the OS provider.
//! This crate is one of two that may contain `unsafe` code (along with
//! `quarry-ffi`).
//!
//! # Architecture
//!
//! ```text
//! OsAllocator (reserve/commit/decommit/release, size-prefixed mappings)
//! ├── Arena          BlockChain bump + markers + ArenaScope
//! ├── Heap           BlockChain bump + per-size-class intrusive free lists
//! └── FastAllocator  BlockChain of slabs + one intrusive free list
//!
//! OffsetHeap / OffsetFastAllocator (no parent, never touch memory)
//! ```
//!
//! # Choosing a strategy
//!
//! - **Arena:** many allocations that die together. Free is a no-op;
//!   memory comes back through markers, `clear` or `release`.
//! - **Heap:** general allocate/free with O(1) both ways. Sizes round up
//!   to power-of-two classes and free chunks are never coalesced.
//! - **FastAllocator:** many small allocations of one size.
//! - **Offset variants:** the same bookkeeping over `[0, heap_size)` of an
//!   externally-owned buffer.
//!
//! None of the strategies are thread-safe.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod arena;
mod block;
pub mod config;
pub mod error;
pub mod fast;
pub mod heap;
pub mod offset;
pub mod os;
pub mod size_class;

// Public re-exports for the primary API surface.
pub use arena::{Arena, ArenaMarker, ArenaScope};
pub use config::{ArenaConfig, FastConfig, HeapConfig};
pub use error::ConfigError;
pub use fast::FastAllocator;
pub use heap::Heap;
pub use offset::{OffsetAllocation, OffsetFastAllocator, OffsetHeap};
pub use os::OsAllocator;
