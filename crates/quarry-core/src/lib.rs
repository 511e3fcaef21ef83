//! Core types and traits for the Quarry allocator family.
//!
//! This is the leaf crate with zero internal dependencies. It defines the
//! allocator capability every strategy implements or consumes, the shared
//! error type, and the alignment helpers the strategies agree on.
//!
//! Strategies form a tree: each one is constructed with an explicit parent
//! allocator and requests its blocks from it. The root of the tree is
//! normally the OS provider in `quarry-alloc`.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod align;
pub mod alloc;
pub mod error;

pub use align::{align_up, checked_align_up, MIN_ALIGN};
pub use alloc::{Allocator, ClearFlag};
pub use error::AllocError;
