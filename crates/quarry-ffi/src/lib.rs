//! C FFI bindings for the Quarry allocator family.
//!
//! Exposes a procedural C API over opaque `u64` handles. Every function
//! returns an `int32_t` [`QuarryStatus`](status::QuarryStatus) code and
//! writes results through out-pointers. Panics never cross the boundary.
//!
//! Allocator instances are single-threaded, so handle tables are
//! per-thread: a handle is only valid on the thread that created it.
//! Child allocators hold a counted reference to their parent; destroying a
//! parent handle while children live keeps the parent alive until the last
//! child is destroyed.
//!
//! This crate is one of two that may contain `unsafe` code (along with
//! `quarry-alloc`).

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

/// Run an FFI body, converting a panic into `QuarryStatus::Panicked`.
macro_rules! ffi_guard {
    ($body:block) => {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| $body)) {
            Ok(status) => status,
            Err(_) => {
                tracing::error!("panic caught at FFI boundary");
                $crate::status::QuarryStatus::Panicked as i32
            }
        }
    };
}

pub mod allocator;
pub mod offset;
pub mod pool;
pub mod status;
mod table;
pub mod types;

pub use status::QuarryStatus;
pub use types::{QuarryArenaMarker, QuarryClearFlag, QuarryOffsetAllocation};
