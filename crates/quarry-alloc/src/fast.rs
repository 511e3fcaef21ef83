//! Fixed-slot slab allocator.
//!
//! Slabs of `slots_per_slab` equal slots are requested from the parent. A
//! freed slot joins a single intrusive free list: its first word links to the
//! next free slot and its second word carries a canary that debug builds
//! check to catch double frees.

#![allow(unsafe_code)]

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::{self, NonNull};

use quarry_core::{AllocError, Allocator, ClearFlag, MIN_ALIGN};

use crate::block::BlockChain;
use crate::config::FastConfig;
use crate::error::ConfigError;

const FREE_CANARY: u64 = 0xDEAD_F4EE_DEAD_F4EE;

type FreeLink = Option<NonNull<u8>>;

/// O(1) allocator for requests no larger than one slot.
///
/// Requests larger than the slot size fail with
/// [`AllocError::SizeExceedsSlot`]. Slots are [`MIN_ALIGN`]-aligned.
pub struct FastAllocator<A: Allocator> {
    parent: A,
    slabs: RefCell<BlockChain>,
    slot_size: usize,
    free: Cell<FreeLink>,
    live: Cell<usize>,
}

impl<A: Allocator> FastAllocator<A> {
    /// Create a slab allocator over `parent`.
    ///
    /// The slot size is rounded up to [`MIN_ALIGN`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid.
    pub fn new(parent: A, config: FastConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let slab_bytes = config.slab_bytes().ok_or(ConfigError::SlabTooLarge {
            slot_size: config.slot_size,
            slots_per_slab: config.slots_per_slab,
        })?;
        Ok(Self {
            parent,
            slabs: RefCell::new(BlockChain::new(slab_bytes)),
            slot_size: config.rounded_slot_size(),
            free: Cell::new(None),
            live: Cell::new(0),
        })
    }

    /// Create a slab allocator with `slot_size` slots and the default slab
    /// capacity.
    ///
    /// # Errors
    ///
    /// As for [`new`](Self::new).
    pub fn with_slot_size(parent: A, slot_size: usize) -> Result<Self, ConfigError> {
        Self::new(
            parent,
            FastConfig::new(slot_size, FastConfig::DEFAULT_SLOTS_PER_SLAB),
        )
    }

    /// Slot size in bytes after rounding.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// The allocator this one requests slabs from.
    pub fn parent(&self) -> &A {
        &self.parent
    }

    /// Number of slots handed out and not yet freed.
    pub fn live(&self) -> usize {
        self.live.get()
    }

    /// Number of slabs currently owned.
    pub fn slab_count(&self) -> usize {
        self.slabs.borrow().len()
    }

    /// Whether `p` lies inside a slab owned by this allocator.
    pub fn owns(&self, p: NonNull<u8>) -> bool {
        self.slabs.borrow().contains(p)
    }

    /// Forget every slot, keeping slabs for reuse.
    pub fn clear(&self, clear: ClearFlag) {
        self.slabs.borrow_mut().reset(clear);
        self.free.set(None);
        self.live.set(0);
    }

    /// Return every slab to the parent.
    pub fn release(&self) {
        self.free.set(None);
        // SAFETY: slabs came from `self.parent`; slots of a released
        // allocator must not be used (caller contract).
        unsafe { self.slabs.borrow_mut().release_all(&self.parent) };
        self.live.set(0);
    }
}

impl<A: Allocator> Allocator for FastAllocator<A> {
    fn allocate(&self, size: usize, clear: ClearFlag) -> Result<NonNull<u8>, AllocError> {
        if size > self.slot_size {
            return Err(AllocError::SizeExceedsSlot {
                requested: size,
                slot_size: self.slot_size,
            });
        }
        let p = match self.free.get() {
            Some(p) => {
                // SAFETY: `p` heads the free list; its first word is the
                // next link and its second the canary, both within the slot.
                unsafe {
                    debug_assert_eq!(
                        p.as_ptr().add(8).cast::<u64>().read(),
                        FREE_CANARY,
                        "free list corrupted"
                    );
                    self.free.set(p.cast::<FreeLink>().as_ptr().read());
                }
                p
            }
            None => self
                .slabs
                .borrow_mut()
                .bump(&self.parent, self.slot_size, MIN_ALIGN)?,
        };
        // SAFETY: the slot is at least MIN_ALIGN bytes. A slot rebumped after
        // `clear` may still carry the canary from an earlier free.
        unsafe { p.as_ptr().add(8).cast::<u64>().write(0) };
        if clear.is_clear() {
            // SAFETY: `size <= slot_size` bytes of the slot are writable.
            unsafe { ptr::write_bytes(p.as_ptr(), 0, size) };
        }
        self.live.set(self.live.get() + 1);
        Ok(p)
    }

    unsafe fn free(&self, memory: NonNull<u8>) {
        debug_assert!(self.owns(memory), "pointer not owned by this allocator");
        // SAFETY: `memory` is a live slot of at least MIN_ALIGN bytes, so the
        // link and canary words fit.
        unsafe {
            debug_assert_ne!(
                memory.as_ptr().add(8).cast::<u64>().read(),
                FREE_CANARY,
                "double free"
            );
            memory.cast::<FreeLink>().as_ptr().write(self.free.get());
            memory.as_ptr().add(8).cast::<u64>().write(FREE_CANARY);
        }
        self.free.set(Some(memory));
        self.live.set(self.live.get().saturating_sub(1));
    }
}

impl<A: Allocator> Drop for FastAllocator<A> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<A: Allocator> fmt::Debug for FastAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastAllocator")
            .field("slot_size", &self.slot_size)
            .field("live", &self.live())
            .field("slabs", &self.slab_count())
            .finish()
    }
}
