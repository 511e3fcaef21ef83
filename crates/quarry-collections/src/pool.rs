//! Generational object pool.
//!
//! Values live in a slot array from an allocator and are addressed by
//! [`Handle`]s carrying the slot index, the slot's generation, and the id of
//! the pool that issued them. Freeing a value bumps its slot's generation,
//! so every outstanding handle to it stops resolving, even after the slot is
//! reused.
//!
//! Generation 0 is never issued. A slot whose generation wraps back to 0 is
//! retired permanently instead of being recycled, which keeps stale handles
//! from an earlier epoch from ever matching again.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicU64, Ordering};

use quarry_core::{AllocError, Allocator};

use crate::array::Array;

/// Slot capacity a pool reserves on its first allocation.
pub const DEFAULT_CAPACITY: usize = 128;

/// Counter for unique [`PoolId`] allocation.
static POOL_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Pool`].
///
/// Handles record the id of the pool that issued them, so a handle is never
/// accepted by another pool, nor by the same pool after
/// [`Pool::release`] gives it a fresh id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u64);

impl PoolId {
    /// Allocate a fresh, unique id. Thread-safe.
    pub fn next() -> Self {
        Self(POOL_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed reference to a value in a [`Pool`].
///
/// `id` packs the generation in the upper 32 bits and the slot index in the
/// lower 32 bits. A valid id is never zero.
pub struct Handle<T> {
    id: u64,
    pool: PoolId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32, pool: PoolId) -> Self {
        Self {
            id: (u64::from(generation) << 32) | u64::from(index),
            pool,
            _marker: PhantomData,
        }
    }

    /// Packed `(generation << 32) | index`.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Slot index.
    pub fn index(&self) -> u32 {
        self.id as u32
    }

    /// Generation the slot had when this handle was issued.
    pub fn generation(&self) -> u32 {
        (self.id >> 32) as u32
    }

    /// Id of the issuing pool.
    pub fn pool(&self) -> PoolId {
        self.pool
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.pool == other.pool
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.pool.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index())
            .field("generation", &self.generation())
            .field("pool", &self.pool)
            .finish()
    }
}

enum Entry<T> {
    Occupied(T),
    Vacant { next_free: Option<u32> },
}

struct Slot<T> {
    generation: u32,
    entry: Entry<T>,
}

/// Pool of `T` values addressed by generational [`Handle`]s.
///
/// # Example
///
/// ```
/// use quarry_alloc::OsAllocator;
/// use quarry_collections::Pool;
///
/// let os = OsAllocator::new();
/// let mut pool = Pool::new(&os);
/// let h = pool.allocate("crate").unwrap();
/// assert_eq!(pool.get(h), Some(&"crate"));
/// assert_eq!(pool.free(h), Some("crate"));
/// assert_eq!(pool.get(h), None);
/// ```
pub struct Pool<T, A: Allocator> {
    slots: Array<Slot<T>, A>,
    free_head: Option<u32>,
    len: usize,
    initial_capacity: usize,
    id: PoolId,
}

impl<T, A: Allocator> Pool<T, A> {
    /// Create an empty pool. The first allocation reserves
    /// [`DEFAULT_CAPACITY`] slots.
    pub fn new(alloc: A) -> Self {
        Self {
            slots: Array::new(alloc),
            free_head: None,
            len: 0,
            initial_capacity: DEFAULT_CAPACITY,
            id: PoolId::next(),
        }
    }

    /// Create a pool with room for `capacity` values.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's error.
    pub fn with_capacity(alloc: A, capacity: usize) -> Result<Self, AllocError> {
        let mut pool = Self::new(alloc);
        pool.initial_capacity = capacity;
        pool.slots.reserve(capacity)?;
        Ok(pool)
    }

    /// This pool's current id.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the pool holds no live values.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slots the pool can hold without growing.
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Store `value` and return its handle.
    ///
    /// Reuses the most recently freed slot if any.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's error when the slot array must grow;
    /// [`AllocError::OutOfMemory`] once all `u32` slot indices are used.
    pub fn allocate(&mut self, value: T) -> Result<Handle<T>, AllocError> {
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let next_free = match slot.entry {
                Entry::Vacant { next_free } => next_free,
                Entry::Occupied(_) => unreachable!("occupied slot on free list"),
            };
            slot.entry = Entry::Occupied(value);
            let generation = slot.generation;
            self.free_head = next_free;
            self.len += 1;
            return Ok(Handle::new(index, generation, self.id));
        }

        let index = u32::try_from(self.slots.len()).map_err(|_| AllocError::OutOfMemory {
            requested: mem::size_of::<Slot<T>>(),
        })?;
        if self.slots.capacity() == 0 {
            self.slots.reserve(self.initial_capacity.max(1))?;
        }
        self.slots.push(Slot {
            generation: 1,
            entry: Entry::Occupied(value),
        })?;
        self.len += 1;
        Ok(Handle::new(index, 1, self.id))
    }

    /// Store `T::default()` and return its handle.
    ///
    /// # Errors
    ///
    /// As for [`allocate`](Self::allocate).
    pub fn allocate_default(&mut self) -> Result<Handle<T>, AllocError>
    where
        T: Default,
    {
        self.allocate(T::default())
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T>> {
        if handle.pool != self.id {
            return None;
        }
        let slot = self.slots.get(handle.index() as usize)?;
        (slot.generation == handle.generation()).then_some(slot)
    }

    fn slot_mut(&mut self, handle: Handle<T>) -> Option<&mut Slot<T>> {
        if handle.pool != self.id {
            return None;
        }
        let slot = self.slots.get_mut(handle.index() as usize)?;
        (slot.generation == handle.generation()).then_some(slot)
    }

    /// The value behind `handle`, if the handle is still valid.
    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match &self.slot(handle)?.entry {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    /// Mutable access to the value behind `handle`.
    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match &mut self.slot_mut(handle)?.entry {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    /// Whether `handle` still resolves.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Remove the value behind `handle` and invalidate the handle.
    ///
    /// Returns `None` for stale, foreign, or already-freed handles.
    pub fn free(&mut self, handle: Handle<T>) -> Option<T> {
        let free_head = self.free_head;
        let slot = self.slot_mut(handle)?;
        if !matches!(slot.entry, Entry::Occupied(_)) {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        let retired = slot.generation == 0;
        let next_free = if retired { None } else { free_head };
        let Entry::Occupied(value) = mem::replace(&mut slot.entry, Entry::Vacant { next_free })
        else {
            unreachable!("checked occupied above");
        };
        if retired {
            tracing::trace!(index = handle.index(), "pool slot retired after generation wrap");
        } else {
            self.free_head = Some(handle.index());
        }
        self.len -= 1;
        Some(value)
    }

    /// Drop every value and invalidate every handle, keeping the slots.
    pub fn clear(&mut self) {
        self.free_head = None;
        for index in (0..self.slots.len()).rev() {
            let slot = &mut self.slots[index];
            if let Entry::Occupied(_) = slot.entry {
                slot.generation = slot.generation.wrapping_add(1);
            }
            if slot.generation == 0 {
                slot.entry = Entry::Vacant { next_free: None };
                continue;
            }
            slot.entry = Entry::Vacant {
                next_free: self.free_head,
            };
            // `index` fits: slot count never exceeds u32::MAX + 1.
            self.free_head = Some(index as u32);
        }
        self.len = 0;
    }

    /// Drop every value, return the slot array to the allocator, and take a
    /// fresh id so no earlier handle can resolve again.
    pub fn release(&mut self) {
        self.slots.release();
        self.free_head = None;
        self.len = 0;
        self.id = PoolId::next();
    }

    /// Rebuild a handle from its packed id, tagged with this pool's id.
    ///
    /// The handle is validated on use like any other.
    pub fn handle_from_id(&self, id: u64) -> Handle<T> {
        Handle {
            id,
            pool: self.id,
            _marker: PhantomData,
        }
    }

    /// Iterate over live values with their handles, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        let pool = self.id;
        self.slots
            .iter()
            .enumerate()
            .filter_map(move |(index, slot)| match &slot.entry {
                Entry::Occupied(value) => {
                    Some((Handle::new(index as u32, slot.generation, pool), value))
                }
                Entry::Vacant { .. } => None,
            })
    }
}

impl<T, A: Allocator> Index<Handle<T>> for Pool<T, A> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        match self.get(handle) {
            Some(value) => value,
            None => panic!("invalid pool handle {handle:?}"),
        }
    }
}

impl<T, A: Allocator> IndexMut<Handle<T>> for Pool<T, A> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        match self.get_mut(handle) {
            Some(value) => value,
            None => panic!("invalid pool handle {handle:?}"),
        }
    }
}

impl<T: fmt::Debug, A: Allocator> fmt::Debug for Pool<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
