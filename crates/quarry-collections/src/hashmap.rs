//! Open-addressed hash map over an explicit allocator.
//!
//! Buckets live in an [`Array`] sized to a power of two. Collisions probe
//! linearly; removal leaves a tombstone so later probes keep walking. The
//! table doubles and rehashes once live entries plus tombstones would exceed
//! three quarters of the buckets.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::mem;
use std::ops::Index;

use quarry_core::{AllocError, Allocator};

use crate::array::Array;

/// Bucket count of the first table a map allocates.
pub const DEFAULT_CAPACITY: usize = 128;

enum Bucket<K, V> {
    Empty,
    Tombstone,
    Full(K, V),
}

/// Hash map with linear probing, storing its buckets through an allocator.
///
/// # Example
///
/// ```
/// use quarry_alloc::OsAllocator;
/// use quarry_collections::HashMap;
///
/// let os = OsAllocator::new();
/// let mut map = HashMap::new(&os);
/// map.insert("fuel", 12).unwrap();
/// assert_eq!(map.get("fuel"), Some(&12));
/// assert_eq!(map.remove("fuel"), Some(12));
/// ```
pub struct HashMap<K, V, A: Allocator, S = RandomState> {
    buckets: Array<Bucket<K, V>, A>,
    len: usize,
    tombstones: usize,
    hasher: S,
}

impl<K, V, A: Allocator> HashMap<K, V, A, RandomState> {
    /// Create an empty map. The first insert allocates
    /// [`DEFAULT_CAPACITY`] buckets.
    pub fn new(alloc: A) -> Self {
        Self::with_hasher(alloc, RandomState::new())
    }

    /// Create a map with at least `capacity` buckets, rounded up to a power
    /// of two.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's error.
    pub fn with_capacity(alloc: A, capacity: usize) -> Result<Self, AllocError>
    where
        K: Hash + Eq,
    {
        let mut map = Self::new(alloc);
        map.rehash(bucket_count_for(capacity)?)?;
        Ok(map)
    }
}

impl<K, V, A: Allocator, S> HashMap<K, V, A, S> {
    /// Create an empty map using `hasher`.
    pub fn with_hasher(alloc: A, hasher: S) -> Self {
        Self {
            buckets: Array::new(alloc),
            len: 0,
            tombstones: 0,
            hasher,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buckets.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Iterate over entries in bucket order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            buckets: self.buckets.iter(),
            remaining: self.len,
        }
    }

    /// Iterate over entries with mutable values.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        IterMut {
            buckets: self.buckets.iter_mut(),
            remaining: self.len,
        }
    }

    /// Remove every entry, keeping the buckets.
    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            *bucket = Bucket::Empty;
        }
        self.len = 0;
        self.tombstones = 0;
    }

    /// Remove every entry and return the buckets to the allocator.
    pub fn release(&mut self) {
        self.buckets.release();
        self.len = 0;
        self.tombstones = 0;
    }
}

impl<K, V, A, S> HashMap<K, V, A, S>
where
    K: Hash + Eq,
    A: Allocator,
    S: BuildHasher,
{
    /// Insert `value` under `key`, returning the value it replaced.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's error when the table must grow. The map
    /// is unchanged in that case.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>, AllocError> {
        if let Some(i) = self.find(&key) {
            if let Bucket::Full(_, v) = &mut self.buckets[i] {
                return Ok(Some(mem::replace(v, value)));
            }
        }
        let occupied = self.len + self.tombstones + 1;
        if occupied * 4 > self.capacity() * 3 {
            // Mostly tombstones: purge them in place instead of growing.
            let target = if self.capacity() > 0 && self.tombstones >= self.len {
                self.capacity()
            } else {
                self.capacity().saturating_mul(2).max(DEFAULT_CAPACITY)
            };
            self.rehash(target)?;
        }
        let i = self.free_bucket(&key);
        if matches!(self.buckets[i], Bucket::Tombstone) {
            self.tombstones -= 1;
        }
        self.buckets[i] = Bucket::Full(key, value);
        self.len += 1;
        Ok(None)
    }

    /// Value stored under `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match &self.buckets[self.find(key)?] {
            Bucket::Full(_, v) => Some(v),
            _ => None,
        }
    }

    /// Mutable value stored under `key`.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let i = self.find(key)?;
        match &mut self.buckets[i] {
            Bucket::Full(_, v) => Some(v),
            _ => None,
        }
    }

    /// Whether an entry exists for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).is_some()
    }

    /// Remove the entry for `key`, returning its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let i = self.find(key)?;
        match mem::replace(&mut self.buckets[i], Bucket::Tombstone) {
            Bucket::Full(_, v) => {
                self.len -= 1;
                self.tombstones += 1;
                Some(v)
            }
            other => {
                self.buckets[i] = other;
                None
            }
        }
    }

    fn home<Q: Hash + ?Sized>(&self, key: &Q) -> usize {
        // Truncation is fine: only the low bits select a bucket.
        (self.hasher.hash_one(key) as usize) & (self.capacity() - 1)
    }

    /// Bucket index holding `key`, if present.
    fn find<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let cap = self.capacity();
        if cap == 0 {
            return None;
        }
        let mask = cap - 1;
        let mut i = self.home(key);
        for _ in 0..cap {
            match &self.buckets[i] {
                Bucket::Empty => return None,
                Bucket::Full(k, _) if k.borrow() == key => return Some(i),
                _ => {}
            }
            i = (i + 1) & mask;
        }
        None
    }

    /// First empty or tombstoned bucket on `key`'s probe path.
    ///
    /// The load factor guarantees one exists.
    fn free_bucket(&self, key: &K) -> usize {
        let mask = self.capacity() - 1;
        let mut i = self.home(key);
        while let Bucket::Full(..) = self.buckets[i] {
            i = (i + 1) & mask;
        }
        i
    }

    fn rehash(&mut self, buckets: usize) -> Result<(), AllocError> {
        debug_assert!(buckets.is_power_of_two());
        let hasher = &self.hasher;
        let mask = buckets - 1;
        self.buckets.rebuild_with(
            buckets,
            || Bucket::Empty,
            |old, table| {
                if let Bucket::Full(k, v) = old {
                    let mut i = (hasher.hash_one(&k) as usize) & mask;
                    while let Bucket::Full(..) = table[i] {
                        i = (i + 1) & mask;
                    }
                    table[i] = Bucket::Full(k, v);
                }
            },
        )?;
        tracing::debug!(buckets, len = self.len, "hash map rehashed");
        self.tombstones = 0;
        Ok(())
    }
}

fn bucket_count_for(capacity: usize) -> Result<usize, AllocError> {
    capacity
        .max(1)
        .checked_next_power_of_two()
        .ok_or(AllocError::Overflow)
}

impl<K, V, A, S, Q> Index<&Q> for HashMap<K, V, A, S>
where
    K: Hash + Eq + Borrow<Q>,
    Q: Hash + Eq + ?Sized,
    A: Allocator,
    S: BuildHasher,
{
    type Output = V;

    /// # Panics
    ///
    /// Panics if `key` is not present.
    fn index(&self, key: &Q) -> &V {
        match self.get(key) {
            Some(v) => v,
            None => panic!("key not present in HashMap"),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug, A: Allocator, S> fmt::Debug for HashMap<K, V, A, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Iterator over `(&K, &V)` pairs of a [`HashMap`].
pub struct Iter<'a, K, V> {
    buckets: std::slice::Iter<'a, Bucket<K, V>>,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        for bucket in self.buckets.by_ref() {
            if let Bucket::Full(k, v) = bucket {
                self.remaining -= 1;
                return Some((k, v));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

/// Iterator over `(&K, &mut V)` pairs of a [`HashMap`].
pub struct IterMut<'a, K, V> {
    buckets: std::slice::IterMut<'a, Bucket<K, V>>,
    remaining: usize,
}

impl<'a, K, V> Iterator for IterMut<'a, K, V> {
    type Item = (&'a K, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        for bucket in self.buckets.by_ref() {
            if let Bucket::Full(k, v) = bucket {
                self.remaining -= 1;
                return Some((&*k, v));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, K, V, A: Allocator, S> IntoIterator for &'a HashMap<K, V, A, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
