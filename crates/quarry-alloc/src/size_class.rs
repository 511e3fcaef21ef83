//! Power-of-two size classes shared by the heap and the offset heap.
//!
//! Class `c` serves requests of up to `MIN_CLASS_SIZE << c` units. One free
//! list exists per class; chunks never move between classes.

/// Smallest class size. Equal to [`MIN_ALIGN`](quarry_core::MIN_ALIGN) so a
/// freed chunk always has room for its free-list link.
pub const MIN_CLASS_SIZE: u64 = 16;

const MIN_CLASS_SHIFT: u32 = MIN_CLASS_SIZE.trailing_zeros();

/// Number of distinct classes representable in a `u64` size.
pub const CLASS_COUNT: usize = (u64::BITS - MIN_CLASS_SHIFT) as usize;

/// Size class for a request of `size` units, or `None` if the rounded size
/// does not fit in a `u64`.
#[inline]
pub fn class_for(size: u64) -> Option<u32> {
    let rounded = size.max(MIN_CLASS_SIZE).checked_next_power_of_two()?;
    Some(rounded.trailing_zeros() - MIN_CLASS_SHIFT)
}

/// Size in units of every chunk in `class`.
///
/// # Panics
///
/// Panics if `class >= CLASS_COUNT`.
#[inline]
pub fn class_size(class: u32) -> u64 {
    assert!((class as usize) < CLASS_COUNT, "size class {class} out of range");
    MIN_CLASS_SIZE << class
}
