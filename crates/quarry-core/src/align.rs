//! Alignment arithmetic.

/// Alignment guaranteed for every pointer returned by
/// [`Allocator::allocate`](crate::Allocator::allocate).
///
/// Large enough for any primitive type and for the intrusive headers the
/// heap and slab allocators write into their chunks.
pub const MIN_ALIGN: usize = 16;

/// Round `value` up to the next multiple of `align`.
///
/// `align` must be a power of two.
///
/// # Panics
///
/// Panics on overflow in debug builds. Use [`checked_align_up`] where the
/// input is caller-controlled.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Round `value` up to the next multiple of `align`, or `None` on overflow.
///
/// `align` must be a power of two.
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 8), 24);
    }

    #[test]
    fn checked_align_up_detects_overflow() {
        assert_eq!(checked_align_up(usize::MAX, 16), None);
        assert_eq!(checked_align_up(33, 32), Some(64));
    }

    #[cfg(not(miri))]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn aligned_value_is_smallest_multiple(
                value in 0usize..1 << 40,
                shift in 0u32..12,
            ) {
                let align = 1usize << shift;
                let up = align_up(value, align);
                prop_assert_eq!(up % align, 0);
                prop_assert!(up >= value);
                prop_assert!(up - value < align);
            }
        }
    }
}
