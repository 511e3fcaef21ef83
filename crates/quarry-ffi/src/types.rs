//! C-compatible enums and records passed across the boundary.

use quarry_alloc::OffsetAllocation;
use quarry_core::ClearFlag;

/// Whether newly handed-out (or cleared) memory is zero-filled.
///
/// Passed as a plain `int32_t`; values outside this enum are rejected with
/// `InvalidArgument`.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuarryClearFlag {
    /// Leave contents unspecified.
    NoClear = 0,
    /// Zero-fill.
    Clear = 1,
}

pub(crate) fn parse_clear_flag(raw: i32) -> Option<ClearFlag> {
    match raw {
        x if x == QuarryClearFlag::NoClear as i32 => Some(ClearFlag::NoClear),
        x if x == QuarryClearFlag::Clear as i32 => Some(ClearFlag::Clear),
        _ => None,
    }
}

/// Arena checkpoint as plain integers.
///
/// Only meaningful for the arena handle it was taken from.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuarryArenaMarker {
    /// Block index at capture time.
    pub block: u64,
    /// Cursor within that block, in bytes.
    pub offset: u64,
}

/// Range reserved by an offset allocator.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuarryOffsetAllocation {
    /// Start of the range.
    pub offset: u64,
    /// Requested size.
    pub size: u64,
    /// Size class (offset heap) or slot index (offset fast allocator).
    pub metadata: u32,
}

impl From<OffsetAllocation> for QuarryOffsetAllocation {
    fn from(a: OffsetAllocation) -> Self {
        Self {
            offset: a.offset,
            size: a.size,
            metadata: a.metadata,
        }
    }
}

impl From<QuarryOffsetAllocation> for OffsetAllocation {
    fn from(a: QuarryOffsetAllocation) -> Self {
        Self {
            offset: a.offset,
            size: a.size,
            metadata: a.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_flag_parsing() {
        assert_eq!(parse_clear_flag(0), Some(ClearFlag::NoClear));
        assert_eq!(parse_clear_flag(1), Some(ClearFlag::Clear));
        assert_eq!(parse_clear_flag(2), None);
        assert_eq!(parse_clear_flag(-1), None);
    }
}
