//! Alignment and range math.
//!
//! GPU memory layout is dominated by alignment rules: uniform buffer regions must
//! start on `minUniformBufferOffsetAlignment`, push constant ranges on 4 bytes,
//! and so on. These helpers are shared by the buffer, pipeline, and shader code.

use serde::{Deserialize, Serialize};

/// Round `value` up to the next multiple of `alignment`.
///
/// An alignment of `0` or `1` leaves the value unchanged. Alignments do not need to
/// be powers of two, although every alignment Vulkan reports is one.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    if alignment.is_power_of_two() {
        (value + (alignment - 1)) & !(alignment - 1)
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Returns true if `value` is a multiple of `alignment`.
#[inline]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    alignment <= 1 || value % alignment == 0
}

/// A byte range whose offset and size have both been aligned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlignedRange {
    /// Start of the range in bytes
    pub offset: u64,
    /// Size of the range in bytes
    pub size: u64,
}

impl AlignedRange {
    /// One past the last byte of the range.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Returns true if the two ranges share at least one byte.
    #[inline]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Build a range starting at `offset` aligned to `granularity`, with its size also
/// rounded up to `granularity`.
#[inline]
pub const fn aligned_range(offset: u64, size: u64, granularity: u64) -> AlignedRange {
    AlignedRange {
        offset: align_up(offset, granularity),
        size: align_up(size, granularity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_properties_hold() {
        for alignment in [1u64, 2, 4, 16, 64, 256, 3, 12, 48] {
            for size in 0..1024u64 {
                let aligned = align_up(size, alignment);
                assert!(aligned >= size);
                assert_eq!(aligned % alignment, 0);
                assert!(aligned < size + alignment);
            }
        }
    }

    #[test]
    fn align_up_common_values() {
        assert_eq!(align_up(64, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(13, 0), 13);
    }

    #[test]
    fn aligned_range_rounds_both_ends() {
        let range = aligned_range(6, 6, 4);
        assert_eq!(range, AlignedRange { offset: 8, size: 8 });
        assert_eq!(range.end(), 16);
        assert!(is_aligned(range.offset, 4));
    }

    #[test]
    fn range_overlap() {
        let a = AlignedRange { offset: 0, size: 16 };
        let b = AlignedRange { offset: 16, size: 16 };
        let c = AlignedRange { offset: 8, size: 16 };
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
    }
}
