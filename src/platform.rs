// SPDX-License-Identifier: Apache-2.0

//! Memory region predicates
//!
//! The switchless initializer and the guest call path only ever ask two
//! questions about an address range: does it lie entirely inside the Keep, or
//! entirely outside of it. A range that straddles the boundary is neither.

use core::mem::align_of;
use lset::Line;

/// Answers where a range of memory lives relative to the Keep
pub trait Platform {
    /// Whether `[addr, addr + len)` lies entirely outside the protected region
    ///
    /// A range whose end overflows the address space is never outside.
    fn is_outside(&self, addr: usize, len: usize) -> bool;

    /// Whether `[addr, addr + len)` lies entirely inside the protected region
    fn is_inside(&self, addr: usize, len: usize) -> bool;
}

/// A contiguous protected region of the address space
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region(Line<usize>);

impl Region {
    /// Creates a region covering `[start, start + size)`.
    pub const fn new(start: usize, size: usize) -> Self {
        Self(Line {
            start,
            end: start.saturating_add(size),
        })
    }

    /// The region as a line of addresses
    pub fn line(&self) -> Line<usize> {
        self.0
    }

    /// Size of the region in bytes
    pub fn size(&self) -> usize {
        self.0.end.saturating_sub(self.0.start)
    }
}

impl From<Line<usize>> for Region {
    fn from(line: Line<usize>) -> Self {
        Self(line)
    }
}

impl Platform for Region {
    fn is_outside(&self, addr: usize, len: usize) -> bool {
        let end = match addr.checked_add(len) {
            Some(end) => end,
            None => return false,
        };

        end <= self.0.start || addr >= self.0.end
    }

    fn is_inside(&self, addr: usize, len: usize) -> bool {
        let end = match addr.checked_add(len) {
            Some(end) => end,
            None => return false,
        };

        addr >= self.0.start && end <= self.0.end
    }
}

/// Validates that `ptr` is aligned for `T` and non-null
///
/// Returns `Some(ptr)`, if so and `None` if not.
pub fn is_aligned_non_null<T>(ptr: usize) -> Option<usize> {
    if ptr == 0 || ptr % align_of::<T>() != 0 {
        return None;
    }
    Some(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION: Region = Region::new(0x1000, 0x1000);

    #[test]
    fn outside() {
        assert!(REGION.is_outside(0, 0x1000));
        assert!(REGION.is_outside(0x2000, 0x10));
        assert!(REGION.is_outside(0x800, 0x800));

        assert!(!REGION.is_outside(0x800, 0x801));
        assert!(!REGION.is_outside(0x1fff, 2));
        assert!(!REGION.is_outside(0x1800, 0x10));
        assert!(!REGION.is_outside(0, 0x3000));
    }

    #[test]
    fn inside() {
        assert!(REGION.is_inside(0x1000, 0x1000));
        assert!(REGION.is_inside(0x1800, 0x10));

        assert!(!REGION.is_inside(0xfff, 2));
        assert!(!REGION.is_inside(0x1fff, 2));
        assert!(!REGION.is_inside(0x2000, 1));
    }

    #[test]
    fn straddling_is_neither() {
        assert!(!REGION.is_inside(0x1ff0, 0x20));
        assert!(!REGION.is_outside(0x1ff0, 0x20));
    }

    #[test]
    fn overflow() {
        assert!(!REGION.is_outside(usize::MAX, 2));
        assert!(!REGION.is_inside(usize::MAX, 2));
    }

    #[test]
    fn empty_region() {
        let region = Region::from(Line { start: 0, end: 0 });
        assert_eq!(region.size(), 0);
        assert!(region.is_outside(0x1000, 0x1000));
        assert!(!region.is_inside(0x1000, 1));
    }

    #[test]
    fn reversed_line_is_empty() {
        let region = Region::from(Line {
            start: 0x2000,
            end: 0x1000,
        });
        assert_eq!(region.size(), 0);
        assert!(!region.is_inside(0x1800, 1));
    }

    #[test]
    fn is_aligned_non_null() {
        assert_eq!(super::is_aligned_non_null::<u8>(0), None);
        assert_eq!(super::is_aligned_non_null::<u64>(0), None);

        assert_eq!(
            super::is_aligned_non_null::<u16>(align_of::<u16>()),
            Some(align_of::<u16>())
        );
        assert_eq!(super::is_aligned_non_null::<u64>(align_of::<u16>()), None);
        assert_eq!(
            super::is_aligned_non_null::<u64>(align_of::<u64>()),
            Some(align_of::<u64>())
        );
    }
}
