//! Page geometry and the three page-table levels.
//!
//! The tree is Sv39-shaped: a root [`Level::L2`] table whose entries point at
//! [`Level::L1`] tables, whose entries point at [`Level::L0`] leaf tables,
//! whose entries point at data pages.

use core::fmt;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Size in bytes of one page-table entry.
pub const PTE_SIZE: usize = 8;

/// Number of entries in a page table (all levels).
pub const NUM_PTE_ENTRIES: usize = PAGE_SIZE / PTE_SIZE;

/// Number of virtual address bits consumed by one level.
pub const LEVEL_BITS: u32 = 9;

/// A page-table level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Leaf level; entries point at data pages.
    L0 = 0,
    /// Middle level; entries point at L0 tables.
    L1 = 1,
    /// Root level; entries point at L1 tables.
    L2 = 2,
}

impl Level {
    /// Levels from the root down to the leaves.
    pub const TOP_DOWN: [Level; 3] = [Level::L2, Level::L1, Level::L0];

    /// Returns the bit position of this level's index in a virtual address.
    #[inline]
    pub const fn shift(self) -> u32 {
        PAGE_SHIFT + LEVEL_BITS * self as u32
    }

    /// Returns `true` for the leaf level.
    #[inline]
    pub const fn is_leaf(self) -> bool {
        matches!(self, Level::L0)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", *self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_geometry() {
        assert_eq!(NUM_PTE_ENTRIES, 512);
        assert_eq!(1usize << PAGE_SHIFT, PAGE_SIZE);
        assert_eq!(1usize << LEVEL_BITS, NUM_PTE_ENTRIES);
    }

    #[test]
    fn level_shifts() {
        assert_eq!(Level::L0.shift(), 12);
        assert_eq!(Level::L1.shift(), 21);
        assert_eq!(Level::L2.shift(), 30);
    }

    #[test]
    fn leaf_level() {
        assert!(Level::L0.is_leaf());
        assert!(!Level::L2.is_leaf());
    }
}
