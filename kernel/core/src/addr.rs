//! Typed virtual addresses, physical page numbers and page indices.
//!
//! Provides [`VirtAddr`], [`Ppn`] and [`PageIndex`] newtypes so that a
//! virtual address, the frame number stored in a page-table entry, and the
//! dense bookkeeping index of a physical page can never be mixed up.

use core::fmt;

use crate::paging::Level;

/// Number of significant virtual address bits (Sv39).
pub const VA_BITS: u32 = 39;

/// Number of bits in a physical page number (Sv39 PTEs carry 44).
pub const PPN_BITS: u32 = 44;

/// Mask for a physical page number.
const PPN_MASK: u64 = (1 << PPN_BITS) - 1;

/// Mask for a 9-bit page table index (used by all paging levels).
const VPN_MASK: u64 = 0x1FF;

// ---------------------------------------------------------------------------
// VirtAddr
// ---------------------------------------------------------------------------

/// A canonical Sv39 virtual address.
///
/// Bits 39..63 must be a sign-extension of bit 38. This type enforces that
/// invariant via sign-extension.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Creates a new `VirtAddr`. Panics if the address is not canonical.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        let canonical = Self::new_truncate(addr);
        assert!(
            canonical.0 == addr,
            "VirtAddr::new: address is not canonical"
        );
        canonical
    }

    /// Creates a new `VirtAddr`, sign-extending from bit 38.
    #[inline]
    pub const fn new_truncate(addr: u64) -> Self {
        let shift = 64 - VA_BITS;
        Self((((addr << shift) as i64) >> shift) as u64)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the page-table index this address selects at `level`.
    ///
    /// L2 uses bits 30..38, L1 bits 21..29 and L0 bits 12..20.
    #[inline]
    pub const fn vpn(self, level: Level) -> usize {
        ((self.0 >> level.shift()) & VPN_MASK) as usize
    }

    /// Builds the page-aligned address selected by one index per level.
    ///
    /// Indices are masked to 9 bits.
    #[inline]
    pub const fn from_indices(l2: usize, l1: usize, l0: usize) -> Self {
        let raw = ((l2 as u64 & VPN_MASK) << Level::L2.shift())
            | ((l1 as u64 & VPN_MASK) << Level::L1.shift())
            | ((l0 as u64 & VPN_MASK) << Level::L0.shift());
        Self::new_truncate(raw)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Ppn
// ---------------------------------------------------------------------------

/// A physical page number: the frame identifier a page-table entry stores.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Ppn(u64);

impl Ppn {
    /// Creates a new `Ppn`. Panics in debug mode if bits above 44 are set.
    #[inline]
    pub const fn new(ppn: u64) -> Self {
        debug_assert!(ppn & !PPN_MASK == 0, "Ppn::new: frame number exceeds 44 bits");
        Self(ppn & PPN_MASK)
    }

    /// Returns the raw frame number.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if `ppn` fits in a page-table entry.
    #[inline]
    pub const fn fits(ppn: u64) -> bool {
        ppn & !PPN_MASK == 0
    }
}

impl fmt::Debug for Ppn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ppn({:#x})", self.0)
    }
}

impl fmt::Display for Ppn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}", self.0)
    }
}

impl fmt::UpperHex for Ppn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// PageIndex
// ---------------------------------------------------------------------------

/// Dense index of a physical page in `[0, max_pages)`.
///
/// Used to address the page store and the reference ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageIndex(usize);

impl PageIndex {
    /// Creates a new page index.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the raw index.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
