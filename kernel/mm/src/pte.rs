//! Page-table entry encoding.
//!
//! Entries use the Sv39 layout: flag bits in the low byte, the software
//! (RSW) bits at 8..9 and the 44-bit frame number at bits 10..53. Only the
//! four flags this core interprets are modelled: `V`, `R`, `W` and the
//! software-defined copy-on-write marker in RSW bit 8.

use core::fmt;

use vms_core::addr::Ppn;
use vms_core::paging::Level;

use crate::VmmError;

/// Bit position of the frame number inside an entry.
const PPN_SHIFT: u32 = 10;

/// Mask of the frame number after shifting.
const PPN_MASK: u64 = (1 << 44) - 1;

bitflags::bitflags! {
    /// Page-table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// Entry is in use; without it the rest of the entry is meaningless.
        const VALID  = 1 << 0;
        /// Mapping permits reads.
        const READ   = 1 << 1;
        /// Mapping permits writes.
        const WRITE  = 1 << 2;
        /// Software bit: the mapping is copy-on-write protected.
        const CUSTOM = 1 << 8;
    }
}

impl PteFlags {
    /// Flags that describe a leaf mapping's access rights.
    pub const LEAF_ACCESS: Self = Self::READ.union(Self::WRITE).union(Self::CUSTOM);
}

/// A single 64-bit page-table entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An empty (invalid) entry.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Reinterprets a raw word read from a table page.
    #[inline]
    pub const fn from_bits(raw: u64) -> Self {
        Self(raw)
    }

    /// An interior entry pointing at the next-level table `ppn`.
    #[inline]
    pub fn table(ppn: Ppn) -> Self {
        Self::empty().with_ppn(ppn).with(PteFlags::VALID)
    }

    /// A valid leaf entry mapping the data page `ppn` with `access`.
    ///
    /// Only the `READ`, `WRITE` and `CUSTOM` bits of `access` are used.
    #[inline]
    pub fn leaf(ppn: Ppn, access: PteFlags) -> Self {
        Self::empty()
            .with_ppn(ppn)
            .with(PteFlags::VALID | (access & PteFlags::LEAF_ACCESS))
    }

    /// Returns the raw entry word.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns the flags this core interprets.
    #[inline]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Returns the frame number.
    #[inline]
    pub const fn ppn(self) -> Ppn {
        Ppn::new((self.0 >> PPN_SHIFT) & PPN_MASK)
    }

    /// Returns `true` if the entry is in use.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    /// Returns `true` if the mapping permits reads.
    #[inline]
    pub const fn is_readable(self) -> bool {
        self.flags().contains(PteFlags::READ)
    }

    /// Returns `true` if the mapping permits writes.
    #[inline]
    pub const fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::WRITE)
    }

    /// Returns `true` if the mapping carries the copy-on-write marker.
    #[inline]
    pub const fn is_custom(self) -> bool {
        self.flags().contains(PteFlags::CUSTOM)
    }

    /// Returns a copy pointing at `ppn`, flags untouched.
    #[inline]
    #[must_use]
    pub fn with_ppn(self, ppn: Ppn) -> Self {
        Self((self.0 & !(PPN_MASK << PPN_SHIFT)) | (ppn.as_u64() << PPN_SHIFT))
    }

    /// Returns a copy with `flags` set.
    #[inline]
    #[must_use]
    pub fn with(self, flags: PteFlags) -> Self {
        Self(self.0 | flags.bits())
    }

    /// Returns a copy with `flags` cleared.
    #[inline]
    #[must_use]
    pub fn without(self, flags: PteFlags) -> Self {
        Self(self.0 & !flags.bits())
    }

    /// The sharing transition: write-protected and marked copy-on-write.
    #[inline]
    #[must_use]
    pub fn into_shared(self) -> Self {
        self.without(PteFlags::WRITE).with(PteFlags::CUSTOM)
    }

    /// The ownership transition: writable and no longer intercepted.
    #[inline]
    #[must_use]
    pub fn into_exclusive(self) -> Self {
        self.with(PteFlags::WRITE).without(PteFlags::CUSTOM)
    }

    /// Checks that this entry may be stored at `level`.
    ///
    /// The copy-on-write marker is a leaf-only concept.
    pub fn check_level(self, level: Level) -> Result<Self, VmmError> {
        if !level.is_leaf() && self.is_custom() {
            return Err(VmmError::CustomOnInterior(level));
        }
        Ok(self)
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("ppn", &self.ppn())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Diagnostic form: `PPN: 0x<hex> Flags: CWRV`, with `-` for clear flags.
impl fmt::Display for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "PPN: 0x{:X} Flags: {}{}{}{}",
            self.ppn(),
            flag(self.is_custom(), 'C'),
            flag(self.is_writable(), 'W'),
            flag(self.is_readable(), 'R'),
            flag(self.is_valid(), 'V'),
        )
    }
}
