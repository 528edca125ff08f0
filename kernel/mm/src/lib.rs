//! Copy-on-write memory management core.
//!
//! Three-level page-table trees live in a [`PageStore`](store::PageStore).
//! A tree can be duplicated eagerly ([`fork::fork_copy`]) or lazily
//! ([`fork::fork_copy_on_write`]); lazily shared pages are counted in a
//! [`RefLedger`](ledger::RefLedger) and split on demand by
//! [`fault::resolve_fault`]. [`AddressSpace`](address_space::AddressSpace)
//! ties a root table to those operations.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
pub mod fault;
pub mod fork;
pub mod ledger;
mod loom_compat;
pub mod pte;
pub mod store;
pub mod table;

use core::fmt;

use vms_core::addr::Ppn;
use vms_core::paging::Level;

pub use address_space::AddressSpace;
pub use fault::{FaultError, Resolution, Violation};
pub use ledger::RefLedger;
pub use pte::{PageTableEntry, PteFlags};
pub use store::{ArenaStore, PageStore};

/// Page-table and allocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// The store has no free page.
    OutOfMemory,
    /// An interior entry on the walk is not valid.
    NotMapped {
        /// Level of the first invalid entry.
        level: Level,
    },
    /// The leaf entry is already valid.
    AlreadyMapped,
    /// A valid entry names a frame outside the store.
    BadFrame(Ppn),
    /// The copy-on-write marker was written to an interior entry.
    CustomOnInterior(Level),
    /// The ledger cannot track every page of the store.
    LedgerTooSmall,
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmmError::OutOfMemory => write!(f, "out of physical memory"),
            VmmError::NotMapped { level } => write!(f, "no valid {level} entry"),
            VmmError::AlreadyMapped => write!(f, "page already mapped"),
            VmmError::BadFrame(ppn) => write!(f, "frame {ppn} outside the page store"),
            VmmError::CustomOnInterior(level) => {
                write!(f, "copy-on-write marker on {level} table entry")
            }
            VmmError::LedgerTooSmall => write!(f, "reference ledger smaller than page store"),
        }
    }
}
