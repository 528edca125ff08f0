//! Copy-on-write fault resolution.
//!
//! The trap layer calls [`resolve_fault`] with the faulting address, the
//! level it faulted at and the faulting process's root table. A fault is
//! only resolvable when the entry is valid, readable and carries the
//! copy-on-write marker; anything else is an access violation that the
//! caller must treat as fatal for the faulting context.
//!
//! A resolvable fault either copies the page (it is still shared) or hands
//! the page to the faulting mapping outright (it is the last owner). Only
//! the faulting entry, the ledger and, when a copy leaves a single sharer
//! behind, that sharer's entry are modified. No table pages are allocated.

use core::fmt;

use vms_core::addr::{PageIndex, VirtAddr};
use vms_core::paging::Level;
use vms_core::{kdebug, kerr, ktrace, kwarn};

use crate::VmmError;
use crate::ledger::RefLedger;
use crate::store::PageStore;
use crate::table::{self, PteSlot};

/// Why a fault could not be resolved. Checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// No valid mapping exists for the address.
    NotValid,
    /// The mapping is not copy-on-write protected.
    NotCopyOnWrite,
    /// The mapping does not permit reads.
    NotReadable,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::NotValid => write!(f, "no valid mapping"),
            Violation::NotCopyOnWrite => write!(f, "mapping is not copy-on-write"),
            Violation::NotReadable => write!(f, "mapping is not readable"),
        }
    }
}

/// Fatal fault outcomes. None of them is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The faulting access is not a copy-on-write trap.
    AccessViolation {
        /// Faulting address.
        addr: VirtAddr,
        /// Level the fault was reported at.
        level: Level,
        /// The first check that failed.
        violation: Violation,
    },
    /// No page was available for the private copy.
    OutOfMemory,
    /// The page tables or ledger are inconsistent.
    Table(VmmError),
}

impl From<VmmError> for FaultError {
    fn from(err: VmmError) -> Self {
        match err {
            VmmError::OutOfMemory => FaultError::OutOfMemory,
            other => FaultError::Table(other),
        }
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::AccessViolation {
                addr,
                level,
                violation,
            } => write!(f, "access violation at {addr} ({level}): {violation}"),
            FaultError::OutOfMemory => write!(f, "out of physical memory"),
            FaultError::Table(err) => write!(f, "page table error: {err}"),
        }
    }
}

/// How a copy-on-write fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The page was still shared; the faulting mapping now owns a copy.
    Copied {
        /// The shared page the mapping left.
        from: PageIndex,
        /// The fresh private copy.
        to: PageIndex,
    },
    /// The faulting mapping was the last owner and keeps the page.
    Reclaimed {
        /// The page now exclusively owned.
        page: PageIndex,
    },
}

/// Resolves a write fault at `addr`, reported at `level`, in the tree
/// rooted at `root`.
pub fn resolve_fault<S: PageStore + ?Sized>(
    store: &mut S,
    ledger: &RefLedger,
    root: PageIndex,
    addr: VirtAddr,
    level: Level,
) -> Result<Resolution, FaultError> {
    let slot = match table::walk(store, root, addr, level) {
        Ok(slot) => slot,
        Err(err @ VmmError::NotMapped { .. }) => {
            kdebug!("fault at {} ({}): {}", addr, level, err);
            return Err(violation(addr, level, Violation::NotValid));
        }
        Err(err) => return Err(err.into()),
    };
    let entry = table::read_entry(store, slot);
    kdebug!("fault at {} ({}): {}", addr, level, entry);

    if !entry.is_valid() {
        return Err(violation(addr, level, Violation::NotValid));
    }
    if !entry.is_custom() {
        return Err(violation(addr, level, Violation::NotCopyOnWrite));
    }
    if !entry.is_readable() {
        return Err(violation(addr, level, Violation::NotReadable));
    }

    let old = table::target(store, entry)?;
    tracked(ledger, old)?;

    if ledger.count(old) > 1 {
        let new = store.allocate_page().ok_or(FaultError::OutOfMemory)?;
        tracked(ledger, new)?;
        store.copy_page(new, old);

        let ppn = store.ppn_of(new);
        table::write_entry(store, slot, level, entry.with_ppn(ppn).into_exclusive())?;
        ledger.set(new, 1);

        let release = ledger.release(old, slot);
        ktrace!(
            "cow: {} copied {} -> {}, {} sharer(s) left",
            addr,
            old,
            new,
            release.remaining
        );
        if let Some(survivor) = release.survivor {
            hand_over(store, survivor, old)?;
        }
        Ok(Resolution::Copied { from: old, to: new })
    } else {
        table::write_entry(store, slot, level, entry.into_exclusive())?;
        ktrace!("cow: {} reclaimed {} as last owner", addr, old);
        Ok(Resolution::Reclaimed { page: old })
    }
}

fn violation(addr: VirtAddr, level: Level, violation: Violation) -> FaultError {
    kerr!("fatal fault at {} ({}): {}", addr, level, violation);
    FaultError::AccessViolation {
        addr,
        level,
        violation,
    }
}

fn tracked(ledger: &RefLedger, page: PageIndex) -> Result<(), VmmError> {
    if page.as_usize() < ledger.capacity() {
        Ok(())
    } else {
        Err(VmmError::LedgerTooSmall)
    }
}

/// Makes the last remaining mapping of `page` writable and unmarked.
fn hand_over<S: PageStore + ?Sized>(
    store: &mut S,
    survivor: PteSlot,
    page: PageIndex,
) -> Result<(), VmmError> {
    let entry = table::read_entry(store, survivor);
    if !entry.is_valid() || store.page_of(entry.ppn()) != Some(page) {
        kwarn!(
            "cow: survivor slot {:?} no longer maps {}, leaving it alone",
            survivor,
            page
        );
        return Ok(());
    }
    if entry.is_custom() {
        table::write_entry(store, survivor, Level::L0, entry.into_exclusive())?;
        ktrace!("cow: {} handed back to its last sharer", page);
    }
    Ok(())
}
