//! Per-process address spaces.
//!
//! An [`AddressSpace`] owns the root table of one page-table tree. All
//! tables and data pages live in a shared [`PageStore`], and the
//! copy-on-write bookkeeping in a shared [`RefLedger`], so both are passed
//! in per call rather than held.

use vms_core::addr::{PageIndex, VirtAddr};
use vms_core::kdebug;
use vms_core::paging::Level;

use crate::VmmError;
use crate::fault::{self, FaultError, Resolution};
use crate::fork;
use crate::ledger::RefLedger;
use crate::pte::PteFlags;
use crate::store::PageStore;
use crate::table::{self, PteSlot, TreeCensus};

/// A page-table tree identified by its root table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    /// Page holding the L2 table.
    root: PageIndex,
}

impl AddressSpace {
    /// Creates an empty address space with a freshly allocated root.
    pub fn new<S: PageStore + ?Sized>(store: &mut S) -> Result<Self, VmmError> {
        let root = table::new_table(store)?;
        kdebug!("address space: new root {}", root);
        Ok(Self { root })
    }

    /// Wraps an existing root table.
    pub const fn from_root(root: PageIndex) -> Self {
        Self { root }
    }

    /// Page holding the root table.
    pub const fn root(&self) -> PageIndex {
        self.root
    }

    /// Maps `addr` to `page` with `access` rights, allocating tables as
    /// needed.
    pub fn map<S: PageStore + ?Sized>(
        &self,
        store: &mut S,
        addr: VirtAddr,
        page: PageIndex,
        access: PteFlags,
    ) -> Result<PteSlot, VmmError> {
        table::map(store, self.root, addr, page, access)
    }

    /// Allocates a zeroed page and maps it at `addr`.
    pub fn map_new<S: PageStore + ?Sized>(
        &self,
        store: &mut S,
        addr: VirtAddr,
        access: PteFlags,
    ) -> Result<PageIndex, VmmError> {
        let page = store.allocate_page().ok_or(VmmError::OutOfMemory)?;
        self.map(store, addr, page, access)?;
        Ok(page)
    }

    /// Data page mapped at `addr`, if any.
    pub fn translate<S: PageStore + ?Sized>(&self, store: &S, addr: VirtAddr) -> Option<PageIndex> {
        table::translate(store, self.root, addr)
    }

    /// Table and leaf counts of this tree.
    pub fn census<S: PageStore + ?Sized>(&self, store: &S) -> Result<TreeCensus, VmmError> {
        table::census(store, self.root)
    }

    /// Creates a child address space holding private copies of every page.
    pub fn fork_copy<S: PageStore + ?Sized>(&self, store: &mut S) -> Result<Self, VmmError> {
        fork::fork_copy(store, self.root).map(Self::from_root)
    }

    /// Creates a child address space sharing this one's data pages
    /// copy-on-write.
    pub fn fork_copy_on_write<S: PageStore + ?Sized>(
        &self,
        store: &mut S,
        ledger: &RefLedger,
    ) -> Result<Self, VmmError> {
        fork::fork_copy_on_write(store, ledger, self.root).map(Self::from_root)
    }

    /// Resolves a copy-on-write fault at `addr` in this address space.
    pub fn resolve_fault<S: PageStore + ?Sized>(
        &self,
        store: &mut S,
        ledger: &RefLedger,
        addr: VirtAddr,
    ) -> Result<Resolution, FaultError> {
        fault::resolve_fault(store, ledger, self.root, addr, Level::L0)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::store::ArenaStore;
    use vms_core::config::StoreConfig;

    #[test]
    fn map_new_then_translate() {
        let mut store = ArenaStore::new(StoreConfig::with_pages(8)).unwrap();
        let space = AddressSpace::new(&mut store).unwrap();
        let addr = VirtAddr::new(0x20_0000);
        let page = space.map_new(&mut store, addr, PteFlags::READ).unwrap();
        assert_eq!(space.translate(&store, addr), Some(page));
        assert_eq!(space.translate(&store, VirtAddr::new(0x1000)), None);
        assert_eq!(
            space.census(&store).unwrap(),
            TreeCensus {
                tables: 3,
                leaves: 1
            }
        );
    }

    #[test]
    fn cow_child_then_write_in_child() {
        let mut store = ArenaStore::new(StoreConfig::with_pages(16)).unwrap();
        let ledger = RefLedger::new(store.max_pages());
        let parent = AddressSpace::new(&mut store).unwrap();
        let addr = VirtAddr::new(0x3000);
        let page = parent
            .map_new(&mut store, addr, PteFlags::READ | PteFlags::WRITE)
            .unwrap();

        let child = parent.fork_copy_on_write(&mut store, &ledger).unwrap();
        let Resolution::Copied { from, to } = child.resolve_fault(&mut store, &ledger, addr).unwrap()
        else {
            panic!("shared page was not copied");
        };
        assert_eq!(from, page);
        assert_eq!(child.translate(&store, addr), Some(to));
        assert_eq!(parent.translate(&store, addr), Some(page));
    }

    #[test]
    fn fault_on_unmapped_address_is_a_violation() {
        let mut store = ArenaStore::new(StoreConfig::with_pages(4)).unwrap();
        let ledger = RefLedger::new(store.max_pages());
        let space = AddressSpace::new(&mut store).unwrap();
        assert!(matches!(
            space.resolve_fault(&mut store, &ledger, VirtAddr::new(0x5000)),
            Err(FaultError::AccessViolation { .. })
        ));
    }
}
