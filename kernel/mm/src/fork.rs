//! Page-table tree duplication.
//!
//! Two strategies build a child tree from a parent tree:
//!
//! - [`fork_copy`] deep-copies every table page and every data page. The
//!   child shares nothing with the parent and the ledger is not involved.
//! - [`fork_copy_on_write`] copies only the table pages. Each leaf of the
//!   child maps the parent's data page; writable leaves are downgraded on
//!   both sides to read-only + copy-on-write, and the ledger records the
//!   extra mapping.
//!
//! Table pages are never shared between trees, whichever strategy is used.
//!
//! # Allocation failure
//!
//! Both strategies count the pages they need before touching anything and
//! fail with [`VmmError::OutOfMemory`] if the store cannot supply them, so
//! a failed duplication leaves the parent and the ledger exactly as they
//! were. Should the store still fail part-way (a store whose free count
//! lies), the partially built child is abandoned and must not be installed.

use vms_core::addr::PageIndex;
use vms_core::paging::{Level, NUM_PTE_ENTRIES};
use vms_core::{kerr, kinfo, ktrace};

use crate::VmmError;
use crate::ledger::RefLedger;
use crate::pte::PageTableEntry;
use crate::store::PageStore;
use crate::table::{self, PteSlot};

/// Deep-copies the tree rooted at `parent_root`, data pages included, and
/// returns the child's root.
///
/// Every child leaf carries the same `read`/`write`/`custom` flags as its
/// parent leaf but maps a private copy of the data.
pub fn fork_copy<S: PageStore + ?Sized>(
    store: &mut S,
    parent_root: PageIndex,
) -> Result<PageIndex, VmmError> {
    let census = table::census(store, parent_root)?;
    reserve(store, census.tables + census.leaves)?;

    let child_root = duplicate_tables(store, parent_root, true, |store, _, child_slot, parent| {
        let src = table::target(store, parent)?;
        let dst = store.allocate_page().ok_or(VmmError::OutOfMemory)?;
        store.copy_page(dst, src);
        let entry = PageTableEntry::leaf(store.ppn_of(dst), parent.flags());
        table::write_entry(store, child_slot, Level::L0, entry)
    })?;

    kinfo!(
        "fork: copied tree {} -> {} ({} tables, {} data pages)",
        parent_root,
        child_root,
        census.tables,
        census.leaves
    );
    Ok(child_root)
}

/// Duplicates the table structure of the tree rooted at `parent_root`,
/// sharing its data pages copy-on-write, and returns the child's root.
///
/// Writable parent leaves become read-only and copy-on-write on both
/// sides; other leaves are mirrored verbatim. Every shared page gains one
/// ledger count per new mapping (a previously unshared page goes to 2).
pub fn fork_copy_on_write<S: PageStore + ?Sized>(
    store: &mut S,
    ledger: &RefLedger,
    parent_root: PageIndex,
) -> Result<PageIndex, VmmError> {
    if ledger.capacity() < store.max_pages() {
        return Err(VmmError::LedgerTooSmall);
    }
    let census = table::census(store, parent_root)?;
    reserve(store, census.tables)?;

    let mut downgraded = 0usize;
    let child_root =
        duplicate_tables(store, parent_root, false, |store, parent_slot, child_slot, parent| {
            let page = table::target(store, parent)?;
            let entry = if parent.is_writable() {
                let shared = parent.into_shared();
                table::write_entry(store, parent_slot, Level::L0, shared)?;
                downgraded += 1;
                shared
            } else {
                parent
            };
            table::write_entry(store, child_slot, Level::L0, entry)?;

            let child = table::read_entry(store, child_slot);
            debug_assert_eq!(child.ppn(), parent.ppn(), "child leaf must alias the parent frame");

            let count = ledger.share(page, parent_slot, child_slot);
            ktrace!("fork: {} shared, count {}", page, count);
            Ok(())
        })?;

    kinfo!(
        "fork: cow tree {} -> {} ({} tables, {} leaves shared, {} downgraded)",
        parent_root,
        child_root,
        census.tables,
        census.leaves,
        downgraded
    );
    Ok(child_root)
}

fn reserve<S: PageStore + ?Sized>(store: &S, needed: usize) -> Result<(), VmmError> {
    let free = store.free_pages();
    if free < needed {
        kerr!("fork: need {} pages, only {} free", needed, free);
        return Err(VmmError::OutOfMemory);
    }
    Ok(())
}

/// Builds a fresh copy of every table page of the parent tree and calls
/// `leaf` for every valid parent leaf with the parent slot, the matching
/// child slot and the parent entry.
///
/// With `bulk` set, each new L1 and L0 table starts as a byte copy of its
/// parent table before its valid entries are relinked; otherwise it starts
/// zeroed.
fn duplicate_tables<S, F>(
    store: &mut S,
    parent_root: PageIndex,
    bulk: bool,
    mut leaf: F,
) -> Result<PageIndex, VmmError>
where
    S: PageStore + ?Sized,
    F: FnMut(&mut S, PteSlot, PteSlot, PageTableEntry) -> Result<(), VmmError>,
{
    let child_root = table::new_table(store)?;

    for i in 0..NUM_PTE_ENTRIES {
        let parent_l2 = table::read_entry(store, PteSlot::new(parent_root, i));
        if !parent_l2.is_valid() {
            continue;
        }
        let parent_l1 = table::target(store, parent_l2)?;
        let child_l1 = clone_table(store, parent_l1, bulk)?;
        link(store, PteSlot::new(child_root, i), Level::L2, child_l1)?;

        for j in 0..NUM_PTE_ENTRIES {
            let parent_l1e = table::read_entry(store, PteSlot::new(parent_l1, j));
            if !parent_l1e.is_valid() {
                continue;
            }
            let parent_l0 = table::target(store, parent_l1e)?;
            let child_l0 = clone_table(store, parent_l0, bulk)?;
            link(store, PteSlot::new(child_l1, j), Level::L1, child_l0)?;

            for k in 0..NUM_PTE_ENTRIES {
                let parent_slot = PteSlot::new(parent_l0, k);
                let parent = table::read_entry(store, parent_slot);
                if parent.is_valid() {
                    leaf(store, parent_slot, PteSlot::new(child_l0, k), parent)?;
                }
            }
        }
    }
    Ok(child_root)
}

fn clone_table<S: PageStore + ?Sized>(
    store: &mut S,
    parent: PageIndex,
    bulk: bool,
) -> Result<PageIndex, VmmError> {
    let child = table::new_table(store)?;
    if bulk {
        store.copy_page(child, parent);
    }
    Ok(child)
}

fn link<S: PageStore + ?Sized>(
    store: &mut S,
    slot: PteSlot,
    level: Level,
    child: PageIndex,
) -> Result<(), VmmError> {
    let entry = PageTableEntry::table(store.ppn_of(child));
    table::write_entry(store, slot, level, entry)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pte::PteFlags;
    use crate::store::ArenaStore;
    use vms_core::addr::VirtAddr;
    use vms_core::config::StoreConfig;

    fn store(pages: usize) -> ArenaStore {
        ArenaStore::new(StoreConfig::with_pages(pages)).unwrap()
    }

    fn leaf_at(store: &ArenaStore, root: PageIndex, addr: VirtAddr) -> PageTableEntry {
        let slot = table::walk(store, root, addr, Level::L0).unwrap();
        table::read_entry(store, slot)
    }

    #[test]
    fn eager_copy_of_empty_tree_is_one_page() {
        let mut s = store(4);
        let root = table::new_table(&mut s).unwrap();
        let child = fork_copy(&mut s, root).unwrap();
        assert_ne!(child, root);
        assert_eq!(s.allocated(), 2);
        assert_eq!(table::census(&s, child).unwrap().tables, 1);
    }

    #[test]
    fn eager_copy_preserves_flags_and_contents() {
        let mut s = store(32);
        let root = table::new_table(&mut s).unwrap();
        let addr = VirtAddr::from_indices(2, 3, 4);
        let page = s.allocate_page().unwrap();
        s.page_mut(page).fill(0x42);
        let access = PteFlags::READ | PteFlags::CUSTOM;
        table::map(&mut s, root, addr, page, access).unwrap();

        let child = fork_copy(&mut s, root).unwrap();
        let entry = leaf_at(&s, child, addr);
        assert_eq!(entry.flags(), PteFlags::VALID | access);
        let copy = s.page_of(entry.ppn()).unwrap();
        assert_ne!(copy, page);
        assert!(s.page(copy).iter().all(|&b| b == 0x42));
    }

    #[test]
    fn eager_copy_shares_no_table_pages() {
        let mut s = store(32);
        let root = table::new_table(&mut s).unwrap();
        let addr = VirtAddr::from_indices(0, 1, 2);
        let page = s.allocate_page().unwrap();
        table::map(&mut s, root, addr, page, PteFlags::READ).unwrap();

        let child = fork_copy(&mut s, root).unwrap();
        for level in [Level::L2, Level::L1, Level::L0] {
            let p = table::walk(&s, root, addr, level).unwrap();
            let c = table::walk(&s, child, addr, level).unwrap();
            assert_ne!(p.table, c.table, "{level} table aliased");
        }
    }

    #[test]
    fn eager_copy_fails_up_front_without_memory() {
        let mut s = store(6);
        let root = table::new_table(&mut s).unwrap();
        let page = s.allocate_page().unwrap();
        table::map(&mut s, root, VirtAddr::new(0x1000), page, PteFlags::READ).unwrap();
        // 4 pages used, 2 free; a copy needs 3 tables + 1 data page.
        assert_eq!(fork_copy(&mut s, root), Err(VmmError::OutOfMemory));
        assert_eq!(s.allocated(), 4);
    }

    #[test]
    fn cow_fork_downgrades_writable_leaves() {
        let mut s = store(32);
        let ledger = RefLedger::new(s.max_pages());
        let root = table::new_table(&mut s).unwrap();
        let addr = VirtAddr::new(0x7000);
        let page = s.allocate_page().unwrap();
        table::map(&mut s, root, addr, page, PteFlags::READ | PteFlags::WRITE).unwrap();

        let child = fork_copy_on_write(&mut s, &ledger, root).unwrap();
        let p = leaf_at(&s, root, addr);
        let c = leaf_at(&s, child, addr);
        for e in [p, c] {
            assert!(!e.is_writable());
            assert!(e.is_custom());
            assert!(e.is_readable());
            assert_eq!(s.page_of(e.ppn()), Some(page));
        }
        assert_eq!(ledger.count(page), 2);
    }

    #[test]
    fn cow_fork_mirrors_read_only_leaves() {
        let mut s = store(32);
        let ledger = RefLedger::new(s.max_pages());
        let root = table::new_table(&mut s).unwrap();
        let addr = VirtAddr::new(0x7000);
        let page = s.allocate_page().unwrap();
        table::map(&mut s, root, addr, page, PteFlags::READ).unwrap();

        let child = fork_copy_on_write(&mut s, &ledger, root).unwrap();
        let p = leaf_at(&s, root, addr);
        let c = leaf_at(&s, child, addr);
        assert_eq!(p.flags(), PteFlags::VALID | PteFlags::READ);
        assert_eq!(c, p);
        assert_eq!(ledger.count(page), 2);
    }

    #[test]
    fn cow_fork_copies_only_tables() {
        let mut s = store(32);
        let ledger = RefLedger::new(s.max_pages());
        let root = table::new_table(&mut s).unwrap();
        for l0 in 0..3 {
            let page = s.allocate_page().unwrap();
            let addr = VirtAddr::from_indices(0, 0, l0);
            table::map(&mut s, root, addr, page, PteFlags::READ | PteFlags::WRITE).unwrap();
        }
        let before = s.allocated();
        fork_copy_on_write(&mut s, &ledger, root).unwrap();
        assert_eq!(s.allocated() - before, 3);
    }

    #[test]
    fn cow_fork_without_memory_leaves_parent_untouched() {
        let mut s = store(5);
        let ledger = RefLedger::new(s.max_pages());
        let root = table::new_table(&mut s).unwrap();
        let addr = VirtAddr::new(0x1000);
        let page = s.allocate_page().unwrap();
        table::map(&mut s, root, addr, page, PteFlags::READ | PteFlags::WRITE).unwrap();

        assert_eq!(
            fork_copy_on_write(&mut s, &ledger, root),
            Err(VmmError::OutOfMemory)
        );
        assert!(leaf_at(&s, root, addr).is_writable());
        assert_eq!(ledger.count(page), 0);
    }

    #[test]
    fn cow_fork_rejects_small_ledger() {
        let mut s = store(8);
        let ledger = RefLedger::new(4);
        let root = table::new_table(&mut s).unwrap();
        assert_eq!(
            fork_copy_on_write(&mut s, &ledger, root),
            Err(VmmError::LedgerTooSmall)
        );
    }
}
