//! Page table access and traversal.
//!
//! A page table is an ordinary store page read as [`NUM_PTE_ENTRIES`]
//! little-endian 64-bit entries. Entries are addressed by [`PteSlot`]
//! (table page + index); a parent entry refers to its child table by frame
//! number, translated back through the [`PageStore`].
//!
//! Every write goes through [`write_entry`], which refuses the copy-on-write
//! marker on interior levels.

use vms_core::addr::{PageIndex, VirtAddr};
use vms_core::paging::{Level, NUM_PTE_ENTRIES, PTE_SIZE};

use crate::VmmError;
use crate::pte::{PageTableEntry, PteFlags};
use crate::store::PageStore;

/// Location of a single entry: the table page holding it and its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PteSlot {
    /// Page holding the table.
    pub table: PageIndex,
    /// Entry index within the table.
    pub index: usize,
}

impl PteSlot {
    /// Creates a slot. `index` must be below [`NUM_PTE_ENTRIES`].
    #[inline]
    pub const fn new(table: PageIndex, index: usize) -> Self {
        debug_assert!(index < NUM_PTE_ENTRIES, "PTE index out of range");
        Self { table, index }
    }
}

/// Reads the entry at `slot`.
pub fn read_entry<S: PageStore + ?Sized>(store: &S, slot: PteSlot) -> PageTableEntry {
    let offset = slot.index * PTE_SIZE;
    let mut word = [0u8; PTE_SIZE];
    word.copy_from_slice(&store.page(slot.table)[offset..offset + PTE_SIZE]);
    PageTableEntry::from_bits(u64::from_le_bytes(word))
}

/// Writes `entry` into `slot`, which lives in a table at `level`.
pub fn write_entry<S: PageStore + ?Sized>(
    store: &mut S,
    slot: PteSlot,
    level: Level,
    entry: PageTableEntry,
) -> Result<(), VmmError> {
    let entry = entry.check_level(level)?;
    let offset = slot.index * PTE_SIZE;
    store.page_mut(slot.table)[offset..offset + PTE_SIZE]
        .copy_from_slice(&entry.bits().to_le_bytes());
    Ok(())
}

/// Allocates a zeroed page to serve as a table.
pub fn new_table<S: PageStore + ?Sized>(store: &mut S) -> Result<PageIndex, VmmError> {
    store.allocate_page().ok_or(VmmError::OutOfMemory)
}

/// Resolves the page a valid entry points at.
pub fn target<S: PageStore + ?Sized>(
    store: &S,
    entry: PageTableEntry,
) -> Result<PageIndex, VmmError> {
    store
        .page_of(entry.ppn())
        .ok_or(VmmError::BadFrame(entry.ppn()))
}

/// Walks from `root` to the entry for `addr` at `level`.
///
/// Interior entries on the way must be valid; the returned entry itself
/// may be in any state.
pub fn walk<S: PageStore + ?Sized>(
    store: &S,
    root: PageIndex,
    addr: VirtAddr,
    level: Level,
) -> Result<PteSlot, VmmError> {
    let mut table = root;
    for current in Level::TOP_DOWN {
        let slot = PteSlot::new(table, addr.vpn(current));
        if current == level {
            return Ok(slot);
        }
        let entry = read_entry(store, slot);
        if !entry.is_valid() {
            return Err(VmmError::NotMapped { level: current });
        }
        table = target(store, entry)?;
    }
    unreachable!("walk descended past the leaf level")
}

/// Installs a leaf mapping `addr -> page` with `access` rights.
///
/// Missing interior tables are allocated. Fails with
/// [`VmmError::AlreadyMapped`] if the leaf entry is already valid.
pub fn map<S: PageStore + ?Sized>(
    store: &mut S,
    root: PageIndex,
    addr: VirtAddr,
    page: PageIndex,
    access: PteFlags,
) -> Result<PteSlot, VmmError> {
    let mut table = root;
    for level in [Level::L2, Level::L1] {
        let slot = PteSlot::new(table, addr.vpn(level));
        let entry = read_entry(store, slot);
        table = if entry.is_valid() {
            target(store, entry)?
        } else {
            let child = new_table(store)?;
            let entry = PageTableEntry::table(store.ppn_of(child));
            write_entry(store, slot, level, entry)?;
            child
        };
    }

    let slot = PteSlot::new(table, addr.vpn(Level::L0));
    if read_entry(store, slot).is_valid() {
        return Err(VmmError::AlreadyMapped);
    }
    let ppn = store.ppn_of(page);
    write_entry(store, slot, Level::L0, PageTableEntry::leaf(ppn, access))?;
    Ok(slot)
}

/// Translates `addr` to the data page it maps, if any.
pub fn translate<S: PageStore + ?Sized>(
    store: &S,
    root: PageIndex,
    addr: VirtAddr,
) -> Option<PageIndex> {
    let slot = walk(store, root, addr, Level::L0).ok()?;
    let entry = read_entry(store, slot);
    if !entry.is_valid() {
        return None;
    }
    target(store, entry).ok()
}

/// Calls `f` for every valid leaf entry of the tree, in address order.
pub fn for_each_leaf<S, F>(store: &S, root: PageIndex, mut f: F) -> Result<(), VmmError>
where
    S: PageStore + ?Sized,
    F: FnMut(VirtAddr, PteSlot, PageTableEntry),
{
    for i in 0..NUM_PTE_ENTRIES {
        let l2 = read_entry(store, PteSlot::new(root, i));
        if !l2.is_valid() {
            continue;
        }
        let l1_table = target(store, l2)?;
        for j in 0..NUM_PTE_ENTRIES {
            let l1 = read_entry(store, PteSlot::new(l1_table, j));
            if !l1.is_valid() {
                continue;
            }
            let l0_table = target(store, l1)?;
            for k in 0..NUM_PTE_ENTRIES {
                let slot = PteSlot::new(l0_table, k);
                let leaf = read_entry(store, slot);
                if leaf.is_valid() {
                    f(VirtAddr::from_indices(i, j, k), slot, leaf);
                }
            }
        }
    }
    Ok(())
}

/// Page counts of a tree, used to reserve pages before duplicating it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeCensus {
    /// Table pages, root included.
    pub tables: usize,
    /// Valid leaf entries.
    pub leaves: usize,
}

/// Counts the table pages and valid leaves reachable from `root`.
pub fn census<S: PageStore + ?Sized>(store: &S, root: PageIndex) -> Result<TreeCensus, VmmError> {
    let mut census = TreeCensus {
        tables: 1,
        leaves: 0,
    };
    for i in 0..NUM_PTE_ENTRIES {
        let l2 = read_entry(store, PteSlot::new(root, i));
        if !l2.is_valid() {
            continue;
        }
        census.tables += 1;
        let l1_table = target(store, l2)?;
        for j in 0..NUM_PTE_ENTRIES {
            let l1 = read_entry(store, PteSlot::new(l1_table, j));
            if !l1.is_valid() {
                continue;
            }
            census.tables += 1;
            let l0_table = target(store, l1)?;
            census.leaves += (0..NUM_PTE_ENTRIES)
                .filter(|&k| read_entry(store, PteSlot::new(l0_table, k)).is_valid())
                .count();
        }
    }
    Ok(census)
}
