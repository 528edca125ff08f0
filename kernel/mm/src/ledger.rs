//! Reference ledger for shared leaf pages.
//!
//! One atomic counter per physical page index counts the leaf mappings
//! that name the page. A count of 0 means the page has never been shared
//! and has at most one untracked owner; 1 means a single tracked owner.
//! Anything above 1 means the page is shared copy-on-write.
//!
//! Alongside the counts the ledger keeps a reverse map from each shared
//! page to the leaf slots that map it, so that when a copy-on-write fault
//! leaves exactly one sharer behind, that sharer can be found and handed
//! the page outright. The reverse map is guarded by a [`SpinLock`]; the
//! counters can be read without it.
//!
//! Table pages are never recorded here.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use vms_core::addr::PageIndex;
use vms_core::kwarn;
use vms_core::sync::SpinLock;

use crate::loom_compat::{AtomicU32, Ordering};
use crate::table::PteSlot;

/// Outcome of dropping one mapping of a shared page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    /// Count left after the release.
    pub remaining: u32,
    /// The last remaining mapping, when exactly one is left.
    pub survivor: Option<PteSlot>,
}

/// Per-page reference counts plus the sharer reverse map.
pub struct RefLedger {
    counts: Box<[AtomicU32]>,
    sharers: SpinLock<BTreeMap<PageIndex, Vec<PteSlot>>>,
}

impl RefLedger {
    /// Creates a ledger for `capacity` pages, all counts zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            counts: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            sharers: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Number of pages this ledger can track.
    pub fn capacity(&self) -> usize {
        self.counts.len()
    }

    fn counter(&self, page: PageIndex) -> &AtomicU32 {
        &self.counts[page.as_usize()]
    }

    /// Current count for `page`.
    pub fn count(&self, page: PageIndex) -> u32 {
        self.counter(page).load(Ordering::Acquire)
    }

    /// Atomically increments the count and returns the new value.
    pub fn increment(&self, page: PageIndex) -> u32 {
        self.counter(page).fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Atomically decrements the count and returns the new value.
    ///
    /// A count already at zero stays at zero.
    pub fn decrement(&self, page: PageIndex) -> u32 {
        match self
            .counter(page)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => {
                kwarn!("ledger: reference count underflow on page {}", page);
                0
            }
        }
    }

    /// Overwrites the count for `page`.
    pub fn set(&self, page: PageIndex, count: u32) {
        self.counter(page).store(count, Ordering::Release);
    }

    /// Records that `child` now maps `page` alongside the existing mapping
    /// at `parent`, and returns the new count.
    ///
    /// The count is the number of recorded sharers. A parent mapping not yet
    /// recorded joins together with its child (+2); a recorded one adds only
    /// the child (+1). Several parent mappings of the same page each join.
    pub fn share(&self, page: PageIndex, parent: PteSlot, child: PteSlot) -> u32 {
        self.sharers.with(|sharers| {
            let slots = sharers.entry(page).or_default();
            if slots.is_empty() {
                self.set(page, 0);
            }
            let mut count = self.count(page);
            for slot in [parent, child] {
                if !slots.contains(&slot) {
                    slots.push(slot);
                    count = self.increment(page);
                }
            }
            debug_assert_eq!(count as usize, slots.len(), "sharer list out of sync");
            count
        })
    }

    /// Drops the mapping at `slot` from `page`.
    ///
    /// When exactly one mapping remains it is reported as the survivor and
    /// the page stops being tracked as shared.
    pub fn release(&self, page: PageIndex, slot: PteSlot) -> Release {
        self.sharers.with(|sharers| {
            let remaining = self.decrement(page);
            let mut survivor = None;
            if let Some(slots) = sharers.get_mut(&page) {
                if let Some(pos) = slots.iter().position(|s| *s == slot) {
                    slots.swap_remove(pos);
                }
                if remaining <= 1 {
                    if remaining == 1 {
                        survivor = slots.pop();
                    }
                    sharers.remove(&page);
                }
            }
            Release {
                remaining,
                survivor,
            }
        })
    }

    /// Leaf slots currently recorded as sharing `page`, in slot order.
    pub fn sharers(&self, page: PageIndex) -> Vec<PteSlot> {
        let mut slots = self
            .sharers
            .with(|sharers| sharers.get(&page).cloned().unwrap_or_default());
        slots.sort_unstable();
        slots
    }

    /// Number of pages currently shared by more than one mapping.
    pub fn shared_pages(&self) -> usize {
        self.sharers.with(|sharers| sharers.len())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn slot(table: usize, index: usize) -> PteSlot {
        PteSlot::new(PageIndex::new(table), index)
    }

    #[test]
    fn counts_start_at_zero() {
        let ledger = RefLedger::new(8);
        assert_eq!(ledger.capacity(), 8);
        assert!((0..8).all(|i| ledger.count(PageIndex::new(i)) == 0));
    }

    #[test]
    fn increment_and_decrement() {
        let ledger = RefLedger::new(4);
        let p = PageIndex::new(2);
        assert_eq!(ledger.increment(p), 1);
        assert_eq!(ledger.increment(p), 2);
        assert_eq!(ledger.decrement(p), 1);
        ledger.set(p, 7);
        assert_eq!(ledger.count(p), 7);
    }

    #[test]
    fn first_share_counts_both_mappings() {
        let ledger = RefLedger::new(16);
        let page = PageIndex::new(7);
        assert_eq!(ledger.share(page, slot(1, 0), slot(2, 0)), 2);
        assert_eq!(ledger.count(page), 2);
        assert_eq!(ledger.sharers(page), [slot(1, 0), slot(2, 0)]);
    }

    #[test]
    fn sharing_a_shared_page_adds_one() {
        let ledger = RefLedger::new(16);
        let page = PageIndex::new(7);
        ledger.share(page, slot(1, 0), slot(2, 0));
        // A second fork of either sharer adds only the new child.
        assert_eq!(ledger.share(page, slot(2, 0), slot(3, 0)), 3);
        assert_eq!(ledger.sharers(page).len(), 3);
    }

    #[test]
    fn aliased_parent_mappings_each_count() {
        let ledger = RefLedger::new(16);
        let page = PageIndex::new(5);
        assert_eq!(ledger.share(page, slot(1, 0), slot(2, 0)), 2);
        assert_eq!(ledger.share(page, slot(1, 1), slot(2, 1)), 4);
        assert_eq!(ledger.count(page), 4);

        let release = ledger.release(page, slot(2, 0));
        assert_eq!(release.remaining, 3);
        assert_eq!(release.survivor, None);
    }

    #[test]
    fn sharing_a_tracked_sole_owner() {
        let ledger = RefLedger::new(16);
        let page = PageIndex::new(4);
        ledger.set(page, 1);
        assert_eq!(ledger.share(page, slot(1, 0), slot(2, 0)), 2);
    }

    #[test]
    fn release_reports_survivor_at_one() {
        let ledger = RefLedger::new(16);
        let page = PageIndex::new(7);
        ledger.share(page, slot(1, 0), slot(2, 0));

        let release = ledger.release(page, slot(2, 0));
        assert_eq!(
            release,
            Release {
                remaining: 1,
                survivor: Some(slot(1, 0)),
            }
        );
        assert!(ledger.sharers(page).is_empty());
        assert_eq!(ledger.shared_pages(), 0);
    }

    #[test]
    fn release_above_one_has_no_survivor() {
        let ledger = RefLedger::new(16);
        let page = PageIndex::new(7);
        ledger.share(page, slot(1, 0), slot(2, 0));
        ledger.share(page, slot(1, 0), slot(3, 0));

        let release = ledger.release(page, slot(1, 0));
        assert_eq!(release.remaining, 2);
        assert_eq!(release.survivor, None);
        assert_eq!(ledger.sharers(page), [slot(2, 0), slot(3, 0)]);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        use std::sync::Arc;

        let ledger = Arc::new(RefLedger::new(1));
        let page = PageIndex::new(0);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        ledger.increment(page);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ledger.count(page), 2000);
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;

    #[test]
    fn concurrent_copy_faults_decrement_once_each() {
        loom::model(|| {
            let ledger = Arc::new(RefLedger::new(1));
            let page = PageIndex::new(0);
            ledger.set(page, 3);

            let other = {
                let ledger = Arc::clone(&ledger);
                loom::thread::spawn(move || ledger.decrement(page))
            };
            let mine = ledger.decrement(page);
            let theirs = other.join().unwrap();

            let mut seen = [mine, theirs];
            seen.sort_unstable();
            assert_eq!(seen, [1, 2]);
            assert_eq!(ledger.count(page), 1);
        });
    }
}
