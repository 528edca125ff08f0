//! Physical page store.
//!
//! [`PageStore`] is the seam to the physical memory allocator: it hands out
//! zeroed pages by dense [`PageIndex`] and translates between indices and
//! the frame numbers stored in page-table entries. [`ArenaStore`] is a
//! host-memory implementation where page `i` has frame `base_ppn + i`.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use vms_core::addr::{PageIndex, Ppn};
use vms_core::config::{ConfigError, StoreConfig};
use vms_core::paging::PAGE_SIZE;

/// Raw contents of one physical page.
pub type PageBytes = [u8; PAGE_SIZE];

/// A source of physical pages.
///
/// Pages are never returned through this interface; reclamation belongs to
/// whoever tears down address spaces.
pub trait PageStore {
    /// Allocates a zeroed page, returning `None` if the store is exhausted.
    fn allocate_page(&mut self) -> Option<PageIndex>;

    /// Number of pages that can still be allocated.
    fn free_pages(&self) -> usize;

    /// Total number of pages this store can ever hand out (`MAX_PAGES`).
    fn max_pages(&self) -> usize;

    /// Frame number of an allocated page.
    fn ppn_of(&self, page: PageIndex) -> Ppn;

    /// Page index for a frame number, or `None` if the frame is not one of
    /// this store's allocated pages.
    fn page_of(&self, ppn: Ppn) -> Option<PageIndex>;

    /// Contents of an allocated page.
    fn page(&self, page: PageIndex) -> &PageBytes;

    /// Mutable contents of an allocated page.
    fn page_mut(&mut self, page: PageIndex) -> &mut PageBytes;

    /// Copies the full contents of `src` over `dst`.
    fn copy_page(&mut self, dst: PageIndex, src: PageIndex) {
        if dst != src {
            let bytes = *self.page(src);
            *self.page_mut(dst) = bytes;
        }
    }
}

/// A page store backed by host memory.
pub struct ArenaStore {
    pages: Vec<Box<PageBytes>>,
    config: StoreConfig,
}

impl ArenaStore {
    /// Creates an empty store.
    pub fn new(config: StoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            pages: Vec::new(),
            config,
        })
    }

    /// Number of pages handed out so far.
    pub fn allocated(&self) -> usize {
        self.pages.len()
    }

    /// Returns the configuration this store was built with.
    pub fn config(&self) -> StoreConfig {
        self.config
    }
}

impl PageStore for ArenaStore {
    fn allocate_page(&mut self) -> Option<PageIndex> {
        if self.pages.len() >= self.config.max_pages {
            return None;
        }
        self.pages.push(Box::new([0; PAGE_SIZE]));
        Some(PageIndex::new(self.pages.len() - 1))
    }

    fn free_pages(&self) -> usize {
        self.config.max_pages - self.pages.len()
    }

    fn max_pages(&self) -> usize {
        self.config.max_pages
    }

    fn ppn_of(&self, page: PageIndex) -> Ppn {
        debug_assert!(page.as_usize() < self.pages.len(), "page {page} not allocated");
        Ppn::new(self.config.base_ppn + page.as_usize() as u64)
    }

    fn page_of(&self, ppn: Ppn) -> Option<PageIndex> {
        let index = ppn.as_u64().checked_sub(self.config.base_ppn)?;
        let index = usize::try_from(index).ok()?;
        (index < self.pages.len()).then_some(PageIndex::new(index))
    }

    fn page(&self, page: PageIndex) -> &PageBytes {
        &self.pages[page.as_usize()]
    }

    fn page_mut(&mut self, page: PageIndex) -> &mut PageBytes {
        &mut self.pages[page.as_usize()]
    }
}
