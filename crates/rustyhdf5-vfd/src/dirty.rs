//! Page-granular dirty-region set for the core driver.
//!
//! Regions are kept in a skip list keyed by their start address. After
//! every [`DirtySet::add`] the set is canonical: regions are page aligned
//! (the last one may be cut at end of file), do not overlap, and are never
//! adjacent, since touching regions are merged.

use rustyhdf5_skiplist::{Address, SkipList};
use tracing::trace;

use crate::addr::{align_down, align_up_end, Haddr, Region};
use crate::error::Result;

#[derive(Debug)]
pub struct DirtySet {
    page_size: u64,
    regions: SkipList<Address, Region>,
}

impl DirtySet {
    /// An empty set tracking pages of `page_size` bytes (must be non-zero).
    pub fn new(page_size: u64) -> Self {
        debug_assert!(page_size > 0);
        Self {
            page_size,
            regions: SkipList::new(),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Record that bytes `[start, end]` changed in a file whose end is
    /// `eof` (which must be past `end`).
    pub fn add(&mut self, start: Haddr, end: Haddr, eof: Haddr) -> Result<()> {
        debug_assert!(start <= end && end < eof);
        let start = align_down(start, self.page_size);
        let mut end = align_up_end(end, self.page_size).min(eof - 1);

        // Swallow regions starting inside or right after the new one.
        while let Some(id) = self.regions.above(&Address(start)) {
            let next = *self.regions.value(id);
            if next.start > end.saturating_add(1) {
                break;
            }
            end = end.max(next.end);
            self.regions.remove_at(id);
            trace!(absorbed = %next, start, end, "merged dirty region");
        }

        // Grow the region on the left if it touches.
        if let Some(id) = self.regions.below(&Address(start)) {
            let prev = self.regions.value_mut(id);
            if prev.end.saturating_add(1) >= start {
                prev.end = prev.end.max(end);
                trace!(region = %prev, "extended dirty region");
                return Ok(());
            }
        }

        self.regions.insert(Address(start), Region::new(start, end))?;
        trace!(start, end, "new dirty region");
        Ok(())
    }

    /// Remove and return the lowest region.
    pub fn take_first(&mut self) -> Option<Region> {
        self.regions.remove_first()
    }

    /// Current regions in address order.
    pub fn regions(&self) -> Vec<Region> {
        self.regions.iter().map(|(_, r)| *r).collect()
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }
}
