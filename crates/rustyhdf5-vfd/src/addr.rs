//! File addresses, overflow checks and byte regions.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Result, VfdError};

/// An unsigned file offset.
pub type Haddr = u64;

/// "No address".
pub const UNDEF: Haddr = u64::MAX;

/// Largest legal address.
pub const MAX_ADDR: Haddr = UNDEF - 1;

/// True when `addr` is not a usable address.
#[inline]
pub fn addr_overflow(addr: Haddr) -> bool {
    addr == UNDEF || addr > MAX_ADDR
}

/// True when `size` cannot describe a byte count inside the address space.
#[inline]
pub fn size_overflow(size: u64) -> bool {
    size > MAX_ADDR
}

/// True when `[addr, addr + size)` does not fit in the address space.
#[inline]
pub fn region_overflow(addr: Haddr, size: u64) -> bool {
    addr_overflow(addr)
        || size_overflow(size)
        || addr.checked_add(size).map_or(true, |end| end > MAX_ADDR)
}

/// Fail with [`VfdError::AddrOverflow`] if the region does not fit.
pub fn check_region(addr: Haddr, size: u64) -> Result<()> {
    if region_overflow(addr, size) {
        return Err(VfdError::AddrOverflow { addr, size });
    }
    Ok(())
}

/// `x` rounded down to a multiple of `page`.
#[inline]
pub fn align_down(x: Haddr, page: u64) -> Haddr {
    x - x % page
}

/// Last byte of the page holding `x`.
#[inline]
pub fn align_up_end(x: Haddr, page: u64) -> Haddr {
    align_down(x, page).saturating_add(page - 1)
}

/// Smallest multiple of `unit` that is at least `x`, or `None` on overflow.
#[inline]
pub fn round_up(x: u64, unit: u64) -> Option<u64> {
    match x % unit {
        0 => Some(x),
        rem => x.checked_add(unit - rem),
    }
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// Inclusive byte range `[start, end]`.
///
/// Regions compare and order by `start` only.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub start: Haddr,
    pub end: Haddr,
}

impl Region {
    /// Create a region. `start` must not exceed `end`.
    pub fn new(start: Haddr, end: Haddr) -> Self {
        debug_assert!(start <= end, "region [{start}, {end}] is reversed");
        Self { start, end }
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a region covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `addr` falls inside the region.
    pub fn contains(&self, addr: Haddr) -> bool {
        (self.start..=self.end).contains(&addr)
    }

    /// `(start, end)` pair, handy for assertions.
    pub fn bounds(&self) -> (Haddr, Haddr) {
        (self.start, self.end)
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start
    }
}

impl Eq for Region {}

impl PartialOrd for Region {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Region {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start.cmp(&other.start)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// Memory kinds
// ---------------------------------------------------------------------------

/// What an I/O request is for. The drivers here treat every kind alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemType {
    #[default]
    Default,
    /// Boot block / superblock.
    Super,
    /// B-tree nodes.
    Btree,
    /// Raw dataset bytes.
    Draw,
    /// Global heap.
    Gheap,
    /// Local heap.
    Lheap,
    /// Object headers.
    Ohdr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_checks() {
        assert!(addr_overflow(UNDEF));
        assert!(!addr_overflow(MAX_ADDR));
        assert!(!addr_overflow(0));

        assert!(size_overflow(UNDEF));
        assert!(!size_overflow(MAX_ADDR));

        assert!(!region_overflow(0, MAX_ADDR));
        assert!(region_overflow(1, MAX_ADDR));
        assert!(region_overflow(MAX_ADDR, 2));
        assert!(region_overflow(UNDEF, 0));
        assert!(!region_overflow(4096, 4096));

        assert!(matches!(
            check_region(u64::MAX - 4, 8),
            Err(VfdError::AddrOverflow { size: 8, .. })
        ));
    }

    #[test]
    fn page_alignment() {
        assert_eq!(align_down(5000, 4096), 4096);
        assert_eq!(align_down(4096, 4096), 4096);
        assert_eq!(align_up_end(5000, 4096), 8191);
        assert_eq!(align_up_end(0, 4096), 4095);
        assert_eq!(align_up_end(u64::MAX - 1, 4096), u64::MAX);
    }

    #[test]
    fn rounding_to_increment() {
        assert_eq!(round_up(4, 8192), Some(8192));
        assert_eq!(round_up(8192, 8192), Some(8192));
        assert_eq!(round_up(8193, 8192), Some(16384));
        assert_eq!(round_up(0, 1024), Some(0));
        assert_eq!(round_up(u64::MAX - 1, 1024), None);
    }

    #[test]
    fn regions_order_by_start() {
        let a = Region::new(0, 4095);
        let b = Region::new(0, 8191);
        let c = Region::new(8192, 8192);
        assert_eq!(a, b);
        assert!(b < c);
        assert_eq!(a.len(), 4096);
        assert!(c.contains(8192));
        assert!(!a.contains(4096));
        assert_eq!(b.to_string(), "[0, 8191]");
        assert_eq!(b.bounds(), (0, 8191));
    }
}
