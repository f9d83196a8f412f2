//! # Page Tables and Virtual Address Indexing

use crate::PageEntryBits;
use core::fmt;
use kernel_memory_addresses::{PAGE_SHIFT, VirtualAddress};

/// One 4 KiB table of 512 entries. The layout is the same on all four levels.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTable {
    entries: [PageEntryBits; PageTable::ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    pub const ENTRIES: usize = 512;

    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntryBits::new(); Self::ENTRIES],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: TableIndex) -> PageEntryBits {
        self.entries[index.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, index: TableIndex, entry: PageEntryBits) {
        self.entries[index.as_usize()] = entry;
    }

    /// Present entries together with their index.
    pub fn present_entries(&self) -> impl Iterator<Item = (TableIndex, PageEntryBits)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.present())
            .map(|(i, e)| (TableIndex::from_masked(i as u64), *e))
    }

    /// Byte copy of `other` into this table.
    #[inline]
    pub const fn copy_from(&mut self, other: &Self) {
        self.entries = other.entries;
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.present_entries().map(|(i, e)| (i.as_usize(), e)))
            .finish()
    }
}

/// An index `0..512` into a [`PageTable`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Keeps only the low nine bits of `value`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_masked(value: u64) -> Self {
        Self((value & 0x1ff) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }
}

/// A 48-bit virtual address split into its four table indices and page offset.
///
/// ```text
/// | 47..39 | 38..30 | 29..21 | 20..12 | 11..0  |
/// |  PML4  |  PDPT  |   PD   |   PT   | offset |
/// ```
///
/// ```rust
/// # use kernel_memory_addresses::VirtualAddress;
/// # use kernel_vmem::PageTableIndices;
/// let i = PageTableIndices::of(VirtualAddress::new(0xffff_ffff_8010_2abc));
/// assert_eq!(i.pml4.as_usize(), 511);
/// assert_eq!(i.pdpt.as_usize(), 510);
/// assert_eq!(i.pd.as_usize(), 0);
/// assert_eq!(i.pt.as_usize(), 0x102);
/// assert_eq!(i.offset, 0xabc);
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageTableIndices {
    pub pml4: TableIndex,
    pub pdpt: TableIndex,
    pub pd: TableIndex,
    pub pt: TableIndex,
    pub offset: u16,
}

impl PageTableIndices {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress) -> Self {
        let offset = va.page_offset() as u16;
        let mut v = va.as_u64() >> PAGE_SHIFT;
        let pt = TableIndex::from_masked(v);
        v >>= 9;
        let pd = TableIndex::from_masked(v);
        v >>= 9;
        let pdpt = TableIndex::from_masked(v);
        v >>= 9;
        let pml4 = TableIndex::from_masked(v);
        Self {
            pml4,
            pdpt,
            pd,
            pt,
            offset,
        }
    }

    /// Reassembles the canonical virtual address these indices describe.
    #[must_use]
    pub const fn virtual_address(&self) -> VirtualAddress {
        VirtualAddress::canonical(
            (self.pml4.as_u64() << 39)
                | (self.pdpt.as_u64() << 30)
                | (self.pd.as_u64() << 21)
                | (self.pt.as_u64() << 12)
                | self.offset as u64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_round_trip_through_canonical_address() {
        for raw in [0, 0x1000, 0x0000_7fff_ffff_ffff, 0xffff_8000_0000_0000, 0xffff_ffff_ff00_0008] {
            let va = VirtualAddress::new(raw);
            assert_eq!(PageTableIndices::of(va).virtual_address(), va);
        }
    }

    #[test]
    fn low_identity_addresses_use_first_slots() {
        let i = PageTableIndices::of(VirtualAddress::new(0x3f_f000));
        assert_eq!(i.pml4.as_usize(), 0);
        assert_eq!(i.pdpt.as_usize(), 0);
        assert_eq!(i.pd.as_usize(), 1);
        assert_eq!(i.pt.as_usize(), 511);
    }

    #[test]
    fn present_entries_skips_empty_slots() {
        let mut t = PageTable::zeroed();
        t.set(TableIndex::from_masked(7), PageEntryBits::kernel_rw());
        t.set(TableIndex::from_masked(9), PageEntryBits::new().with_read_write(true));
        let present: Vec<_> = t.present_entries().map(|(i, _)| i.as_usize()).collect();
        assert_eq!(present, [7]);
    }
}
