//! # Address Space (x86-64, PML4-rooted)
//!
//! Walks and mutates one four-level page table tree.
//!
//! - [`AddressSpace::map`] installs a 4 KiB leaf, creating missing tables on the way.
//! - [`AddressSpace::unmap`] clears the leaf's present bit.
//! - [`AddressSpace::translate`] resolves a virtual address (4 KiB, 2 MiB and 1 GiB leaves).
//! - [`AddressSpace::deep_clone`] copies the whole tree into freshly allocated tables.
//!
//! No TLB maintenance happens here; whoever changes the *active* tree is
//! responsible for `invlpg` or a CR3 reload.
//!
//! ## Table ownership
//!
//! Tables come from a [`PageTableSource`] one page at a time, when a walk first
//! needs them. Nothing is ever handed back: `unmap` leaves the (now possibly
//! empty) tables and the data page alone, and a failed `deep_clone` keeps
//! whatever tables it had already allocated.

use crate::page_table::{PageTable, PageTableIndices, TableIndex};
use crate::{PageEntryBits, PageTableSource, PhysMapper};
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use log::{trace, warn};
use thiserror::Error;

/// The four levels of the paging tree, top down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl TableLevel {
    /// The level the entries of this level link to.
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        })
    }
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum AddressSpaceError {
    #[error("no physical page left for a new {level} table")]
    TableAllocation { level: TableLevel },
    #[error("{va} is covered by a large page where a {level} table was expected")]
    LargePageInPath { va: VirtualAddress, level: TableLevel },
}

impl AddressSpaceError {
    /// Running out of pages for page tables leaves the kernel unable to map
    /// anything; there is no degraded mode for that.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::TableAllocation { .. })
    }
}

/// Handle to a single page table tree.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wraps an existing PML4.
    #[inline]
    #[must_use]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage) -> Self {
        Self { root, mapper }
    }

    /// Creates an empty tree with a freshly allocated, zeroed PML4.
    ///
    /// # Errors
    /// [`AddressSpaceError::TableAllocation`] if `source` is exhausted.
    pub fn allocate<S: PageTableSource + ?Sized>(
        mapper: &'m M,
        source: &mut S,
    ) -> Result<Self, AddressSpaceError> {
        let root = allocate_table(mapper, source, TableLevel::Pml4)?;
        Ok(Self { root, mapper })
    }

    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> PhysicalPage {
        self.root
    }

    #[inline]
    fn table(&self, page: PhysicalPage) -> &'m mut PageTable {
        // SAFETY: every page reaching this point is either the root or was
        // linked in as a table by this module.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    /// Maps the 4 KiB page containing `va` to the page containing `pa`.
    ///
    /// The leaf receives `flags` exactly as given (address bits in `flags` are
    /// ignored), so callers pass `present` themselves. Missing intermediate
    /// tables are allocated from `source`, zeroed and linked as present and
    /// writable, plus user-accessible when the leaf is. Existing intermediate
    /// entries only ever gain permissions.
    ///
    /// Mapping the same address twice with the same arguments yields the same
    /// leaf and allocates nothing the second time.
    ///
    /// # Errors
    /// - [`AddressSpaceError::TableAllocation`] when `source` runs dry (fatal).
    /// - [`AddressSpaceError::LargePageInPath`] when a 2 MiB / 1 GiB leaf already covers `va`.
    pub fn map<S: PageTableSource + ?Sized>(
        &self,
        source: &mut S,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), AddressSpaceError> {
        let idx = PageTableIndices::of(va);
        let link = PageEntryBits::kernel_rw().with_user_accessible(flags.user_accessible());

        let pdpt = self.next_or_create(self.root, idx.pml4, link, source, va, TableLevel::Pdpt)?;
        let pd = self.next_or_create(pdpt, idx.pdpt, link, source, va, TableLevel::Pd)?;
        let pt = self.next_or_create(pd, idx.pd, link, source, va, TableLevel::Pt)?;

        self.table(pt)
            .set(idx.pt, flags.flags().with_physical_address(pa.align_down()));
        Ok(())
    }

    fn next_or_create<S: PageTableSource + ?Sized>(
        &self,
        table: PhysicalPage,
        index: TableIndex,
        link: PageEntryBits,
        source: &mut S,
        va: VirtualAddress,
        child: TableLevel,
    ) -> Result<PhysicalPage, AddressSpaceError> {
        let parent = self.table(table);
        let entry = parent.get(index);

        if entry.present() {
            if entry.large_page() {
                return Err(AddressSpaceError::LargePageInPath { va, level: child });
            }
            let widened = entry
                .with_read_write(entry.read_write() || link.read_write())
                .with_user_accessible(entry.user_accessible() || link.user_accessible());
            if widened != entry {
                parent.set(index, widened);
            }
            return Ok(entry.physical_address().page());
        }

        let page = allocate_table(self.mapper, source, child)?;
        parent.set(index, link.with_physical_address(page.base()));
        trace!("new {child} table at {page} for {va}");
        Ok(page)
    }

    /// The last-level table and slot responsible for `va`, if every table on
    /// the way exists and no large page covers it.
    fn leaf_slot(&self, va: VirtualAddress) -> Option<(&'m mut PageTable, TableIndex)> {
        let idx = PageTableIndices::of(va);
        let pdpt = self.table(self.root).get(idx.pml4).next_table()?;
        let pd = self.table(pdpt).get(idx.pdpt).next_table()?;
        let pt = self.table(pd).get(idx.pd).next_table()?;
        Some((self.table(pt), idx.pt))
    }

    /// The raw 4 KiB leaf entry for `va`, present or not.
    #[must_use]
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        self.leaf_slot(va).map(|(pt, i)| pt.get(i))
    }

    /// Clears the present bit of the 4 KiB leaf for `va`.
    ///
    /// The physical page is not returned to anyone, the stored address stays in
    /// the entry and emptied tables are kept. Returns `true` if a present leaf
    /// was cleared, i.e. if a stale TLB entry may exist. Unmapping an address
    /// whose tables were never created does nothing.
    #[must_use = "a cleared present leaf may still be cached in the TLB"]
    pub fn unmap(&self, va: VirtualAddress) -> bool {
        let Some((pt, i)) = self.leaf_slot(va) else {
            warn!("unmap of {va}: no page table covers it");
            return false;
        };

        let entry = pt.get(i);
        pt.set(i, entry.with_present(false));
        entry.present()
    }

    /// Resolves `va`, honouring 1 GiB and 2 MiB leaves.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        const GIB_MASK: u64 = (1 << 30) - 1;
        const MIB2_MASK: u64 = (1 << 21) - 1;

        let idx = PageTableIndices::of(va);
        let pdpt = self.table(self.root).get(idx.pml4).next_table()?;

        let e3 = self.table(pdpt).get(idx.pdpt);
        if e3.present() && e3.large_page() {
            let base = e3.physical_address().as_u64() & !GIB_MASK;
            return Some(PhysicalAddress::new(base | (va.as_u64() & GIB_MASK)));
        }
        let pd = e3.next_table()?;

        let e2 = self.table(pd).get(idx.pd);
        if e2.present() && e2.large_page() {
            let base = e2.physical_address().as_u64() & !MIB2_MASK;
            return Some(PhysicalAddress::new(base | (va.as_u64() & MIB2_MASK)));
        }
        let pt = e2.next_table()?;

        let e1 = self.table(pt).get(idx.pt);
        e1.present()
            .then_some(e1.physical_address() + u64::from(idx.offset))
    }

    /// Copies the whole tree into newly allocated tables.
    ///
    /// Every PML4, PDPT, PD and PT reachable through present links is
    /// duplicated; leaf entries (including 2 MiB / 1 GiB ones) are copied
    /// verbatim, so both trees translate identically but share no table.
    ///
    /// On allocation failure the tables cloned so far are not released.
    ///
    /// # Errors
    /// [`AddressSpaceError::TableAllocation`] if `source` runs dry.
    pub fn deep_clone<S: PageTableSource + ?Sized>(
        &self,
        source: &mut S,
    ) -> Result<Self, AddressSpaceError> {
        let root = self.clone_table(self.root, TableLevel::Pml4, source)?;
        Ok(Self {
            root,
            mapper: self.mapper,
        })
    }

    fn clone_table<S: PageTableSource + ?Sized>(
        &self,
        original: PhysicalPage,
        level: TableLevel,
        source: &mut S,
    ) -> Result<PhysicalPage, AddressSpaceError> {
        let copy = allocate_table(self.mapper, source, level)?;
        let from = self.table(original);
        let to = self.table(copy);
        to.copy_from(from);

        if let Some(child) = level.child() {
            for (i, entry) in from.present_entries() {
                let Some(next) = entry.next_table() else {
                    continue;
                };
                let cloned = self.clone_table(next, child, source)?;
                to.set(i, entry.with_physical_address(cloned.base()));
            }
        }

        Ok(copy)
    }
}

fn allocate_table<M: PhysMapper, S: PageTableSource + ?Sized>(
    mapper: &M,
    source: &mut S,
    level: TableLevel,
) -> Result<PhysicalPage, AddressSpaceError> {
    let page = source
        .allocate_page()
        .ok_or(AddressSpaceError::TableAllocation { level })?;
    // SAFETY: the source hands out pages nobody else uses.
    unsafe { mapper.zero_page(page) };
    Ok(page)
}
