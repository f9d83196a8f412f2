//! # Physical Memory Manager
//!
//! Page-granular allocator over a [`Bitmap`] in which bit *i* set means
//! "physical page *i* is in use".
//!
//! ## Bring-up
//!
//! The final bitmap needs `total_pages / 8` bytes of physical memory, but the
//! manager has to exist before it can hand those out. [`PhysicalMemoryManager::init`]
//! therefore runs twice over the firmware map:
//!
//! 1. On a small caller-provided buffer covering the first
//!    [`BOOTSTRAP_BITMAP_CEILING`] bytes: lock everything, free conventional
//!    memory, lock the kernel and the future bitmap's pages, then identity-map
//!    that range on the active tables. Page tables for the map come from this
//!    bootstrap state.
//! 2. On a buffer placed at the start of the largest conventional region below
//!    the ceiling, sized for all of RAM: the same lock/free/lock sequence, plus
//!    every page the bootstrap state had locked (so the identity map's tables
//!    stay reserved).
//!
//! ## Accounting
//!
//! `free_pages + used_pages == total_pages` holds after every operation. Only
//! pages with an index below `total_pages` are counted, and counters only move
//! when a bit actually flips, so locking a locked page or freeing a free page
//! is a no-op.

use crate::bitmap::Bitmap;
use kernel_info::kernel_image::KernelImage;
use kernel_info::memory::{BOOTSTRAP_BITMAP_CEILING, BOOTSTRAP_BITMAP_PAGES, kib, mib};
use kernel_info::memory_map::MemoryMap;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_vmem::{AddressSpace, AddressSpaceError, PageEntryBits, PageTableSource, PhysMapper};
use log::{debug, info, trace, warn};
use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum PmmError {
    #[error("no conventional memory region below {ceiling:#x} to hold the page bitmap")]
    NoUsableMemory { ceiling: u64 },
    #[error("page bitmap needs {needed} pages, largest usable region has {available}")]
    BitmapDoesNotFit { needed: u64, available: u64 },
    #[error("physical memory exhausted")]
    OutOfMemory,
    #[error("cannot allocate a run of zero pages")]
    ZeroPages,
    #[error("{requested} pages requested, only {free} free")]
    InsufficientFreePages { requested: u64, free: u64 },
    #[error("no run of {requested} contiguous free pages")]
    NoContiguousRun { requested: u64 },
    #[error("identity mapping low memory failed: {0}")]
    IdentityMap(#[from] AddressSpaceError),
}

impl PmmError {
    /// Whether the kernel can continue after this error.
    ///
    /// Contiguous-run failures are routine and left to the caller; everything
    /// that leaves the allocator itself unusable is fatal.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::NoUsableMemory { .. } | Self::BitmapDoesNotFit { .. } | Self::OutOfMemory => true,
            Self::ZeroPages | Self::InsufficientFreePages { .. } | Self::NoContiguousRun { .. } => {
                false
            }
            Self::IdentityMap(e) => e.is_fatal(),
        }
    }
}

/// The region chosen to hold the final bitmap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct BitmapSegment {
    base: PhysicalAddress,
    page_count: u64,
}

pub struct PhysicalMemoryManager<'b> {
    bitmap: Bitmap<'b>,
    total_pages: u64,
    free_pages: u64,
    used_pages: u64,
    /// Longest free run seen at setup. A hint; runs are re-validated on allocation.
    max_free_pages_in_a_row: u64,
    /// Every free page has an index `>= first_free_page`.
    first_free_page: u64,
}

impl<'b> PhysicalMemoryManager<'b> {
    /// A manager where all `total_pages` count as free until locked.
    fn with_bitmap(bitmap: Bitmap<'b>, total_pages: u64) -> Self {
        Self {
            bitmap,
            total_pages,
            free_pages: total_pages,
            used_pages: 0,
            max_free_pages_in_a_row: 0,
            first_free_page: 0,
        }
    }

    /// Adopts an already populated bitmap and derives all counters from it.
    ///
    /// Pages beyond the bitmap's reach count as used.
    #[must_use]
    pub fn from_bitmap(bitmap: Bitmap<'b>, total_pages: u64) -> Self {
        let mut pmm = Self::with_bitmap(bitmap, total_pages);
        let limit = pmm.scan_limit();
        let free = (0..limit).filter(|&i| !pmm.bitmap.get(i)).count() as u64;
        pmm.free_pages = free;
        pmm.used_pages = total_pages - free;
        pmm.max_free_pages_in_a_row = pmm.longest_free_run();
        pmm.first_free_page = (0..limit).find(|&i| !pmm.bitmap.get(i)).unwrap_or(limit);
        pmm
    }

    /// Builds the manager from the firmware memory map; see the module docs.
    ///
    /// `bootstrap` must hold at least [`BOOTSTRAP_BITMAP_PAGES`] bits.
    /// `active_root` is the PML4 currently loaded in CR3; low memory is
    /// identity-mapped into it (addresses already identity-mapped, e.g. by
    /// firmware large pages, are left alone).
    ///
    /// # Errors
    /// All errors returned here are fatal.
    pub fn init<M: PhysMapper>(
        memory_map: &MemoryMap<'_>,
        kernel: &KernelImage,
        bootstrap: &'b mut [u8],
        mapper: &'b M,
        active_root: PhysicalPage,
    ) -> Result<Self, PmmError> {
        let total_pages = memory_map.total_pages();
        let segment = Self::bitmap_segment(memory_map).ok_or(PmmError::NoUsableMemory {
            ceiling: BOOTSTRAP_BITMAP_CEILING,
        })?;

        let bitmap_len = total_pages / 8 + 1;
        let bitmap_pages = bitmap_len / PAGE_SIZE + 1;
        if bitmap_pages > segment.page_count {
            return Err(PmmError::BitmapDoesNotFit {
                needed: bitmap_pages,
                available: segment.page_count,
            });
        }
        debug!(
            "{total_pages} physical pages; page bitmap goes to {} ({} pages free there)",
            segment.base, segment.page_count
        );

        // Phase 1: bootstrap bitmap over the first BOOTSTRAP_BITMAP_CEILING bytes.
        debug_assert!(bootstrap.len() as u64 * 8 >= BOOTSTRAP_BITMAP_PAGES);
        let mut boot = Self::with_bitmap(Bitmap::new(bootstrap), total_pages);
        boot.lock_pages(PhysicalAddress::zero(), BOOTSTRAP_BITMAP_PAGES);
        boot.free_conventional(memory_map);
        boot.lock_kernel(kernel);
        boot.lock_pages(segment.base, bitmap_pages);
        boot.identity_map_low_memory(mapper, active_root)?;

        // Phase 2: bitmap covering all of RAM.
        #[allow(clippy::cast_possible_truncation)]
        // SAFETY: the segment is conventional memory, identity-mapped above and locked
        // in the bootstrap state, so nothing else lives there.
        let buffer = unsafe {
            core::slice::from_raw_parts_mut(
                mapper.phys_to_ptr::<u8>(segment.base),
                bitmap_len as usize,
            )
        };
        let mut pmm = Self::with_bitmap(Bitmap::new(buffer), total_pages);
        pmm.lock_pages(PhysicalAddress::zero(), total_pages + 1);
        pmm.max_free_pages_in_a_row = pmm.free_conventional(memory_map);
        pmm.lock_pages(segment.base, bitmap_pages);
        pmm.lock_kernel(kernel);

        let carried = total_pages.min(boot.bitmap.bit_count());
        for index in (0..carried).filter(|&i| boot.bitmap.get(i)) {
            pmm.lock_index(index);
        }
        pmm.first_free_page = 0;

        info!(
            "physical memory initialized: {} pages, {} free, {} used",
            pmm.total_pages, pmm.free_pages, pmm.used_pages
        );
        Ok(pmm)
    }

    /// Largest conventional region ending at or below the bootstrap ceiling.
    fn bitmap_segment(memory_map: &MemoryMap<'_>) -> Option<BitmapSegment> {
        memory_map
            .iter()
            .filter(|d| d.is_conventional() && d.page_count > 0)
            .filter(|d| d.physical_end().as_u64() <= BOOTSTRAP_BITMAP_CEILING)
            .fold(None, |best: Option<BitmapSegment>, d| match best {
                Some(b) if b.page_count >= d.page_count => Some(b),
                _ => Some(BitmapSegment {
                    base: d.physical_start,
                    page_count: d.page_count,
                }),
            })
    }

    /// Frees every conventional descriptor, returning the largest one's page count.
    fn free_conventional(&mut self, memory_map: &MemoryMap<'_>) -> u64 {
        memory_map
            .iter()
            .filter(|d| d.is_conventional())
            .map(|d| {
                self.free_pages(d.physical_start, d.page_count);
                d.page_count
            })
            .max()
            .unwrap_or(0)
    }

    fn lock_kernel(&mut self, kernel: &KernelImage) {
        self.lock_pages(kernel.physical_start, kernel.page_count());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn identity_map_low_memory<M: PhysMapper>(
        &mut self,
        mapper: &M,
        active_root: PhysicalPage,
    ) -> Result<(), PmmError> {
        let aspace = AddressSpace::from_root(mapper, active_root);
        let flags = PageEntryBits::kernel_rw().with_global(true);
        let end = self.total_ram().min(BOOTSTRAP_BITMAP_CEILING);

        let mut skipped = 0u64;
        for pa in (0..end).step_by(PAGE_SIZE as usize).map(PhysicalAddress::new) {
            let va = VirtualAddress::new(pa.as_u64());
            if aspace.translate(va) == Some(pa) {
                skipped += 1;
                continue;
            }
            aspace.map(self, va, pa, flags)?;
        }

        debug!("identity-mapped {end:#x} bytes ({skipped} pages were already mapped)");
        Ok(())
    }

    #[inline]
    fn scan_limit(&self) -> u64 {
        self.total_pages.min(self.bitmap.bit_count())
    }

    #[inline]
    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }

    #[inline]
    #[must_use]
    pub const fn free_pages_count(&self) -> u64 {
        self.free_pages
    }

    #[inline]
    #[must_use]
    pub const fn used_pages_count(&self) -> u64 {
        self.used_pages
    }

    #[inline]
    #[must_use]
    pub const fn max_free_pages_in_a_row(&self) -> u64 {
        self.max_free_pages_in_a_row
    }

    #[inline]
    #[must_use]
    pub const fn first_free_page(&self) -> u64 {
        self.first_free_page
    }

    #[must_use]
    pub const fn total_ram(&self) -> u64 {
        self.total_pages * PAGE_SIZE
    }

    #[must_use]
    pub const fn free_ram(&self) -> u64 {
        self.free_pages * PAGE_SIZE
    }

    #[must_use]
    pub const fn used_ram(&self) -> u64 {
        self.used_pages * PAGE_SIZE
    }

    #[must_use]
    pub const fn bitmap(&self) -> &Bitmap<'b> {
        &self.bitmap
    }

    /// Whether the page containing `pa` is in use.
    #[must_use]
    pub fn is_locked(&self, pa: PhysicalAddress) -> bool {
        self.bitmap.get(pa.page_index())
    }

    fn lock_index(&mut self, index: u64) {
        if self.bitmap.get(index) {
            return;
        }
        if self.bitmap.set(index, true) && index < self.total_pages {
            self.free_pages -= 1;
            self.used_pages += 1;
        }
    }

    fn free_index(&mut self, index: u64) {
        if !self.bitmap.get(index) {
            return;
        }
        if self.bitmap.set(index, false) && index < self.total_pages {
            self.used_pages -= 1;
            self.free_pages += 1;
        }
        if index < self.first_free_page {
            self.first_free_page = index;
        }
    }

    /// Marks the page containing `pa` as used.
    pub fn lock_page(&mut self, pa: PhysicalAddress) {
        self.lock_index(pa.page_index());
    }

    pub fn lock_pages(&mut self, pa: PhysicalAddress, count: u64) {
        let first = pa.page_index();
        for index in first..first.saturating_add(count) {
            self.lock_index(index);
        }
    }

    /// Marks the page containing `pa` as free.
    pub fn free_page(&mut self, pa: PhysicalAddress) {
        self.free_index(pa.page_index());
    }

    pub fn free_pages(&mut self, pa: PhysicalAddress, count: u64) {
        let first = pa.page_index();
        for index in first..first.saturating_add(count) {
            self.free_index(index);
        }
    }

    /// Hands out the first free page at or after the cursor.
    ///
    /// # Errors
    /// [`PmmError::OutOfMemory`] (fatal) if no page is free.
    pub fn request_page(&mut self) -> Result<PhysicalPage, PmmError> {
        let limit = self.scan_limit();
        while self.first_free_page < limit {
            let index = self.first_free_page;
            self.first_free_page += 1;
            if !self.bitmap.get(index) {
                self.lock_index(index);
                trace!("request_page: {:#x}", index * PAGE_SIZE);
                return Ok(PhysicalPage::from_index(index));
            }
        }

        warn!("request_page: no free page left");
        Err(PmmError::OutOfMemory)
    }

    /// Hands out `count` physically contiguous pages.
    ///
    /// # Errors
    /// - [`PmmError::ZeroPages`] for `count == 0`.
    /// - [`PmmError::OutOfMemory`] (fatal) for `count == 1` when nothing is free.
    /// - [`PmmError::InsufficientFreePages`] / [`PmmError::NoContiguousRun`] when no
    ///   suitable run exists. Both are recoverable.
    pub fn request_pages(&mut self, count: u64) -> Result<PhysicalPage, PmmError> {
        match count {
            0 => return Err(PmmError::ZeroPages),
            1 => return self.request_page(),
            _ => {}
        }
        if count > self.free_pages {
            return Err(PmmError::InsufficientFreePages {
                requested: count,
                free: self.free_pages,
            });
        }
        if count > self.max_free_pages_in_a_row {
            return Err(PmmError::NoContiguousRun { requested: count });
        }

        let limit = self.scan_limit();
        let mut index = self.first_free_page;
        while index < limit {
            if self.bitmap.get(index) {
                index += 1;
                continue;
            }

            let start = index;
            while index < limit && !self.bitmap.get(index) {
                index += 1;
                if index - start == count {
                    let base = PhysicalAddress::from_page_index(start);
                    self.lock_pages(base, count);
                    if start == self.first_free_page {
                        self.first_free_page = start + count;
                    }
                    trace!("request_pages({count}): {base}");
                    return Ok(PhysicalPage::containing_address(base));
                }
            }
        }

        debug!("request_pages({count}): no run long enough");
        Err(PmmError::NoContiguousRun { requested: count })
    }

    /// Length of the longest run of free pages, by a full bitmap scan.
    #[must_use]
    pub fn longest_free_run(&self) -> u64 {
        let (longest, _) = (0..self.scan_limit()).fold((0, 0), |(longest, run), i| {
            let run = if self.bitmap.get(i) { 0 } else { run + 1 };
            (longest.max(run), run)
        });
        longest
    }

    /// Logs total/free/used memory in KiB up to 64 MiB of RAM and in MiB above.
    pub fn log_statistics(&self) {
        if self.total_ram() > mib(64) {
            info!(
                "memory: total {} MiB, free {} MiB, used {} MiB",
                self.total_ram() / mib(1),
                self.free_ram() / mib(1),
                self.used_ram() / mib(1)
            );
        } else {
            info!(
                "memory: total {} KiB, free {} KiB, used {} KiB",
                self.total_ram() / kib(1),
                self.free_ram() / kib(1),
                self.used_ram() / kib(1)
            );
        }
    }
}

impl PageTableSource for PhysicalMemoryManager<'_> {
    fn allocate_page(&mut self) -> Option<PhysicalPage> {
        self.request_page().ok()
    }
}

impl core::fmt::Debug for PhysicalMemoryManager<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysicalMemoryManager")
            .field("total_pages", &self.total_pages)
            .field("free_pages", &self.free_pages)
            .field("used_pages", &self.used_pages)
            .field("max_free_pages_in_a_row", &self.max_free_pages_in_a_row)
            .field("first_free_page", &self.first_free_page)
            .finish_non_exhaustive()
    }
}
