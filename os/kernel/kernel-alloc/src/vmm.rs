//! # Virtual Memory Manager
//!
//! Thin policy layer over [`AddressSpace`]: it knows which page map is
//! active, keeps the TLB coherent for it and builds the kernel's own tables
//! at boot.
//!
//! The hardware side (CR3 and `invlpg`) sits behind [`PagingControl`] so the
//! bookkeeping can be exercised on the host.
//!
//! ```ignore
//! let mut vmm = Vmm::new(&IdentityPhysMapper, unsafe { Cr3Register::new() });
//! let root = unsafe { vmm.init_virtual_with_new_root(&mut pmm, &kernel) }?;
//! vmm.map_active(&mut pmm, va, pa, PageEntryBits::kernel_rw())?;
//! ```

use crate::pmm::PhysicalMemoryManager;
use kernel_info::kernel_image::KernelImage;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};
use kernel_vmem::{AddressSpace, AddressSpaceError, PageEntryBits, PageTableSource, PhysMapper};
use log::{debug, info};
use thiserror::Error;

/// Access to the paging root register and the TLB of the executing core.
pub trait PagingControl {
    /// The PML4 the CPU currently walks.
    fn read_root(&self) -> PhysicalPage;

    /// Loads `root` as the active PML4. This flushes all non-global translations.
    ///
    /// # Safety
    /// `root` must be a complete page map that keeps the executing code, its
    /// stack and all live data mapped at their current addresses.
    unsafe fn write_root(&mut self, root: PhysicalPage);

    /// Drops any cached translation of `page`.
    fn invalidate_page(&mut self, page: VirtualPage);
}

/// The real thing: CR3 and `invlpg`.
#[cfg(feature = "asm")]
#[derive(Debug)]
pub struct Cr3Register {
    _private: (),
}

#[cfg(feature = "asm")]
impl Cr3Register {
    /// # Safety
    /// Every method issues privileged instructions; the caller must be running
    /// in Ring 0 with paging enabled.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(feature = "asm")]
impl PagingControl for Cr3Register {
    fn read_root(&self) -> PhysicalPage {
        use kernel_registers::LoadRegisterUnsafe;
        // SAFETY: Ring 0 is guaranteed by `Cr3Register::new`.
        unsafe { kernel_registers::cr3::Cr3::load_unsafe() }.root()
    }

    unsafe fn write_root(&mut self, root: PhysicalPage) {
        use kernel_registers::StoreRegisterUnsafe;
        unsafe { kernel_registers::cr3::Cr3::from_root(root).store_unsafe() };
    }

    fn invalidate_page(&mut self, page: VirtualPage) {
        // SAFETY: Ring 0 is guaranteed by `Cr3Register::new`.
        unsafe { kernel_registers::tlb::invalidate_page(page) };
    }
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum VmmError {
    #[error("mapping {va} failed: {source}")]
    Map {
        va: VirtualAddress,
        source: AddressSpaceError,
    },
    #[error("cloning the active page map failed: {0}")]
    Clone(#[source] AddressSpaceError),
    #[error("no physical page left for a new PML4")]
    RootAllocation,
}

impl VmmError {
    /// A clone that could not complete is reported to the caller, who may
    /// retry later; failing to build or extend the kernel map is not survivable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Map { source, .. } => source.is_fatal(),
            Self::Clone(_) => false,
            Self::RootAllocation => true,
        }
    }
}

pub struct Vmm<'m, M: PhysMapper, R: PagingControl> {
    mapper: &'m M,
    paging: R,
    /// Cached value of the root register; read lazily on first use.
    active: Option<PhysicalPage>,
}

impl<'m, M: PhysMapper, R: PagingControl> Vmm<'m, M, R> {
    #[must_use]
    pub const fn new(mapper: &'m M, paging: R) -> Self {
        Self {
            mapper,
            paging,
            active: None,
        }
    }

    /// The PML4 currently in use.
    pub fn active_page_map(&mut self) -> PhysicalPage {
        *self.active.get_or_insert_with(|| self.paging.read_root())
    }

    #[inline]
    #[must_use]
    pub const fn paging(&self) -> &R {
        &self.paging
    }

    /// A handle to the tree rooted at `root`.
    #[inline]
    #[must_use]
    pub const fn address_space(&self, root: PhysicalPage) -> AddressSpace<'m, M> {
        AddressSpace::from_root(self.mapper, root)
    }

    /// Makes `root` the active page map.
    ///
    /// # Safety
    /// See [`PagingControl::write_root`].
    pub unsafe fn flush_page_map(&mut self, root: PhysicalPage) {
        debug!("loading page map {root}");
        unsafe { self.paging.write_root(root) };
        self.active = Some(root);
    }

    fn is_active(&self, root: PhysicalPage) -> bool {
        self.active == Some(root)
    }

    /// Maps the page at `va` to the page at `pa` in the tree at `root`.
    ///
    /// If `root` is the active page map the old translation of `va` is
    /// invalidated.
    ///
    /// # Errors
    /// [`VmmError::Map`]; fatal if a page table could not be allocated.
    pub fn map<S: PageTableSource + ?Sized>(
        &mut self,
        source: &mut S,
        root: PhysicalPage,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        self.address_space(root)
            .map(source, va, pa, flags)
            .map_err(|source| VmmError::Map { va, source })?;
        if self.is_active(root) {
            self.paging.invalidate_page(va.page());
        }
        Ok(())
    }

    /// Clears the present bit of the leaf for `va` in the tree at `root`.
    ///
    /// Returns whether a present mapping was removed.
    pub fn unmap(&mut self, root: PhysicalPage, va: VirtualAddress) -> bool {
        let removed = self.address_space(root).unmap(va);
        if removed && self.is_active(root) {
            self.paging.invalidate_page(va.page());
        }
        removed
    }

    /// [`map`](Self::map) on the active page map.
    ///
    /// # Errors
    /// See [`map`](Self::map).
    pub fn map_active<S: PageTableSource + ?Sized>(
        &mut self,
        source: &mut S,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        let root = self.active_page_map();
        self.map(source, root, va, pa, flags)
    }

    /// [`unmap`](Self::unmap) on the active page map.
    pub fn unmap_active(&mut self, va: VirtualAddress) -> bool {
        let root = self.active_page_map();
        self.unmap(root, va)
    }

    /// Resolves `va` through the active page map.
    pub fn translate(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let root = self.active_page_map();
        self.address_space(root).translate(va)
    }

    /// Deep-copies the active page map and returns the copy's root.
    ///
    /// The copy is not activated.
    ///
    /// # Errors
    /// [`VmmError::Clone`] if the tables ran out half way. The partial copy is
    /// not released.
    pub fn clone_active_page_map<S: PageTableSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<PhysicalPage, VmmError> {
        let root = self.active_page_map();
        let copy = self
            .address_space(root)
            .deep_clone(source)
            .map_err(VmmError::Clone)?;
        debug!("cloned page map {root} into {}", copy.root_page());
        Ok(copy.root_page())
    }

    /// Builds the kernel page map in the (empty) tree at `root` and activates it.
    ///
    /// - all of RAM reported by `pmm` is identity-mapped read-write,
    /// - the kernel image is mapped at its higher-half address as global,
    /// - virtual page 0 is left unmapped so null dereferences fault.
    ///
    /// Tables come from `pmm`.
    ///
    /// # Errors
    /// [`VmmError::Map`] if a table could not be allocated.
    ///
    /// # Safety
    /// The executing code must be covered by the new map, either through the
    /// identity map or the kernel image mapping.
    pub unsafe fn init_virtual(
        &mut self,
        root: PhysicalPage,
        pmm: &mut PhysicalMemoryManager<'_>,
        kernel: &KernelImage,
    ) -> Result<(), VmmError> {
        let total = pmm.total_ram();
        info!("identity-mapping {} KiB of RAM into {root}", total / 1024);

        let identity = PageEntryBits::kernel_rw();
        let mut address = 0;
        while address < total {
            self.map(
                pmm,
                root,
                VirtualAddress::new(address),
                PhysicalAddress::new(address),
                identity,
            )?;
            address += PAGE_SIZE;
        }

        let image = PageEntryBits::kernel_rw().with_global(true);
        let first = kernel.physical_start.align_down();
        for i in 0..kernel.page_count() {
            let pa = first + i * PAGE_SIZE;
            self.map(pmm, root, kernel.virtual_for(pa), pa, image)?;
        }
        info!(
            "kernel image {}..{} mapped at {}",
            kernel.physical_start,
            kernel.physical_end(),
            kernel.virtual_start
        );

        self.unmap(root, VirtualAddress::zero());

        unsafe { self.flush_page_map(root) };
        Ok(())
    }

    /// [`init_virtual`](Self::init_virtual) on a freshly allocated, zeroed PML4.
    ///
    /// # Errors
    /// [`VmmError::RootAllocation`] if `pmm` is exhausted, otherwise as
    /// [`init_virtual`](Self::init_virtual).
    ///
    /// # Safety
    /// See [`init_virtual`](Self::init_virtual).
    pub unsafe fn init_virtual_with_new_root(
        &mut self,
        pmm: &mut PhysicalMemoryManager<'_>,
        kernel: &KernelImage,
    ) -> Result<PhysicalPage, VmmError> {
        let root = AddressSpace::allocate(self.mapper, pmm)
            .map_err(|_| VmmError::RootAllocation)?
            .root_page();
        unsafe { self.init_virtual(root, pmm, kernel) }?;
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeRegister {
        invalidated: Vec<VirtualPage>,
    }

    impl PagingControl for FakeRegister {
        fn read_root(&self) -> PhysicalPage {
            PhysicalPage::from_index(3)
        }

        unsafe fn write_root(&mut self, _root: PhysicalPage) {}

        fn invalidate_page(&mut self, page: VirtualPage) {
            self.invalidated.push(page);
        }
    }

    struct NoMemory;

    impl PhysMapper for NoMemory {
        fn phys_to_ptr<T>(&self, _pa: PhysicalAddress) -> *mut T {
            core::ptr::null_mut()
        }
    }

    #[test]
    fn active_root_is_read_once_and_then_cached() {
        let mut vmm = Vmm::new(&NoMemory, FakeRegister::default());
        assert_eq!(vmm.active_page_map(), PhysicalPage::from_index(3));

        unsafe { vmm.flush_page_map(PhysicalPage::from_index(8)) };
        assert_eq!(vmm.active_page_map(), PhysicalPage::from_index(8));
    }

    #[test]
    fn only_table_exhaustion_is_fatal() {
        let va = VirtualAddress::new(0x1000);
        let exhausted = AddressSpaceError::TableAllocation {
            level: kernel_vmem::TableLevel::Pt,
        };
        let large = AddressSpaceError::LargePageInPath {
            va,
            level: kernel_vmem::TableLevel::Pt,
        };
        assert!(VmmError::Map { va, source: exhausted }.is_fatal());
        assert!(!VmmError::Map { va, source: large }.is_fatal());
        assert!(!VmmError::Clone(exhausted).is_fatal());
        assert!(VmmError::RootAllocation.is_fatal());
    }
}
