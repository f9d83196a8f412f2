//! # Memory Bring-up
//!
//! Wires the memory-management crates together on the bootstrap processor:
//!
//! 1. dump the firmware memory map,
//! 2. build the physical memory manager on the static bootstrap bitmap,
//! 3. build the kernel page map in a fresh PML4 and load it,
//! 4. map the initial heap at [`HEAP_VIRTUAL_BASE`], with room to grow up to
//!    [`HEAP_VIRTUAL_END`].
//!
//! The result is handed to [`KERNEL_ALLOCATOR`](crate::allocator::KERNEL_ALLOCATOR).

use core::ptr::NonNull;
use kernel_alloc::heap::{Heap, HeapError, VmmHeapPager};
use kernel_alloc::phys_mapper::IdentityPhysMapper;
use kernel_alloc::pmm::{PhysicalMemoryManager, PmmError};
use kernel_alloc::vmm::{Cr3Register, Vmm, VmmError};
use kernel_info::kernel_image::KernelImage;
use kernel_info::memory::{BOOTSTRAP_BITMAP_BYTES, HEAP_VIRTUAL_BASE, HEAP_VIRTUAL_END, KERNEL_BASE, PHYS_LOAD};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use thiserror::Error;

/// Backing store for the page bitmap until the PMM has placed the real one.
static mut BOOTSTRAP_BITMAP: [u8; BOOTSTRAP_BITMAP_BYTES] = [0; BOOTSTRAP_BITMAP_BYTES];

static MAPPER: IdentityPhysMapper = IdentityPhysMapper;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum MemoryInitError {
    #[error("physical memory manager: {0}")]
    Pmm(#[from] PmmError),
    #[error("virtual memory manager: {0}")]
    Vmm(#[from] VmmError),
    #[error("heap: {0}")]
    Heap(#[from] HeapError),
}

impl MemoryInitError {
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Pmm(e) => e.is_fatal(),
            Self::Vmm(e) => e.is_fatal(),
            Self::Heap(e) => e.is_fatal(),
        }
    }
}

/// Everything memory management owns once bring-up succeeded.
pub struct KernelMemory {
    pub pmm: PhysicalMemoryManager<'static>,
    pub vmm: Vmm<'static, IdentityPhysMapper, Cr3Register>,
    pub heap: Heap,
}

impl KernelMemory {
    /// Allocates `size` bytes from the kernel heap, backing growth with fresh
    /// physical pages.
    ///
    /// # Errors
    /// See [`Heap::allocate`].
    pub fn allocate(&mut self, size: u64) -> Result<NonNull<u8>, HeapError> {
        let mut pager = VmmHeapPager::new(&mut self.pmm, &mut self.vmm);
        self.heap.allocate(size, &mut pager)
    }

    /// # Safety
    /// See [`Heap::free`].
    pub unsafe fn free(&mut self, allocation: NonNull<u8>) {
        unsafe { self.heap.free(allocation) };
    }
}

/// The loaded image, given its link-time bounds.
///
/// The image is linked at [`KERNEL_BASE`] and loaded at [`PHYS_LOAD`].
fn kernel_image(start: VirtualAddress, end: VirtualAddress) -> KernelImage {
    let physical = PhysicalAddress::new(PHYS_LOAD + (start.as_u64() - KERNEL_BASE));
    KernelImage::new(physical, start, end.as_u64() - start.as_u64())
}

#[cfg(target_os = "none")]
fn linked_kernel_image() -> KernelImage {
    unsafe extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }
    kernel_image(
        VirtualAddress::from_ptr(&raw const __kernel_start),
        VirtualAddress::from_ptr(&raw const __kernel_end),
    )
}

/// Brings up PMM, VMM and heap. On success the kernel page map is active.
///
/// # Errors
/// The first component that failed, see [`MemoryInitError::is_fatal`].
///
/// # Safety
/// Call exactly once, on the bootstrap processor, while the loader's page map
/// is still active and identity-maps low memory.
#[cfg(target_os = "none")]
pub unsafe fn init_memory(
    boot_info: &kernel_info::boot::KernelBootInfo,
) -> Result<KernelMemory, MemoryInitError> {
    use crate::tracing::{log_memory_map, log_memory_map_summed};
    use kernel_alloc::vmm::PagingControl;
    use kernel_info::memory::HEAP_INITIAL_PAGES;
    use log::info;

    let map = unsafe { boot_info.memory_map() };
    log_memory_map(&map);
    log_memory_map_summed(&map);

    let kernel = linked_kernel_image();
    info!(
        "kernel image: {} bytes at {} (virtual {})",
        kernel.size, kernel.physical_start, kernel.virtual_start
    );

    let paging = unsafe { Cr3Register::new() };
    let loader_root = paging.read_root();
    info!("loader page map at {loader_root}");

    // SAFETY: single call on the boot core; nothing else references the buffer.
    let bootstrap = unsafe { &mut *(&raw mut BOOTSTRAP_BITMAP) };
    let mut pmm = PhysicalMemoryManager::init(&map, &kernel, bootstrap, &MAPPER, loader_root)?;
    pmm.log_statistics();

    let mut vmm = Vmm::new(&MAPPER, paging);
    let root = unsafe { vmm.init_virtual_with_new_root(&mut pmm, &kernel) }?;
    info!("kernel page map active at {root}");

    let heap = unsafe {
        Heap::init(
            VirtualAddress::new(HEAP_VIRTUAL_BASE),
            VirtualAddress::new(HEAP_VIRTUAL_END),
            HEAP_INITIAL_PAGES,
            &mut VmmHeapPager::new(&mut pmm, &mut vmm),
        )
    }?;

    pmm.log_statistics();
    heap.log_segments();
    Ok(KernelMemory { pmm, vmm, heap })
}
