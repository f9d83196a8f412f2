mod common;

use common::{STRIDE, TestPhys, memory_map_bytes};
use kernel_alloc::pmm::{PhysicalMemoryManager, PmmError};
use kernel_info::kernel_image::KernelImage;
use kernel_info::memory::{BOOTSTRAP_BITMAP_BYTES, KERNEL_BASE};
use kernel_info::memory_map::{MemoryMap, MemoryType};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_vmem::{AddressSpace, PhysMapper};

const ROOT: u64 = 9;

fn kernel_in_first_pages(pages: u64) -> KernelImage {
    KernelImage::new(PhysicalAddress::zero(), VirtualAddress::new(KERNEL_BASE), pages * 4096)
}

/// Pages 0..10 loader data (kernel in 0..4, active PML4 at 9), 10..110 free.
fn boot<'b>(phys: &'b TestPhys, bootstrap: &'b mut [u8]) -> PhysicalMemoryManager<'b> {
    let bytes = memory_map_bytes(&[(MemoryType::LoaderData, 0, 10), (MemoryType::Conventional, 10, 100)]);
    let map = MemoryMap::new(&bytes, STRIDE);
    unsafe { phys.zero_page(PhysicalPage::from_index(ROOT)) };

    PhysicalMemoryManager::init(
        &map,
        &kernel_in_first_pages(4),
        bootstrap,
        phys,
        PhysicalPage::from_index(ROOT),
    )
    .unwrap()
}

#[test]
fn bring_up_reserves_bitmap_and_identity_tables() {
    let phys = TestPhys::with_frames(110);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let pmm = boot(&phys, &mut bootstrap);

    assert_eq!(pmm.total_pages(), 110);
    // 100 conventional pages minus the bitmap page (10) and three identity-map tables (11..14).
    assert_eq!(pmm.free_pages_count(), 96);
    assert_eq!(pmm.used_pages_count(), 14);
    for page in (0..14).map(PhysicalAddress::from_page_index) {
        assert!(pmm.is_locked(page), "{page} should be locked");
    }
    assert!(!pmm.is_locked(PhysicalAddress::from_page_index(14)));
    assert_eq!(pmm.bitmap().len(), 110 / 8 + 1);
    assert_eq!(pmm.bitmap().as_ptr(), phys.phys_to_ptr::<u8>(PhysicalAddress::from_page_index(10)).cast_const());
}

#[test]
fn low_memory_is_identity_mapped_in_the_active_tables() {
    let phys = TestPhys::with_frames(110);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let _pmm = boot(&phys, &mut bootstrap);

    let aspace = AddressSpace::from_root(&phys, PhysicalPage::from_index(ROOT));
    for pa in [0x0, 0x5123, 0xa000, 0x6d_fff] {
        assert_eq!(aspace.translate(VirtualAddress::new(pa)), Some(PhysicalAddress::new(pa)));
    }
    assert_eq!(aspace.translate(VirtualAddress::new(0x6e_000)), None);
    let leaf = aspace.leaf_entry(VirtualAddress::new(0x5000)).unwrap();
    assert!(leaf.present() && leaf.read_write() && leaf.global());
}

#[test]
fn first_allocation_follows_the_reserved_pages() {
    let phys = TestPhys::with_frames(110);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let mut pmm = boot(&phys, &mut bootstrap);

    assert_eq!(pmm.request_page().unwrap().index(), 14);
    let run = pmm.request_pages(10).unwrap();
    assert_eq!(run.index(), 15);
    assert_eq!(pmm.free_pages_count(), 85);
    assert_eq!(pmm.free_pages_count() + pmm.used_pages_count(), pmm.total_pages());
}

#[test]
fn kernel_inside_conventional_memory_stays_locked() {
    let phys = TestPhys::with_frames(64);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let bytes = memory_map_bytes(&[(MemoryType::Conventional, 0, 64)]);
    let map = MemoryMap::new(&bytes, STRIDE);
    let kernel = KernelImage::new(
        PhysicalAddress::from_page_index(40),
        VirtualAddress::new(KERNEL_BASE),
        3 * 4096 + 1,
    );
    // The active root sits inside the kernel range so it is never handed out as a table.
    unsafe { phys.zero_page(PhysicalPage::from_index(42)) };
    let pmm = PhysicalMemoryManager::init(&map, &kernel, &mut bootstrap, &phys, PhysicalPage::from_index(42))
        .unwrap();

    for page in 40..44 {
        assert!(pmm.is_locked(PhysicalAddress::from_page_index(page)));
    }
    assert!(!pmm.is_locked(PhysicalAddress::from_page_index(44)));
}

#[test]
fn missing_conventional_memory_is_fatal() {
    let phys = TestPhys::with_frames(16);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let bytes = memory_map_bytes(&[(MemoryType::LoaderCode, 0, 8), (MemoryType::AcpiReclaim, 8, 8)]);
    let map = MemoryMap::new(&bytes, STRIDE);

    let err = PhysicalMemoryManager::init(
        &map,
        &kernel_in_first_pages(1),
        &mut bootstrap,
        &phys,
        PhysicalPage::from_index(2),
    )
    .unwrap_err();
    assert!(matches!(err, PmmError::NoUsableMemory { .. }));
    assert!(err.is_fatal());
}
