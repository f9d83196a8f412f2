mod common;

use common::{RecordingPaging, STRIDE, TestPhys, memory_map_bytes};
use kernel_alloc::heap::{HeapError, HeapPager, VmmHeapPager};
use kernel_alloc::pmm::{PhysicalMemoryManager, PmmError};
use kernel_alloc::vmm::Vmm;
use kernel_info::kernel_image::KernelImage;
use kernel_info::memory::{BOOTSTRAP_BITMAP_BYTES, HEAP_VIRTUAL_BASE, KERNEL_BASE};
use kernel_info::memory_map::{MemoryMap, MemoryType};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_vmem::{PageEntryBits, PhysMapper};

const LOADER_ROOT: u64 = 9;

fn kernel() -> KernelImage {
    KernelImage::new(PhysicalAddress::zero(), VirtualAddress::new(KERNEL_BASE), 4 * 4096)
}

fn boot<'b>(phys: &'b TestPhys, bootstrap: &'b mut [u8]) -> PhysicalMemoryManager<'b> {
    let bytes = memory_map_bytes(&[(MemoryType::LoaderData, 0, 10), (MemoryType::Conventional, 10, 100)]);
    let map = MemoryMap::new(&bytes, STRIDE);
    unsafe { phys.zero_page(PhysicalPage::from_index(LOADER_ROOT)) };
    PhysicalMemoryManager::init(&map, &kernel(), bootstrap, phys, PhysicalPage::from_index(LOADER_ROOT))
        .unwrap()
}

#[test]
fn kernel_page_map_covers_ram_and_the_higher_half() {
    let phys = TestPhys::with_frames(110);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let mut pmm = boot(&phys, &mut bootstrap);
    let mut vmm = Vmm::new(&phys, RecordingPaging::new(PhysicalPage::from_index(LOADER_ROOT)));

    let root = unsafe { vmm.init_virtual_with_new_root(&mut pmm, &kernel()) }.unwrap();
    assert_eq!(root.index(), 14);
    assert_eq!(vmm.paging().writes, [root]);
    assert_eq!(vmm.active_page_map(), root);

    for pa in [0x1000, 0x5123, 0x6d_fff] {
        assert_eq!(vmm.translate(VirtualAddress::new(pa)), Some(PhysicalAddress::new(pa)));
    }
    assert_eq!(
        vmm.translate(VirtualAddress::new(KERNEL_BASE + 0x2abc)),
        Some(PhysicalAddress::new(0x2abc))
    );
    assert_eq!(vmm.translate(VirtualAddress::new(KERNEL_BASE + 0x4000)), None);

    let image = vmm
        .address_space(root)
        .leaf_entry(VirtualAddress::new(KERNEL_BASE))
        .unwrap();
    assert!(image.present() && image.global());
}

#[test]
fn null_page_is_not_mapped() {
    let phys = TestPhys::with_frames(110);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let mut pmm = boot(&phys, &mut bootstrap);
    let mut vmm = Vmm::new(&phys, RecordingPaging::new(PhysicalPage::from_index(LOADER_ROOT)));
    let root = unsafe { vmm.init_virtual_with_new_root(&mut pmm, &kernel()) }.unwrap();

    assert_eq!(vmm.translate(VirtualAddress::zero()), None);
    assert_eq!(vmm.translate(VirtualAddress::new(0xfff)), None);
    let leaf = vmm.address_space(root).leaf_entry(VirtualAddress::zero()).unwrap();
    assert!(!leaf.present());
}

#[test]
fn page_map_tables_come_from_the_pmm() {
    let phys = TestPhys::with_frames(110);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let mut pmm = boot(&phys, &mut bootstrap);
    let free_before = pmm.free_pages_count();
    let mut vmm = Vmm::new(&phys, RecordingPaging::new(PhysicalPage::from_index(LOADER_ROOT)));

    unsafe { vmm.init_virtual_with_new_root(&mut pmm, &kernel()) }.unwrap();
    // PML4, one PDPT/PD/PT chain for low memory and one for the kernel image.
    assert_eq!(free_before - pmm.free_pages_count(), 7);
}

#[test]
fn clone_translates_identically_and_shares_no_tables() {
    let phys = TestPhys::with_frames(110);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let mut pmm = boot(&phys, &mut bootstrap);
    let mut vmm = Vmm::new(&phys, RecordingPaging::new(PhysicalPage::from_index(LOADER_ROOT)));
    let root = unsafe { vmm.init_virtual_with_new_root(&mut pmm, &kernel()) }.unwrap();

    let free_before = pmm.free_pages_count();
    let copy = vmm.clone_active_page_map(&mut pmm).unwrap();
    assert_ne!(copy, root);
    assert_eq!(free_before - pmm.free_pages_count(), 7);
    assert_eq!(vmm.active_page_map(), root);

    let original = vmm.address_space(root);
    let cloned = vmm.address_space(copy);
    for va in [0x0, 0x1000, 0x3_4567, 0x6d_fff, KERNEL_BASE, KERNEL_BASE + 0x3fff, HEAP_VIRTUAL_BASE] {
        let va = VirtualAddress::new(va);
        assert_eq!(original.translate(va), cloned.translate(va), "{va}");
    }

    let va = VirtualAddress::new(0x40_0000_0000);
    vmm.map(&mut pmm, copy, va, PhysicalAddress::from_page_index(60), PageEntryBits::kernel_rw())
        .unwrap();
    assert_eq!(vmm.address_space(copy).translate(va), Some(PhysicalAddress::from_page_index(60)));
    assert_eq!(vmm.address_space(root).translate(va), None);

    assert!(vmm.unmap(copy, VirtualAddress::new(0x5000)));
    assert_eq!(
        vmm.translate(VirtualAddress::new(0x5000)),
        Some(PhysicalAddress::new(0x5000))
    );
    // Neither change touched the active map.
    assert!(vmm.paging().invalidated.is_empty());
}

#[test]
fn active_map_changes_invalidate_the_tlb() {
    let phys = TestPhys::with_frames(110);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let mut pmm = boot(&phys, &mut bootstrap);
    let mut vmm = Vmm::new(&phys, RecordingPaging::new(PhysicalPage::from_index(LOADER_ROOT)));
    unsafe { vmm.init_virtual_with_new_root(&mut pmm, &kernel()) }.unwrap();

    let va = VirtualAddress::new(0x40_0000_0123);
    vmm.map_active(&mut pmm, va, PhysicalAddress::from_page_index(70), PageEntryBits::kernel_rw())
        .unwrap();
    assert_eq!(vmm.translate(va), Some(PhysicalAddress::from_page_index(70) + 0x123));

    assert!(vmm.unmap_active(va));
    assert!(!vmm.unmap_active(va));
    assert_eq!(vmm.translate(va), None);
    assert_eq!(vmm.paging().invalidated, [va.page(), va.page()]);
}

#[test]
fn heap_pages_are_backed_through_the_active_map() {
    let phys = TestPhys::with_frames(110);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let mut pmm = boot(&phys, &mut bootstrap);
    let mut vmm = Vmm::new(&phys, RecordingPaging::new(PhysicalPage::from_index(LOADER_ROOT)));
    let root = unsafe { vmm.init_virtual_with_new_root(&mut pmm, &kernel()) }.unwrap();

    let base = VirtualAddress::new(HEAP_VIRTUAL_BASE);
    let mut pager = VmmHeapPager::new(&mut pmm, &mut vmm);
    pager.map_page(base).unwrap();
    pager.map_page(base + 4096).unwrap();

    let first = vmm.translate(base).unwrap();
    let second = vmm.translate(base + 4096).unwrap();
    assert_ne!(first, second);
    assert!(pmm.is_locked(first) && pmm.is_locked(second));

    let leaf = vmm.address_space(root).leaf_entry(base).unwrap();
    assert!(leaf.present() && leaf.read_write() && leaf.global() && !leaf.user_accessible());
}

#[test]
fn heap_backing_failure_is_fatal() {
    let phys = TestPhys::with_frames(110);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let mut pmm = boot(&phys, &mut bootstrap);
    let mut vmm = Vmm::new(&phys, RecordingPaging::new(PhysicalPage::from_index(LOADER_ROOT)));
    unsafe { vmm.init_virtual_with_new_root(&mut pmm, &kernel()) }.unwrap();

    while pmm.request_page().is_ok() {}
    let mut pager = VmmHeapPager::new(&mut pmm, &mut vmm);
    let err = pager.map_page(VirtualAddress::new(HEAP_VIRTUAL_BASE)).unwrap_err();
    assert_eq!(err, HeapError::Backing(PmmError::OutOfMemory));
    assert!(err.is_fatal());
}

#[test]
fn heap_page_is_returned_when_its_tables_cannot_be_built() {
    let phys = TestPhys::with_frames(110);
    let mut bootstrap = vec![0; BOOTSTRAP_BITMAP_BYTES];
    let mut pmm = boot(&phys, &mut bootstrap);
    let mut vmm = Vmm::new(&phys, RecordingPaging::new(PhysicalPage::from_index(LOADER_ROOT)));
    unsafe { vmm.init_virtual_with_new_root(&mut pmm, &kernel()) }.unwrap();

    // One page left: enough for the data page, not for the missing PD and PT.
    while pmm.free_pages_count() > 1 {
        pmm.request_page().unwrap();
    }
    let mut pager = VmmHeapPager::new(&mut pmm, &mut vmm);
    let err = pager.map_page(VirtualAddress::new(HEAP_VIRTUAL_BASE)).unwrap_err();
    assert!(matches!(err, HeapError::Map(_)), "{err:?}");
    assert!(err.is_fatal());

    assert_eq!(pmm.free_pages_count(), 1);
    assert!(pmm.request_page().is_ok());
}
