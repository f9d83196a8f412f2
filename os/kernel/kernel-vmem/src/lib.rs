//! # Virtual Memory Support
//!
//! x86-64 four-level paging: the bit-exact entry and table layout, address
//! indexing, and an [`AddressSpace`] walker that maps, unmaps, translates and
//! deep-clones a page table tree.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E
//! ```
//!
//! This crate only ever creates 4 KiB leaves, but reads and copies large ones
//! it finds (e.g. from the firmware's tables).
//!
//! ## Seams
//!
//! The walker owns no memory. Pages for new tables come from a
//! [`PageTableSource`] (the physical memory manager in the kernel, a bump
//! allocator in tests); a [`PhysMapper`] turns a table's physical address into
//! something the CPU can currently dereference.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod address_space;
mod page_entry_bits;
mod page_table;

pub use crate::address_space::{AddressSpace, AddressSpaceError, TableLevel};
pub use crate::page_entry_bits::{PageEntryBits, PageTableFlag};
pub use crate::page_table::{PageTable, PageTableIndices, TableIndex};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};

/// Hands out physical pages to hold new page tables.
///
/// Returned pages are exclusively owned by the caller from then on. Their
/// content is unspecified; the walker zeroes them.
pub trait PageTableSource {
    /// One free 4 KiB page, or `None` when exhausted.
    fn allocate_page(&mut self) -> Option<PhysicalPage>;
}

impl<T: PageTableSource + ?Sized> PageTableSource for &mut T {
    #[inline]
    fn allocate_page(&mut self) -> Option<PhysicalPage> {
        (**self).allocate_page()
    }
}

/// Makes physical memory reachable through the current address space.
///
/// The kernel identity-maps all RAM, so its mapper is the identity function;
/// tests back "physical memory" with a host buffer.
pub trait PhysMapper {
    /// The virtual pointer through which `pa` can be accessed right now.
    fn phys_to_ptr<T>(&self, pa: PhysicalAddress) -> *mut T;

    /// Borrows the `T` stored at `pa`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable and suitably aligned for `T`.
    /// - The bytes at `pa` must be a valid `T`, and no other live reference may
    ///   alias them for `'a`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr::<T>(pa) }
    }

    /// Fills one page with zeroes.
    ///
    /// # Safety
    /// `page` must be mapped writable and not in use by anything else.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn zero_page(&self, page: PhysicalPage) {
        unsafe {
            core::ptr::write_bytes(self.phys_to_ptr::<u8>(page.base()), 0, PAGE_SIZE as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::VirtualAddress;

    /// A trivial bump allocator handing out consecutive 4 KiB frames.
    struct BumpAlloc {
        next: u64,
        end: u64,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self { next: start, end }
        }

        fn handed_out(&self, start: u64) -> u64 {
            (self.next - start) / PAGE_SIZE
        }
    }

    impl PageTableSource for BumpAlloc {
        fn allocate_page(&mut self) -> Option<PhysicalPage> {
            if self.next + PAGE_SIZE > self.end {
                return None;
            }
            let p = self.next;
            self.next += PAGE_SIZE;
            Some(PhysicalPage::containing_address(PhysicalAddress::new(p)))
        }
    }

    #[repr(align(4096))]
    #[derive(Clone)]
    struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

    /// Simulated physical memory: physical address `pa` is byte `pa` of a
    /// leaked, page-aligned host buffer. Frames start out filled with garbage
    /// so that missing zeroing shows up.
    struct TestPhys {
        base: *mut u8,
        len: usize,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let frames = vec![Aligned4K([0xa5; 4096]); n].leak();
            Self {
                base: frames.as_mut_ptr().cast(),
                len: n * 4096,
            }
        }
    }

    impl PhysMapper for TestPhys {
        fn phys_to_ptr<T>(&self, pa: PhysicalAddress) -> *mut T {
            let off = usize::try_from(pa.as_u64()).unwrap();
            assert!(off + size_of::<T>() <= self.len, "{pa} outside simulated RAM");
            self.base.wrapping_add(off).cast()
        }
    }

    const FRAMES: u64 = 64;

    fn setup() -> (TestPhys, BumpAlloc) {
        (TestPhys::with_frames(FRAMES as usize), BumpAlloc::new(0, FRAMES * PAGE_SIZE))
    }

    fn table<'a>(phys: &TestPhys, page: PhysicalPage) -> &'a mut PageTable {
        unsafe { phys.phys_to_mut(page.base()) }
    }

    #[test]
    fn map_one_page_creates_tables_and_leaf() {
        let (phys, mut alloc) = setup();
        let aspace = AddressSpace::allocate(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0xffff_8000_0000_0000);
        let pa = PhysicalAddress::new(0x30_0000);
        let flags = PageEntryBits::kernel_rw().with_global(true).with_no_execute(true);
        aspace.map(&mut alloc, va, pa, flags).unwrap();

        // Root plus one table for each of the three lower levels.
        assert_eq!(alloc.handed_out(0), 4);

        let idx = PageTableIndices::of(va);
        let e4 = table(&phys, aspace.root_page()).get(idx.pml4);
        assert!(e4.present() && e4.read_write() && !e4.user_accessible());
        let e3 = table(&phys, e4.next_table().unwrap()).get(idx.pdpt);
        let e2 = table(&phys, e3.next_table().unwrap()).get(idx.pd);
        let e1 = table(&phys, e2.next_table().unwrap()).get(idx.pt);
        assert_eq!(e1, flags.with_physical_address(pa));

        // Freshly linked tables were zeroed: only the path slots are present.
        let pt = table(&phys, e2.next_table().unwrap());
        assert_eq!(pt.present_entries().count(), 1);
    }

    #[test]
    fn mapping_twice_reaches_the_same_state() {
        let (phys, mut alloc) = setup();
        let aspace = AddressSpace::allocate(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x4000_1000);
        let pa = PhysicalAddress::new(0x7000);

        aspace.map(&mut alloc, va, pa, PageEntryBits::kernel_rw()).unwrap();
        let first = aspace.leaf_entry(va);
        let used = alloc.handed_out(0);

        aspace.map(&mut alloc, va, pa, PageEntryBits::kernel_rw()).unwrap();
        assert_eq!(aspace.leaf_entry(va), first);
        assert_eq!(alloc.handed_out(0), used);
    }

    #[test]
    fn user_leaf_widens_but_never_narrows_links() {
        let (phys, mut alloc) = setup();
        let aspace = AddressSpace::allocate(&phys, &mut alloc).unwrap();
        let user = VirtualAddress::new(0x40_0000);
        let kernel = VirtualAddress::new(0x40_1000);

        let user_flags = PageEntryBits::kernel_rw().with_user_accessible(true);
        aspace.map(&mut alloc, user, PhysicalAddress::new(0x1000), user_flags).unwrap();
        aspace
            .map(&mut alloc, kernel, PhysicalAddress::new(0x2000), PageEntryBits::kernel_rw())
            .unwrap();

        let idx = PageTableIndices::of(user);
        let e4 = table(&phys, aspace.root_page()).get(idx.pml4);
        assert!(e4.user_accessible());
        assert!(aspace.leaf_entry(user).unwrap().user_accessible());
        assert!(!aspace.leaf_entry(kernel).unwrap().user_accessible());
    }

    #[test]
    fn translate_adds_the_page_offset() {
        let (phys, mut alloc) = setup();
        let aspace = AddressSpace::allocate(&phys, &mut alloc).unwrap();
        aspace
            .map(
                &mut alloc,
                VirtualAddress::new(0xffff_ffff_8000_0000),
                PhysicalAddress::new(0x10_0000),
                PageEntryBits::kernel_rw(),
            )
            .unwrap();

        assert_eq!(
            aspace.translate(VirtualAddress::new(0xffff_ffff_8000_0123)),
            Some(PhysicalAddress::new(0x10_0123))
        );
        assert_eq!(aspace.translate(VirtualAddress::new(0xffff_ffff_8000_1000)), None);
        assert_eq!(aspace.translate(VirtualAddress::new(0x1000)), None);
    }

    #[test]
    fn translate_understands_large_leaves() {
        let (phys, mut alloc) = setup();
        let aspace = AddressSpace::allocate(&phys, &mut alloc).unwrap();

        // Borrow the walker to build PML4 → PDPT → PD, then drop in a 2 MiB leaf.
        let va = VirtualAddress::new(0x4020_0000);
        aspace.map(&mut alloc, va, PhysicalAddress::zero(), PageEntryBits::kernel_rw()).unwrap();
        let idx = PageTableIndices::of(va);
        let e4 = table(&phys, aspace.root_page()).get(idx.pml4);
        let pd = table(&phys, e4.next_table().unwrap()).get(idx.pdpt).next_table().unwrap();
        table(&phys, pd).set(
            idx.pd,
            PageEntryBits::kernel_rw()
                .with_large_page(true)
                .with_physical_address(PhysicalAddress::new(0x8000_0000)),
        );

        assert_eq!(
            aspace.translate(VirtualAddress::new(0x4021_2345)),
            Some(PhysicalAddress::new(0x8001_2345))
        );
        assert_eq!(
            aspace.map(&mut alloc, va, PhysicalAddress::zero(), PageEntryBits::kernel_rw()),
            Err(AddressSpaceError::LargePageInPath { va, level: TableLevel::Pt })
        );
    }

    #[test]
    fn unmap_clears_only_the_present_bit() {
        let (phys, mut alloc) = setup();
        let aspace = AddressSpace::allocate(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x20_0000);
        let pa = PhysicalAddress::new(0x9000);
        let flags = PageEntryBits::kernel_rw().with_global(true);
        aspace.map(&mut alloc, va, pa, flags).unwrap();

        assert!(aspace.unmap(va));
        let leaf = aspace.leaf_entry(va).unwrap();
        assert_eq!(leaf, flags.with_present(false).with_physical_address(pa));
        assert_eq!(aspace.translate(va), None);

        // A second unmap finds nothing present.
        assert!(!aspace.unmap(va));

        aspace.map(&mut alloc, va, pa, flags).unwrap();
        assert_eq!(aspace.translate(va), Some(pa));
    }

    #[test]
    fn unmap_without_tables_is_a_no_op() {
        let (phys, mut alloc) = setup();
        let aspace = AddressSpace::allocate(&phys, &mut alloc).unwrap();
        assert!(!aspace.unmap(VirtualAddress::zero()));
        assert_eq!(table(&phys, aspace.root_page()).present_entries().count(), 0);
    }

    #[test]
    fn running_out_of_tables_is_fatal() {
        let phys = TestPhys::with_frames(3);
        let mut alloc = BumpAlloc::new(0, 3 * PAGE_SIZE);
        let aspace = AddressSpace::allocate(&phys, &mut alloc).unwrap();

        let err = aspace
            .map(&mut alloc, VirtualAddress::new(0x1000), PhysicalAddress::zero(), PageEntryBits::kernel_rw())
            .unwrap_err();
        assert_eq!(err, AddressSpaceError::TableAllocation { level: TableLevel::Pt });
        assert!(err.is_fatal());
    }

    #[test]
    fn deep_clone_is_independent() {
        let (phys, mut alloc) = setup();
        let original = AddressSpace::allocate(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0xffff_ffff_ff00_0000);
        let pa = PhysicalAddress::new(0x5000);
        original.map(&mut alloc, va, pa, PageEntryBits::kernel_rw()).unwrap();
        let before = alloc.handed_out(0);

        let clone = original.deep_clone(&mut alloc).unwrap();
        assert_ne!(clone.root_page(), original.root_page());
        assert_eq!(alloc.handed_out(0), before + 4);
        assert_eq!(clone.translate(va), Some(pa));

        clone
            .map(&mut alloc, va, PhysicalAddress::new(0x6000), PageEntryBits::kernel_rw())
            .unwrap();
        assert_eq!(clone.translate(va), Some(PhysicalAddress::new(0x6000)));
        assert_eq!(original.translate(va), Some(pa));

        assert!(clone.unmap(va));
        assert_eq!(original.translate(va), Some(pa));
    }

    #[test]
    fn failed_deep_clone_keeps_its_partial_tables() {
        let (phys, mut alloc) = setup();
        let original = AddressSpace::allocate(&phys, &mut alloc).unwrap();
        original
            .map(&mut alloc, VirtualAddress::new(0x1000), PhysicalAddress::new(0x1000), PageEntryBits::kernel_rw())
            .unwrap();

        // Room for the new PML4 and PDPT only.
        let start = alloc.next;
        let mut short = BumpAlloc::new(start, start + 2 * PAGE_SIZE);
        let err = original.deep_clone(&mut short).err();
        assert_eq!(err, Some(AddressSpaceError::TableAllocation { level: TableLevel::Pd }));

        // Nothing is rolled back: both pages stay handed out.
        assert_eq!(short.handed_out(start), 2);
        assert_eq!(original.translate(VirtualAddress::new(0x1000)), Some(PhysicalAddress::new(0x1000)));
    }
}
