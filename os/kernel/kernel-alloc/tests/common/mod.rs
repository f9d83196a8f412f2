//! Host stand-ins for physical memory, the firmware memory map and CR3.

#![allow(dead_code)]

use kernel_alloc::vmm::PagingControl;
use kernel_info::memory_map::{MemoryDescriptor, MemoryType};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualPage};
use kernel_vmem::PhysMapper;

/// Descriptor stride used by the synthetic maps; larger than the encoded size
/// like real firmware strides.
pub const STRIDE: usize = 48;

#[repr(align(4096))]
#[derive(Clone)]
struct Frame(#[allow(dead_code)] [u8; 4096]);

/// Simulated physical memory: physical address `pa` is byte `pa` of a leaked,
/// page-aligned host buffer. Frames start out as garbage.
pub struct TestPhys {
    base: *mut u8,
    len: usize,
}

impl TestPhys {
    pub fn with_frames(n: usize) -> Self {
        let frames = vec![Frame([0xa5; 4096]); n].leak();
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

/// Encodes `regions` (type, first page, page count) as a raw memory map.
pub fn memory_map_bytes(regions: &[(MemoryType, u64, u64)]) -> Vec<u8> {
    let mut bytes = vec![0xee; regions.len() * STRIDE];
    for (chunk, &(ty, first, pages)) in bytes.chunks_exact_mut(STRIDE).zip(regions) {
        let descriptor = MemoryDescriptor::new(ty, PhysicalAddress::from_page_index(first), pages);
        assert!(descriptor.encode(chunk));
    }
    bytes
}

/// Records what would have gone to CR3 and `invlpg`.
pub struct RecordingPaging {
    pub root: PhysicalPage,
    pub writes: Vec<PhysicalPage>,
    pub invalidated: Vec<VirtualPage>,
}

impl RecordingPaging {
    pub fn new(root: PhysicalPage) -> Self {
        Self {
            root,
            writes: Vec::new(),
            invalidated: Vec::new(),
        }
    }
}

impl PagingControl for RecordingPaging {
    fn read_root(&self) -> PhysicalPage {
        self.root
    }

    unsafe fn write_root(&mut self, root: PhysicalPage) {
        self.root = root;
        self.writes.push(root);
    }

    fn invalidate_page(&mut self, page: VirtualPage) {
        self.invalidated.push(page);
    }
}
