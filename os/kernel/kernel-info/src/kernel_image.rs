//! # Kernel Image Placement

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, pages_for};

/// Where the loaded kernel image lives.
///
/// The physical range must never be handed out by the physical memory manager,
/// even though the firmware may report it inside a usable region. The virtual
/// range is the higher-half alias the kernel is linked against.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelImage {
    /// First physical byte of the image (page aligned).
    pub physical_start: PhysicalAddress,
    /// Virtual address `physical_start` is mapped to.
    pub virtual_start: VirtualAddress,
    /// Image size in bytes.
    pub size: u64,
}

impl KernelImage {
    #[must_use]
    pub const fn new(physical_start: PhysicalAddress, virtual_start: VirtualAddress, size: u64) -> Self {
        Self {
            physical_start,
            virtual_start,
            size,
        }
    }

    /// Number of 4 KiB pages the image occupies, rounding a partial tail page up.
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        pages_for(self.physical_start.page_offset() + self.size)
    }

    /// One past the last physical byte of the image.
    #[must_use]
    pub const fn physical_end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.physical_start.as_u64() + self.size)
    }

    /// The higher-half address of a physical address inside the image.
    #[must_use]
    pub const fn virtual_for(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(
            self.virtual_start.as_u64() + (pa.as_u64() - self.physical_start.as_u64()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{KERNEL_BASE, PHYS_LOAD};

    #[test]
    fn partial_tail_page_counts() {
        let image = KernelImage::new(
            PhysicalAddress::new(PHYS_LOAD),
            VirtualAddress::new(KERNEL_BASE),
            3 * 4096 + 1,
        );
        assert_eq!(image.page_count(), 4);
        assert_eq!(image.physical_end().as_u64(), PHYS_LOAD + 3 * 4096 + 1);
    }

    #[test]
    fn higher_half_alias_keeps_offsets() {
        let image = KernelImage::new(
            PhysicalAddress::new(PHYS_LOAD),
            VirtualAddress::new(KERNEL_BASE),
            0x4000,
        );
        let va = image.virtual_for(PhysicalAddress::new(PHYS_LOAD + 0x1234));
        assert_eq!(va.as_u64(), KERNEL_BASE + 0x1234);
    }
}
