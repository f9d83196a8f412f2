use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// CR3: page-map root register (4-level paging, PCID disabled).
///
/// Writing CR3 switches the active address space and flushes all non-global
/// TLB entries of the executing core.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    /// Bits 0..=2, reserved.
    #[bits(3)]
    __: u8,

    /// Bit 3: page-level write-through for the root table.
    pub pwt: bool,

    /// Bit 4: page-level cache disable for the root table.
    pub pcd: bool,

    /// Bits 5..=11, reserved.
    #[bits(7)]
    __: u8,

    /// Bits 12..=51: root table physical base >> 12.
    #[bits(40)]
    root_frame: u64,

    /// Bits 52..=63, reserved.
    #[bits(12)]
    __: u16,
}

impl Cr3 {
    /// A CR3 value selecting `root` with default (write-back) caching.
    #[must_use]
    pub const fn from_root(root: PhysicalPage) -> Self {
        Self::new().with_root_frame(root.index())
    }

    /// The page holding the top-level table.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        PhysicalPage::containing_address(PhysicalAddress::new(self.root_frame() << 12))
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
