//! # Kernel Boot Information

use crate::memory_map::MemoryMap;
use kernel_memory_addresses::PhysicalAddress;

/// Kernel function pointer.
///
/// # ABI
/// The loader jumps to the kernel with `boot_info` in `RDI` (System V, Rust's `extern "C"`).
pub type KernelEntryFn = extern "C" fn(*const KernelBootInfo) -> !;

/// Information the kernel needs right after `ExitBootServices`.
///
/// Produced once by the bootloader and consumed once at kernel entry.
/// Keep this `#[repr(C)]` with fixed-size integers at the ABI boundary.
#[repr(C)]
#[derive(Clone)]
pub struct KernelBootInfo {
    /// Framebuffer information, passed from UEFI GOP.
    pub fb: FramebufferInfo,

    /// The PSF1 font the loader read from disk.
    pub font: FontInfo,

    /// Firmware memory map information.
    pub mmap: MemoryMapInfo,

    /// RSDP (ACPI 2.0+) physical address, or 0 if not provided.
    pub rsdp_addr: u64,
}

impl KernelBootInfo {
    /// The firmware memory map the loader handed over.
    ///
    /// # Safety
    /// `mmap.mmap_ptr` must point to `mmap.mmap_len` readable bytes that are not
    /// reused while the returned map is alive (the physical memory manager keeps
    /// the loader's region locked for that reason).
    #[allow(unsafe_code, clippy::cast_possible_truncation)]
    #[must_use]
    pub unsafe fn memory_map(&self) -> MemoryMap<'_> {
        unsafe {
            MemoryMap::from_raw(
                self.mmap.mmap_ptr as *const u8,
                self.mmap.mmap_len as usize,
                self.mmap.mmap_desc_size as usize,
            )
        }
    }

    /// The ACPI root table, if the firmware reported one.
    #[must_use]
    pub const fn rsdp(&self) -> Option<PhysicalAddress> {
        if self.rsdp_addr == 0 {
            None
        } else {
            Some(PhysicalAddress::new(self.rsdp_addr))
        }
    }
}

#[repr(C)]
#[derive(Clone)]
pub struct MemoryMapInfo {
    /// Pointer to the raw UEFI memory map buffer (array of `EFI_MEMORY_DESCRIPTOR` bytes).
    pub mmap_ptr: u64,

    /// Length of the memory map buffer in **bytes**.
    pub mmap_len: u64,

    /// Stride between descriptors in bytes. Usually larger than the descriptor itself.
    pub mmap_desc_size: u64,

    /// Descriptor version (from UEFI).
    pub mmap_desc_version: u32,
}

#[repr(C)]
#[derive(Clone)]
pub struct FramebufferInfo {
    /// Linear framebuffer base address (physical).
    pub framebuffer_ptr: u64,

    /// Total framebuffer size in **bytes**.
    pub framebuffer_size: u64,

    /// Visible width in **pixels**.
    pub framebuffer_width: u64,

    /// Visible height in **pixels**.
    pub framebuffer_height: u64,

    /// Pixels per scanline. May be >= width due to padding.
    pub framebuffer_stride: u64,
}

/// A PSF1 bitmap font, as loaded by the bootloader.
#[repr(C)]
#[derive(Clone)]
pub struct FontInfo {
    /// Physical address of the glyph bitmaps.
    pub glyph_buffer_ptr: u64,

    /// Bytes per glyph (PSF1 `charsize`, one byte per 8-pixel row).
    pub glyph_size: u32,

    /// Number of glyphs: 256, or 512 when the PSF1 mode says so.
    pub glyph_count: u32,
}
