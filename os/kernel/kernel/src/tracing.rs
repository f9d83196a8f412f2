//! # Kernel Tracing helpers

use kernel_info::boot::KernelBootInfo;
use kernel_info::memory::{kib, mib};
use kernel_info::memory_map::{MemoryMap, MemoryType};
use log::{debug, info};

pub fn trace_boot_info(boot_info: &KernelBootInfo) {
    info!(
        concat!(
            "Boot Info in Kernel:\n",
            "  BI ptr   = {bi:#018x}\n",
            "  MMAP ptr = {mmap_ptr:#018x}, len = {mmap_len}, desc size = {mmap_desc_size}, desc ver = {mmap_desc_ver}\n",
            "  FB ptr   = {fb_ptr:#018x}, size = {fb_size}, width = {fb_width}, height = {fb_height}, stride = {fb_stride}\n",
            "  FONT ptr = {font_ptr:#018x}, glyph size = {glyph_size}, glyphs = {glyph_count}\n",
            "  RSDP     = {rsdp}"
        ),
        bi = core::ptr::from_ref(boot_info) as usize,
        mmap_ptr = boot_info.mmap.mmap_ptr,
        mmap_len = boot_info.mmap.mmap_len,
        mmap_desc_size = boot_info.mmap.mmap_desc_size,
        mmap_desc_ver = boot_info.mmap.mmap_desc_version,
        fb_ptr = boot_info.fb.framebuffer_ptr,
        fb_size = boot_info.fb.framebuffer_size,
        fb_width = boot_info.fb.framebuffer_width,
        fb_height = boot_info.fb.framebuffer_height,
        fb_stride = boot_info.fb.framebuffer_stride,
        font_ptr = boot_info.font.glyph_buffer_ptr,
        glyph_size = boot_info.font.glyph_size,
        glyph_count = boot_info.font.glyph_count,
        rsdp = RsdpDisplay(boot_info),
    );
}

struct RsdpDisplay<'a>(&'a KernelBootInfo);

impl core::fmt::Display for RsdpDisplay<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.0.rsdp() {
            Some(rsdp) => write!(f, "{rsdp}"),
            None => f.write_str("none"),
        }
    }
}

/// Name of a raw firmware memory type, `"INVALID TYPE"` for unknown values.
fn type_name(raw: u32) -> &'static str {
    MemoryType::from_raw(raw).map_or("INVALID TYPE", MemoryType::name)
}

/// Logs every descriptor: type, base and size.
pub fn log_memory_map(map: &MemoryMap<'_>) {
    debug!("memory map: {} descriptors, stride {}", map.len(), map.descriptor_size());
    for desc in map.iter() {
        let size = desc.size_bytes();
        if size >= mib(1) {
            debug!(
                "  {:<28} {} {:>6} MiB",
                type_name(desc.ty),
                desc.physical_start,
                size / mib(1)
            );
        } else {
            debug!(
                "  {:<28} {} {:>6} KiB",
                type_name(desc.ty),
                desc.physical_start,
                size / kib(1)
            );
        }
    }
}

/// Logs the number of pages per memory type, skipping types that do not occur.
pub fn log_memory_map_summed(map: &MemoryMap<'_>) {
    info!("memory map: {} pages in total", map.total_pages());
    for (ty, pages) in MemoryType::ALL.iter().zip(map.pages_by_type()) {
        if pages > 0 {
            info!("  {:<28} {pages:>8} pages", ty.name());
        }
    }
}
