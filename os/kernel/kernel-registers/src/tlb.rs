//! Translation lookaside buffer maintenance.

use kernel_memory_addresses::VirtualPage;

/// Drops the cached translation of `page` on the executing core.
///
/// Needed after clearing or changing a leaf entry of the active address space.
/// Entries that were not present before need no invalidation.
///
/// # Safety
/// Privileged instruction; must run in Ring 0.
#[inline]
pub unsafe fn invalidate_page(page: VirtualPage) {
    let va = page.base().as_u64();
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
}
