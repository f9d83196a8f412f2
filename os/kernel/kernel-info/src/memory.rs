//! # Memory Layout

use kernel_memory_addresses::PAGE_SIZE;

/// `n` KiB in bytes.
#[must_use]
pub const fn kib(n: u64) -> u64 {
    n * 1024
}

/// `n` MiB in bytes.
#[must_use]
pub const fn mib(n: u64) -> u64 {
    n * 1024 * 1024
}

/// Where the kernel executes (VMA), matches the linker script.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image bytes sit in *physical* memory (LMA).
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Fixed virtual base of the kernel heap. Not relocatable at runtime.
pub const HEAP_VIRTUAL_BASE: u64 = 0xffff_ffff_ff00_0000;

/// End (exclusive) of the heap's virtual window. The topmost page stays
/// unmapped, so the heap can never wrap around to address zero.
pub const HEAP_VIRTUAL_END: u64 = 0xffff_ffff_ffff_f000;

/// Number of pages mapped for the heap during initialization.
pub const HEAP_INITIAL_PAGES: u64 = 1;

/// Highest physical address (exclusive) the bootstrap page bitmap can describe.
pub const BOOTSTRAP_BITMAP_CEILING: u64 = mib(64);

/// Number of pages the bootstrap page bitmap can describe.
pub const BOOTSTRAP_BITMAP_PAGES: u64 = BOOTSTRAP_BITMAP_CEILING / PAGE_SIZE;

/// Size of the bootstrap page bitmap in bytes, one bit per page.
#[allow(clippy::cast_possible_truncation)]
pub const BOOTSTRAP_BITMAP_BYTES: usize = (BOOTSTRAP_BITMAP_PAGES / 8) as usize;

/// The size of the kernel stack.
pub const KERNEL_STACK_SIZE: usize = 64 * 1024;

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(16));
    assert!(KERNEL_BASE.is_multiple_of(mib(2)));
    assert!(PHYS_LOAD.is_multiple_of(PAGE_SIZE));
    assert!(HEAP_VIRTUAL_BASE.is_multiple_of(PAGE_SIZE));
    assert!(HEAP_VIRTUAL_BASE > KERNEL_BASE);
    assert!(HEAP_VIRTUAL_END.is_multiple_of(PAGE_SIZE));
    assert!(HEAP_VIRTUAL_BASE + HEAP_INITIAL_PAGES * PAGE_SIZE <= HEAP_VIRTUAL_END);
    assert!(HEAP_INITIAL_PAGES > 0);
    assert!(BOOTSTRAP_BITMAP_PAGES.is_multiple_of(8));
};
