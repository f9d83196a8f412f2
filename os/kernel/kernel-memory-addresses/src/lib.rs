//! # Physical and Virtual Memory Addresses
//!
//! Zero-cost `u64` wrappers that keep physical and virtual addresses apart at
//! compile time, plus their 4 KiB page counterparts.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] | A byte address translated through the page tables. |
//! | [`PhysicalPage`] | A 4 KiB aligned physical page, identified by its base. |
//! | [`VirtualPage`] | A 4 KiB aligned virtual page, identified by its base. |
//!
//! The memory manager works with a single page granularity of [`PAGE_SIZE`]
//! bytes. Page *indices* (`address / PAGE_SIZE`) are what the physical page
//! bitmap is keyed by:
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0000_0000_0012_3456);
//! assert_eq!(pa.page_index(), 0x123);
//! assert_eq!(pa.page_offset(), 0x456);
//! assert_eq!(PhysicalAddress::from_page_index(0x123), pa.align_down());
//!
//! let page = PhysicalPage::containing_address(pa);
//! assert_eq!(page.base().as_u64(), 0x12_3000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page;
mod physical_address;
mod virtual_address;

pub use crate::page::{PhysicalPage, VirtualPage};
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;

/// Size of a page in bytes. Fixed for all physical and heap bookkeeping.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`; the number of offset bits inside a page.
pub const PAGE_SHIFT: u32 = 12;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 8), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), 0);
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(13, 8), 16);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}

/// Number of whole pages needed to hold `bytes` bytes.
///
/// ```rust
/// # use kernel_memory_addresses::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(4096), 1);
/// assert_eq!(pages_for(4097), 2);
/// ```
#[inline(always)]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}
