//! # Kernel Boot Interface and Memory Layout
//!
//! Shared definitions between the bootloader, the kernel binary and the
//! memory-management crates:
//!
//! * [`boot`]: the `#[repr(C)]` handoff structure the loader passes to the
//!   kernel entry point (framebuffer, font, firmware memory map, RSDP).
//! * [`memory_map`]: a typed view over the firmware memory map, a packed array
//!   of descriptors walked with a loader-provided stride.
//! * [`memory`]: compile-time layout constants (higher-half kernel base, heap
//!   base, bootstrap bitmap ceiling).
//! * [`kernel_image`]: where the kernel image lives physically and virtually.
//!
//! ## Virtual Address Space Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  Identity map of physical RAM   │
//!                       │  (page 0 left unmapped)         │
//!                       ├─────────────────────────────────┤
//!                       │              ...                │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │   Kernel image (text, data)     │
//!                       ├─────────────────────────────────┤
//!                       │              ...                │
//! HEAP_VIRTUAL_BASE     ├─────────────────────────────────┤ 0xffff_ffff_ff00_0000
//!                       │   Kernel heap (grows upward)    │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Build Script Integration
//! ```rust
//! use kernel_info::memory::{KERNEL_BASE, PHYS_LOAD};
//!
//! println!("cargo:rustc-link-arg=--defsym=KERNEL_BASE={:#x}", KERNEL_BASE);
//! println!("cargo:rustc-link-arg=--defsym=PHYS_LOAD={:#x}", PHYS_LOAD);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod kernel_image;
pub mod memory;
pub mod memory_map;
