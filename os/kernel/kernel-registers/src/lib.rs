//! # Typed `x86_64` Paging Registers
//!
//! Bit-exact views of the control registers the memory manager touches:
//!
//! * [`cr3::Cr3`] holds the physical base of the active top-level page table.
//! * [`cr2::Cr2`] holds the linear address of the last page fault.
//! * [`tlb`] invalidates single translations after a mapping changed.
//!
//! The actual `mov` instructions are compiled in with the `asm` feature only,
//! so host-side tests can use the layouts without privileged code.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr2;
pub mod cr3;
#[cfg(feature = "asm")]
pub mod tlb;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The register access is privileged and requires kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The register access is privileged and requires kernel mode (Ring 0).
    /// Writing a paging register changes how every following memory access is
    /// translated; the caller must make sure the executing code stays mapped.
    unsafe fn store_unsafe(self);
}
