//! # Kernel Memory Management
//!
//! Turns the firmware memory map into memory the rest of the kernel can use:
//! physical page allocation, the kernel's own page map, and a dynamic heap.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Heap ([`heap`])                  │
//! │    • First-fit segments in a fixed virtual window   │
//! │    • Grows page by page through the VMM             │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ map_active
//! ┌─────────────────▼───────────────────────────────────┐
//! │        Virtual Memory Manager ([`vmm`])             │
//! │    • Active page map (CR3) and TLB invalidation     │
//! │    • Identity map of RAM + higher-half kernel       │
//! │    • Page map cloning                               │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ page tables
//! ┌─────────────────▼───────────────────────────────────┐
//! │      Physical Memory Manager ([`pmm`])              │
//! │    • One bit per 4 KiB page ([`bitmap`])            │
//! │    • Two-phase bring-up from the firmware map       │
//! │    • Single pages and contiguous runs               │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The page table walking itself lives in `kernel-vmem`; this crate decides
//! where tables come from ([`pmm::PhysicalMemoryManager`] implements
//! `PageTableSource`) and how physical memory is reached
//! ([`phys_mapper::IdentityPhysMapper`]).
//!
//! ## Bring-up order
//!
//! 1. [`pmm::PhysicalMemoryManager::init`] with a static bootstrap buffer,
//! 2. [`vmm::Vmm::init_virtual_with_new_root`],
//! 3. [`heap::Heap::init`] on `HEAP_VIRTUAL_BASE..HEAP_VIRTUAL_END` through a
//!    [`heap::VmmHeapPager`].
//!
//! Nothing here is synchronised. All state lives in values owned by the
//! kernel's entry code and is passed around by `&mut`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod bitmap;
pub mod heap;
pub mod phys_mapper;
pub mod pmm;
pub mod vmm;
