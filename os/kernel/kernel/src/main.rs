//! # Kernel Entry Point
//!
//! The loader jumps to [`init::_start_kernel`] after `ExitBootServices`. From
//! there the bootstrap processor brings up memory management in a fixed order:
//!
//! ```text
//! logger ─► boot info ─► page-fault gate ─► PMM ─► VMM (kernel page map) ─► heap
//!        ─► global allocator
//! ```
//!
//! Any fatal error on the way is logged and the core halts.
//!
//! On the host (`cargo test`) only the pure parts are compiled: the page-fault
//! error code, the IDT layout, the allocator's alignment handling and the
//! bring-up error type.

#![cfg_attr(target_os = "none", no_std, no_main)]
#![cfg_attr(not(target_os = "none"), allow(dead_code))]
#![allow(unsafe_code)]

extern crate alloc;

mod allocator;
#[cfg(target_os = "none")]
mod init;
mod interrupts;
mod memory;
mod tracing;

use crate::allocator::KERNEL_ALLOCATOR;
use alloc::boxed::Box;
use alloc::vec::Vec;
use log::{info, warn};

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("kernel panic: {info}");
    halt()
}

#[cfg(not(target_os = "none"))]
fn main() {}

/// Runs once the global allocator is installed. Exercises the heap, then idles.
fn kernel_main() -> ! {
    info!("Kernel memory is up, exercising the heap ...");

    let small = Box::new(0x1234_5678_u64);
    let numbers: Vec<u32> = (0..8).collect();
    // Larger than the initial heap; forces one expansion.
    let large = alloc::vec![0xa5_u8; 2 * 4096];
    info!(
        "heap: box at {small:p}, {} numbers, {} bytes filled",
        numbers.len(),
        large.len()
    );
    log_memory("in use");

    drop(numbers);
    drop(small);
    drop(large);
    log_memory("after release");

    info!("Kernel early init is done, idling.");
    halt()
}

fn log_memory(stage: &str) {
    let logged = KERNEL_ALLOCATOR.with_memory(|memory| {
        info!("heap {stage}: {}", memory.heap.starchart());
        memory.heap.log_segments_summed();
        memory.pmm.log_statistics();
    });
    if logged.is_none() {
        warn!("heap {stage}: kernel allocator not available");
    }
}

/// Parks the executing core for good.
#[cfg(target_os = "none")]
fn halt() -> ! {
    loop {
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

#[cfg(not(target_os = "none"))]
fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
