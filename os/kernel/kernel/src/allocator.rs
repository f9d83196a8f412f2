//! # Kernel Global Allocator
//!
//! Routes `alloc` (`Box`, `Vec`, ...) to the segment heap once memory
//! bring-up has handed over [`KernelMemory`].
//!
//! - Before [`KernelAllocator::install`] every allocation fails with a null
//!   pointer.
//! - The heap aligns payloads to [`ALIGN`] bytes. Stricter alignments are
//!   served from a block padded by `align` bytes; the block's address is kept
//!   in the word right before the aligned pointer.
//! - Heap errors turn into null, which `alloc` reports as an allocation error.
//!
//! ## Constraints
//! There is no lock. The kernel runs on a single core and never allocates from
//! interrupt context; a reentrant call (an allocation while the heap is being
//! worked on) is refused with a null pointer instead of aliasing the heap.

use crate::memory::KernelMemory;
use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr::{NonNull, null_mut};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_alloc::heap::ALIGN;
use log::{error, warn};

#[allow(clippy::cast_possible_truncation)]
const HEAP_ALIGN: usize = ALIGN as usize;

/// The kernel's global allocator.
#[cfg_attr(target_os = "none", global_allocator)]
pub static KERNEL_ALLOCATOR: KernelAllocator = KernelAllocator::new();

pub struct KernelAllocator {
    busy: AtomicBool,
    memory: UnsafeCell<Option<KernelMemory>>,
}

// SAFETY: single core; `busy` admits one user of `memory` at a time.
unsafe impl Sync for KernelAllocator {}

impl KernelAllocator {
    const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            memory: UnsafeCell::new(None),
        }
    }

    /// Takes over the memory managers. Returns `false`, dropping `memory`, if
    /// an earlier call already installed them.
    #[must_use]
    pub fn install(&self, memory: KernelMemory) -> bool {
        self.with_slot(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(memory);
            true
        })
        .unwrap_or(false)
    }

    /// Runs `f` on the installed memory managers.
    ///
    /// `None` if nothing is installed yet or the allocator is already in use
    /// further up the stack.
    #[must_use]
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut KernelMemory) -> R) -> Option<R> {
        self.with_slot(|slot| slot.as_mut().map(f)).flatten()
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut Option<KernelMemory>) -> R) -> Option<R> {
        if self.busy.swap(true, Ordering::Acquire) {
            warn!("kernel allocator re-entered, refusing");
            return None;
        }
        // SAFETY: `busy` was clear, so no other reference to the slot exists.
        let result = f(unsafe { &mut *self.memory.get() });
        self.busy.store(false, Ordering::Release);
        Some(result)
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(size) = padded_size(layout) else {
            return null_mut();
        };
        match self.with_memory(|memory| memory.allocate(size)) {
            Some(Ok(block)) => unsafe { align_block(block, layout.align()) },
            Some(Err(e)) => {
                error!("kernel allocator: {layout:?} failed: {e} (fatal: {})", e.is_fatal());
                null_mut()
            }
            None => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let block = unsafe { block_of(ptr, layout.align()) };
        if self
            .with_memory(|memory| unsafe { memory.free(block) })
            .is_none()
        {
            warn!("kernel allocator: leaking {layout:?} at {ptr:p}");
        }
    }
}

/// Heap bytes needed to serve `layout`.
fn padded_size(layout: Layout) -> Option<u64> {
    let size = if layout.align() > HEAP_ALIGN {
        layout.size().checked_add(layout.align())?
    } else {
        layout.size()
    };
    u64::try_from(size).ok()
}

/// The pointer handed out for `block`, aligned to `align`.
///
/// # Safety
/// `block` must span [`padded_size`] bytes of a layout with this alignment.
#[allow(clippy::cast_ptr_alignment)]
unsafe fn align_block(block: NonNull<u8>, align: usize) -> *mut u8 {
    if align <= HEAP_ALIGN {
        return block.as_ptr();
    }
    let address = block.as_ptr().addr();
    let offset = (address + size_of::<usize>()).next_multiple_of(align) - address;
    unsafe {
        let aligned = block.as_ptr().add(offset);
        aligned.cast::<*mut u8>().sub(1).write(block.as_ptr());
        aligned
    }
}

/// The heap block behind a pointer returned by [`align_block`].
///
/// # Safety
/// `ptr` must come from [`align_block`] with the same `align`.
#[allow(clippy::cast_ptr_alignment)]
unsafe fn block_of(ptr: NonNull<u8>, align: usize) -> NonNull<u8> {
    if align <= HEAP_ALIGN {
        return ptr;
    }
    unsafe { NonNull::new_unchecked(ptr.as_ptr().cast::<*mut u8>().sub(1).read()) }
}
