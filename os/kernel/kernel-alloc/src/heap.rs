//! # Kernel Heap
//!
//! A first-fit segment allocator living in a fixed virtual window. Every
//! allocation is preceded by a segment header; the headers are chained in
//! address order and together cover `[start, end)` exactly:
//!
//! ```text
//!  start                                                        end
//!    │ hdr │ payload (used) │ hdr │ payload (free)   │ hdr │ ... │
//!    └──────────────────────┴─────────────────────────┴───────────┘
//! ```
//!
//! - Requests are rounded up to [`ALIGN`] bytes; a larger free segment is
//!   split unless the remainder could not hold a header plus [`MIN_PAYLOAD`],
//!   in which case the caller gets the whole (oversized) segment.
//! - Freed segments are merged with free neighbours right away, so no two
//!   adjacent segments are ever both free.
//! - When nothing fits, the heap grows by whole pages past `end` through a
//!   [`HeapPager`] and the search is repeated once. Pages are never returned.
//! - Growth never passes the window limit given to [`Heap::init`].
//!
//! The heap is not synchronised; its owner provides exclusive access.

mod debug;
mod segment;

pub use self::debug::Starchart;
pub use self::segment::{ALIGN, HEADER_SIZE, MIN_PAYLOAD, Segment};

use self::segment::{SegmentHeader, header_of, offset, payload};
use crate::pmm::{PhysicalMemoryManager, PmmError};
use crate::vmm::{PagingControl, Vmm, VmmError};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::{PageEntryBits, PhysMapper};
use log::{debug, info, trace};
use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum HeapError {
    #[error("zero-sized heap request")]
    ZeroSized,
    #[error("no physical page to back the heap: {0}")]
    Backing(#[source] PmmError),
    #[error("cannot map a heap page: {0}")]
    Map(#[source] VmmError),
    #[error("{requested} bytes do not fit even after growing the heap")]
    Exhausted { requested: u64 },
    #[error("{pages} more pages do not fit into the heap's virtual window")]
    WindowExhausted { pages: u64 },
}

impl HeapError {
    /// Only a zero-sized request is the caller's problem; running out of
    /// backing memory leaves the kernel without a heap.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::ZeroSized)
    }
}

/// Provides backing memory for heap pages.
pub trait HeapPager {
    /// Makes the 4 KiB page at `va` writable memory.
    ///
    /// # Errors
    /// Any error is fatal to the heap.
    fn map_page(&mut self, va: VirtualAddress) -> Result<(), HeapError>;
}

/// Backs heap pages with pages from the PMM, mapped into the active page map
/// as kernel-only, writable and global.
pub struct VmmHeapPager<'a, 'b, 'm, M: PhysMapper, R: PagingControl> {
    pmm: &'a mut PhysicalMemoryManager<'b>,
    vmm: &'a mut Vmm<'m, M, R>,
}

impl<'a, 'b, 'm, M: PhysMapper, R: PagingControl> VmmHeapPager<'a, 'b, 'm, M, R> {
    pub const fn new(pmm: &'a mut PhysicalMemoryManager<'b>, vmm: &'a mut Vmm<'m, M, R>) -> Self {
        Self { pmm, vmm }
    }
}

impl<M: PhysMapper, R: PagingControl> HeapPager for VmmHeapPager<'_, '_, '_, M, R> {
    fn map_page(&mut self, va: VirtualAddress) -> Result<(), HeapError> {
        let page = self.pmm.request_page().map_err(HeapError::Backing)?;
        let flags = PageEntryBits::kernel_rw().with_global(true);
        if let Err(e) = self.vmm.map_active(&mut *self.pmm, va, page.base(), flags) {
            self.pmm.free_page(page.base());
            return Err(HeapError::Map(e));
        }
        Ok(())
    }
}

pub struct Heap {
    start: VirtualAddress,
    end: VirtualAddress,
    /// End of the virtual window; `end` never passes it.
    limit: VirtualAddress,
    /// End of the pages mapped so far. Ahead of `end` only after a failed growth.
    mapped: VirtualAddress,
    /// Tail of the segment chain.
    last: *mut SegmentHeader,
}

impl Heap {
    /// Maps `pages` pages at `base` and covers them with one free segment.
    /// The heap may later grow up to, but not past, `limit`.
    ///
    /// # Errors
    /// - [`HeapError::ZeroSized`] for `pages == 0`.
    /// - [`HeapError::WindowExhausted`] if the pages do not fit below `limit`.
    /// - Otherwise whatever `pager` reports.
    ///
    /// # Safety
    /// The virtual range `base..limit` must be reserved for this heap.
    /// `pager` must make each page it maps writable.
    pub unsafe fn init<P: HeapPager + ?Sized>(
        base: VirtualAddress,
        limit: VirtualAddress,
        pages: u64,
        pager: &mut P,
    ) -> Result<Self, HeapError> {
        debug_assert!(base.is_page_aligned() && limit.is_page_aligned());
        if pages == 0 {
            return Err(HeapError::ZeroSized);
        }

        let end = window_end(base, pages, limit)?;
        let mut mapped = base;
        while mapped < end {
            pager.map_page(mapped)?;
            mapped += PAGE_SIZE;
        }

        let first = base.as_mut_ptr::<SegmentHeader>();
        // SAFETY: freshly mapped, exclusively owned and page aligned.
        unsafe { first.write(SegmentHeader::free(pages * PAGE_SIZE - HEADER_SIZE, ptr::null_mut())) };

        info!("heap: {pages} pages at {base}");
        Ok(Self {
            start: base,
            end,
            limit,
            mapped,
            last: first,
        })
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    /// Bytes between start and end, headers included.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    fn first(&self) -> *mut SegmentHeader {
        self.start.as_mut_ptr()
    }

    /// Asserts (in debug builds) that a whole header at `header` lies inside the heap.
    #[inline]
    fn checked(&self, header: *mut SegmentHeader) -> *mut SegmentHeader {
        debug_assert!(
            VirtualAddress::from_ptr(header) >= self.start
                && VirtualAddress::from_ptr(header).as_u64() + HEADER_SIZE <= self.end.as_u64(),
            "segment header {header:p} outside heap {}..{}",
            self.start,
            self.end
        );
        header
    }

    /// Walks the segment chain from the start.
    #[must_use]
    pub fn segments(&self) -> Segments<'_> {
        Segments {
            current: self.first().cast_const(),
            _heap: PhantomData,
        }
    }

    /// Allocates `size` bytes, 8-byte aligned, growing the heap once if needed.
    ///
    /// # Errors
    /// - [`HeapError::ZeroSized`] for `size == 0`.
    /// - Any pager error while growing (fatal).
    pub fn allocate<P: HeapPager + ?Sized>(
        &mut self,
        size: u64,
        pager: &mut P,
    ) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSized);
        }
        let size = size
            .checked_next_multiple_of(ALIGN)
            .ok_or(HeapError::Exhausted { requested: size })?;

        if let Some(p) = self.first_fit(size) {
            return Ok(p);
        }

        debug!("heap: nothing fits {size} bytes, growing");
        self.expand(size, pager)?;
        self.first_fit(size)
            .ok_or(HeapError::Exhausted { requested: size })
    }

    fn first_fit(&mut self, size: u64) -> Option<NonNull<u8>> {
        let mut current = self.first();
        while !current.is_null() {
            let header = self.checked(current);
            // SAFETY: every pointer on the chain is a live header inside the heap.
            let (free, length, next) = unsafe { ((*header).free, (*header).length, (*header).next) };

            if free && length >= size {
                // SAFETY: as above.
                if length > size && !unsafe { self.split(header, size) } {
                    trace!("heap: handing out {length} bytes for {size}");
                }
                unsafe { (*header).free = false };
                return NonNull::new(payload(header));
            }
            current = next;
        }
        None
    }

    /// Grows the heap by enough whole pages to hold a `size`-byte segment.
    ///
    /// The new pages form one free segment at the tail, merged into the
    /// previous tail if that one is free.
    ///
    /// # Errors
    /// - [`HeapError::WindowExhausted`] if the heap would pass its limit;
    ///   nothing is mapped then.
    /// - Whatever `pager` reports. Pages mapped before the failure stay mapped
    ///   and are reused by the next growth; the heap itself is unchanged.
    pub fn expand<P: HeapPager + ?Sized>(
        &mut self,
        size: u64,
        pager: &mut P,
    ) -> Result<(), HeapError> {
        let pages = size.saturating_add(HEADER_SIZE).div_ceil(PAGE_SIZE);
        let end = window_end(self.end, pages, self.limit)?;

        while self.mapped < end {
            pager.map_page(self.mapped)?;
            self.mapped += PAGE_SIZE;
        }

        let extension = self.end.as_mut_ptr::<SegmentHeader>();
        // SAFETY: the extension was just mapped and `last` is the live tail.
        unsafe {
            extension.write(SegmentHeader::free(pages * PAGE_SIZE - HEADER_SIZE, self.last));
            (*self.last).next = extension;
        }
        self.last = extension;
        self.end = end;

        // SAFETY: `extension` is now part of the chain.
        unsafe { self.combine_backward(extension) };
        debug!("heap: grown by {pages} pages to {}", self.end);
        Ok(())
    }

    /// Returns an allocation to the heap and merges it with free neighbours.
    ///
    /// # Safety
    /// `allocation` must come from [`allocate`](Self::allocate) on this heap
    /// and must not have been freed since.
    pub unsafe fn free(&mut self, allocation: NonNull<u8>) {
        let header = self.checked(header_of(allocation.as_ptr()));
        unsafe {
            debug_assert!(!(*header).free, "double free of {allocation:p}");
            (*header).free = true;
            self.combine_forward(header);
            self.combine_backward(header);
        }
    }

    /// Shrinks the segment at `header` to `length` payload bytes and turns the
    /// rest into a new segment in the same state.
    ///
    /// Returns `false`, changing nothing, if the rest could not hold a header
    /// and [`MIN_PAYLOAD`] bytes.
    ///
    /// # Safety
    /// `header` must be a segment of this heap.
    unsafe fn split(&mut self, header: *mut SegmentHeader, length: u64) -> bool {
        debug_assert!(length % ALIGN == 0);
        let (total, next, free) = unsafe { ((*header).length, (*header).next, (*header).free) };
        if length < MIN_PAYLOAD || length.saturating_add(HEADER_SIZE + MIN_PAYLOAD) > total {
            return false;
        }

        let tail = self.checked(offset(header, HEADER_SIZE + length));
        unsafe {
            tail.write(SegmentHeader {
                last: header,
                next,
                length: total - length - HEADER_SIZE,
                free,
            });
            if next.is_null() {
                self.last = tail;
            } else {
                (*next).last = tail;
            }
            (*header).next = tail;
            (*header).length = length;
        }
        true
    }

    /// Absorbs the following segment if it is free.
    ///
    /// # Safety
    /// `header` must be a segment of this heap.
    unsafe fn combine_forward(&mut self, header: *mut SegmentHeader) -> bool {
        let next = unsafe { (*header).next };
        if next.is_null() || !unsafe { (*next).free } {
            return false;
        }

        unsafe {
            let (after, absorbed) = ((*next).next, (*next).length);
            if after.is_null() {
                self.last = header;
            } else {
                (*after).last = header;
            }
            (*header).next = after;
            (*header).length += absorbed + HEADER_SIZE;
        }
        true
    }

    /// Lets the preceding segment absorb this one if the preceding one is free.
    ///
    /// # Safety
    /// `header` must be a segment of this heap.
    unsafe fn combine_backward(&mut self, header: *mut SegmentHeader) -> bool {
        let last = unsafe { (*header).last };
        if last.is_null() || !unsafe { (*last).free } {
            return false;
        }
        unsafe { self.combine_forward(last) }
    }
}

/// `from` plus `pages` pages, if that stays within `limit`.
fn window_end(from: VirtualAddress, pages: u64, limit: VirtualAddress) -> Result<VirtualAddress, HeapError> {
    pages
        .checked_mul(PAGE_SIZE)
        .and_then(|bytes| from.as_u64().checked_add(bytes))
        .filter(|&end| end <= limit.as_u64())
        .map(VirtualAddress::new)
        .ok_or(HeapError::WindowExhausted { pages })
}

impl core::fmt::Debug for Heap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("limit", &self.limit)
            .field("segments", &self.segments().count())
            .finish()
    }
}

/// Iterator over [`Heap::segments`].
pub struct Segments<'h> {
    current: *const SegmentHeader,
    _heap: PhantomData<&'h Heap>,
}

impl Iterator for Segments<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.current.is_null() {
            return None;
        }
        // SAFETY: the chain is live for as long as the heap is borrowed.
        let header = unsafe { &*self.current };
        let segment = Segment {
            header: VirtualAddress::from_ptr(self.current),
            length: header.length,
            free: header.free,
        };
        self.current = header.next;
        Some(segment)
    }
}
