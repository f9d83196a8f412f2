use core::ptr;
use kernel_memory_addresses::VirtualAddress;

/// Header preceding every heap segment's payload.
///
/// Headers form a doubly linked chain ordered by address; each segment's
/// payload is immediately followed by the next header, so the chain tiles the
/// heap without gaps.
#[repr(C)]
#[derive(Debug)]
pub(super) struct SegmentHeader {
    pub(super) last: *mut SegmentHeader,
    pub(super) next: *mut SegmentHeader,
    /// Payload bytes, not counting the header.
    pub(super) length: u64,
    pub(super) free: bool,
}

pub(super) const HEADER_BYTES: usize = size_of::<SegmentHeader>();
/// Size of a [`SegmentHeader`]; a multiple of [`ALIGN`] so payloads stay aligned.
pub const HEADER_SIZE: u64 = HEADER_BYTES as u64;
/// Allocation granularity and payload alignment.
pub const ALIGN: u64 = 8;
/// Smallest payload a split may leave behind.
pub const MIN_PAYLOAD: u64 = 8;

const _: () = assert!(HEADER_SIZE == 32);
const _: () = assert!(HEADER_SIZE % ALIGN == 0);

impl SegmentHeader {
    pub(super) const fn free(length: u64, last: *mut Self) -> Self {
        Self {
            last,
            next: ptr::null_mut(),
            length,
            free: true,
        }
    }
}

/// `bytes` past `header`, as another header pointer.
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(super) fn offset(header: *mut SegmentHeader, bytes: u64) -> *mut SegmentHeader {
    header.wrapping_byte_add(bytes as usize)
}

/// The payload belonging to `header`.
#[inline]
pub(super) fn payload(header: *mut SegmentHeader) -> *mut u8 {
    header.wrapping_byte_add(HEADER_BYTES).cast()
}

/// The header belonging to `payload`.
#[inline]
pub(super) fn header_of(payload: *mut u8) -> *mut SegmentHeader {
    payload.wrapping_byte_sub(HEADER_BYTES).cast()
}

/// A snapshot of one segment, as seen by [`Heap::segments`](super::Heap::segments).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Segment {
    /// Address of the header.
    pub header: VirtualAddress,
    /// Payload bytes.
    pub length: u64,
    pub free: bool,
}

impl Segment {
    #[must_use]
    pub const fn payload(&self) -> VirtualAddress {
        VirtualAddress::new(self.header.as_u64() + HEADER_SIZE)
    }

    /// Header plus payload.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.length + HEADER_SIZE
    }

    /// One past the last payload byte, i.e. where the next header starts.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.header.as_u64() + self.total_size())
    }
}
