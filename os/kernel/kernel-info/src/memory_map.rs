//! # Firmware Memory Map
//!
//! The loader hands the kernel the raw UEFI memory map: a byte buffer holding
//! `map_size / descriptor_size` descriptors, each starting `descriptor_size`
//! bytes after the previous one. The stride is usually larger than the
//! descriptor itself (firmware may append fields), so the map must never be
//! indexed as a plain array.
//!
//! ```text
//! offset  size  field
//!      0     4  type
//!      4     4  (padding)
//!      8     8  physical start
//!     16     8  virtual start
//!     24     8  number of 4 KiB pages
//!     32     8  attribute flags
//! ```

use core::fmt;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Region classification reported by the firmware.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum MemoryType {
    Reserved = 0,
    LoaderCode = 1,
    LoaderData = 2,
    BootServicesCode = 3,
    BootServicesData = 4,
    RuntimeServicesCode = 5,
    RuntimeServicesData = 6,
    /// Usable RAM. The only type the physical memory manager frees at boot.
    Conventional = 7,
    Unusable = 8,
    AcpiReclaim = 9,
    AcpiNvs = 10,
    MemoryMappedIo = 11,
    MemoryMappedIoPortSpace = 12,
    PalCode = 13,
}

impl MemoryType {
    /// Number of recognised types.
    pub const COUNT: usize = 14;

    /// All recognised types, ordered by their raw value.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Reserved,
        Self::LoaderCode,
        Self::LoaderData,
        Self::BootServicesCode,
        Self::BootServicesData,
        Self::RuntimeServicesCode,
        Self::RuntimeServicesData,
        Self::Conventional,
        Self::Unusable,
        Self::AcpiReclaim,
        Self::AcpiNvs,
        Self::MemoryMappedIo,
        Self::MemoryMappedIoPortSpace,
        Self::PalCode,
    ];

    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        if (raw as usize) < Self::COUNT {
            Some(Self::ALL[raw as usize])
        } else {
            None
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// The firmware specification name of this type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Reserved => "EfiReservedMemoryType",
            Self::LoaderCode => "EfiLoaderCode",
            Self::LoaderData => "EfiLoaderData",
            Self::BootServicesCode => "EfiBootServicesCode",
            Self::BootServicesData => "EfiBootServicesData",
            Self::RuntimeServicesCode => "EfiRuntimeServicesCode",
            Self::RuntimeServicesData => "EfiRuntimeServicesData",
            Self::Conventional => "EfiConventionalMemory",
            Self::Unusable => "EfiUnusableMemory",
            Self::AcpiReclaim => "EfiACPIReclaimMemory",
            Self::AcpiNvs => "EfiACPIMemoryNVS",
            Self::MemoryMappedIo => "EfiMemoryMappedIO",
            Self::MemoryMappedIoPortSpace => "EfiMemoryMappedIOPortSpace",
            Self::PalCode => "EfiPalCode",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One firmware memory-map entry, decoded.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryDescriptor {
    /// Raw type value; may lie outside the recognised range.
    pub ty: u32,
    pub physical_start: PhysicalAddress,
    pub virtual_start: u64,
    /// Region length in 4 KiB pages.
    pub page_count: u64,
    pub attribute: u64,
}

impl MemoryDescriptor {
    /// Size of the encoded descriptor in bytes. Strides are at least this large.
    pub const ENCODED_SIZE: usize = 40;

    #[must_use]
    pub const fn new(ty: MemoryType, physical_start: PhysicalAddress, page_count: u64) -> Self {
        Self {
            ty: ty.as_raw(),
            physical_start,
            virtual_start: 0,
            page_count,
            attribute: 0,
        }
    }

    #[must_use]
    pub const fn memory_type(&self) -> Option<MemoryType> {
        MemoryType::from_raw(self.ty)
    }

    /// Whether the region is free for the kernel to use once booted.
    #[must_use]
    pub const fn is_conventional(&self) -> bool {
        self.ty == MemoryType::Conventional.as_raw()
    }

    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.page_count * PAGE_SIZE
    }

    /// One past the last physical byte of the region.
    #[must_use]
    pub const fn physical_end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.physical_start.as_u64() + self.size_bytes())
    }

    /// Decodes a descriptor from the first [`ENCODED_SIZE`](Self::ENCODED_SIZE) bytes of `bytes`.
    ///
    /// Returns `None` if `bytes` is too short.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::ENCODED_SIZE)?;
        let u32_at = |at: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(raw)
        };
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Some(Self {
            ty: u32_at(0),
            physical_start: PhysicalAddress::new(u64_at(8)),
            virtual_start: u64_at(16),
            page_count: u64_at(24),
            attribute: u64_at(32),
        })
    }

    /// Encodes the descriptor into the first [`ENCODED_SIZE`](Self::ENCODED_SIZE) bytes of `out`.
    ///
    /// Padding bytes are written as zero. Returns `false` if `out` is too short.
    pub fn encode(&self, out: &mut [u8]) -> bool {
        let Some(out) = out.get_mut(..Self::ENCODED_SIZE) else {
            return false;
        };
        out[0..4].copy_from_slice(&self.ty.to_le_bytes());
        out[4..8].fill(0);
        out[8..16].copy_from_slice(&self.physical_start.as_u64().to_le_bytes());
        out[16..24].copy_from_slice(&self.virtual_start.to_le_bytes());
        out[24..32].copy_from_slice(&self.page_count.to_le_bytes());
        out[32..40].copy_from_slice(&self.attribute.to_le_bytes());
        true
    }
}

/// A view over a raw firmware memory map.
#[derive(Copy, Clone)]
pub struct MemoryMap<'a> {
    bytes: &'a [u8],
    descriptor_size: usize,
}

impl<'a> MemoryMap<'a> {
    /// Views `bytes` as a memory map with the given descriptor stride.
    ///
    /// Trailing bytes that do not form a whole descriptor are ignored.
    #[must_use]
    pub const fn new(bytes: &'a [u8], descriptor_size: usize) -> Self {
        debug_assert!(descriptor_size >= MemoryDescriptor::ENCODED_SIZE);
        Self {
            bytes,
            descriptor_size,
        }
    }

    /// Views the memory map the loader left at `ptr`.
    ///
    /// # Safety
    /// `ptr..ptr + map_size` must be readable and stay untouched for `'a`.
    #[allow(unsafe_code)]
    #[must_use]
    pub const unsafe fn from_raw(ptr: *const u8, map_size: usize, descriptor_size: usize) -> Self {
        let bytes = unsafe { core::slice::from_raw_parts(ptr, map_size) };
        Self::new(bytes, descriptor_size)
    }

    /// The stride between consecutive descriptors in bytes.
    #[must_use]
    pub const fn descriptor_size(&self) -> usize {
        self.descriptor_size
    }

    /// Number of descriptors in the map.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len() / self.descriptor_size
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates the descriptors in firmware order.
    pub fn iter(&self) -> impl Iterator<Item = MemoryDescriptor> + use<'a> {
        self.bytes
            .chunks_exact(self.descriptor_size)
            .filter_map(MemoryDescriptor::decode)
    }

    /// Sum of the page counts of all descriptors, regardless of type.
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.iter().map(|d| d.page_count).sum()
    }

    /// Page counts summed per recognised type, indexed by raw type value.
    /// Descriptors of unknown type are skipped.
    #[must_use]
    pub fn pages_by_type(&self) -> [u64; MemoryType::COUNT] {
        let mut sums = [0; MemoryType::COUNT];
        for desc in self.iter() {
            if let Some(ty) = desc.memory_type() {
                sums[ty as usize] += desc.page_count;
            }
        }
        sums
    }
}

impl fmt::Debug for MemoryMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_map(descriptors: &[MemoryDescriptor], stride: usize) -> Vec<u8> {
        let mut bytes = vec![0xAA; descriptors.len() * stride];
        for (chunk, desc) in bytes.chunks_exact_mut(stride).zip(descriptors) {
            assert!(desc.encode(chunk));
        }
        bytes
    }

    #[test]
    fn walks_with_stride_larger_than_descriptor() {
        let descriptors = [
            MemoryDescriptor::new(MemoryType::LoaderCode, PhysicalAddress::new(0), 10),
            MemoryDescriptor::new(MemoryType::Conventional, PhysicalAddress::new(0xA000), 100),
        ];
        let bytes = encode_map(&descriptors, 48);
        let map = MemoryMap::new(&bytes, 48);

        assert_eq!(map.len(), 2);
        let decoded: Vec<_> = map.iter().collect();
        assert_eq!(decoded, descriptors);
        assert_eq!(map.total_pages(), 110);
    }

    #[test]
    fn sums_per_type_and_skips_unknown() {
        let mut odd = MemoryDescriptor::new(MemoryType::Reserved, PhysicalAddress::new(0x10_0000), 3);
        odd.ty = 42;
        let descriptors = [
            MemoryDescriptor::new(MemoryType::Conventional, PhysicalAddress::new(0), 5),
            MemoryDescriptor::new(MemoryType::Conventional, PhysicalAddress::new(0x8000), 7),
            MemoryDescriptor::new(MemoryType::AcpiReclaim, PhysicalAddress::new(0xF000), 2),
            odd,
        ];
        let bytes = encode_map(&descriptors, MemoryDescriptor::ENCODED_SIZE);
        let map = MemoryMap::new(&bytes, MemoryDescriptor::ENCODED_SIZE);

        let sums = map.pages_by_type();
        assert_eq!(sums[MemoryType::Conventional as usize], 12);
        assert_eq!(sums[MemoryType::AcpiReclaim as usize], 2);
        assert_eq!(sums.iter().sum::<u64>(), 14);
        assert_eq!(map.total_pages(), 17);
        assert_eq!(map.iter().last().and_then(|d| d.memory_type()), None);
    }

    #[test]
    fn type_names_follow_firmware_naming() {
        assert_eq!(MemoryType::from_raw(7), Some(MemoryType::Conventional));
        assert_eq!(MemoryType::Conventional.name(), "EfiConventionalMemory");
        assert_eq!(MemoryType::from_raw(13).map(MemoryType::name), Some("EfiPalCode"));
        assert_eq!(MemoryType::from_raw(14), None);
    }

    #[test]
    fn trailing_partial_descriptor_is_ignored() {
        let descriptors = [MemoryDescriptor::new(MemoryType::Conventional, PhysicalAddress::new(0), 1)];
        let mut bytes = encode_map(&descriptors, 48);
        bytes.extend_from_slice(&[0; 20]);
        let map = MemoryMap::new(&bytes, 48);
        assert_eq!(map.len(), 1);
        assert_eq!(map.iter().count(), 1);
    }
}
