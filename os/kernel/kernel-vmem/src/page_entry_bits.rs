use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// A single 64-bit x86-64 page table entry.
///
/// The same layout is used on all four levels (PML4E, PDPTE, PDE, PTE). An
/// entry either links to the next-level [`PageTable`](crate::PageTable) or,
/// on the last level (or with `large_page` set on levels 3 and 2), maps a
/// physical page directly.
///
/// ### Bit layout
///
/// | Bits  | Field             | Meaning |
/// |-------|-------------------|---------|
/// | 0     | `present`         | Entry is valid |
/// | 1     | `read_write`      | Writes allowed |
/// | 2     | `user_accessible` | Ring 3 may access |
/// | 3     | `write_through`   | Write-through caching |
/// | 4     | `cache_disabled`  | Caching disabled |
/// | 5     | `accessed`        | Set by the CPU on access |
/// | 6     | `dirty`           | Set by the CPU on write (leaf only) |
/// | 7     | `large_page`      | 2 MiB / 1 GiB leaf (PS) |
/// | 8     | `global`          | Survives CR3 reloads (leaf only) |
/// | 9–11  | `available_low`   | Ignored by hardware |
/// | 12–51 | address           | Physical page base `>> 12` |
/// | 52–62 | `available_high`  | Ignored by hardware |
/// | 63    | `no_execute`      | Instruction fetches fault (NX) |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::new()
///     .with_present(true)
///     .with_read_write(true)
///     .with_physical_address(PhysicalAddress::new(0x0012_3000));
/// assert_eq!(e.into_bits(), 0x0012_3003);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    pub present: bool,
    pub read_write: bool,
    pub user_accessible: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,

    #[bits(3)]
    pub available_low: u8,

    /// Physical address bits `[51:12]`.
    #[bits(40)]
    address_bits: u64,

    #[bits(11)]
    pub available_high: u16,

    pub no_execute: bool,
}

/// Named single-bit masks into a [`PageEntryBits`] word.
///
/// Handy where flags are combined at run time rather than through the
/// `with_*` builders.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum PageTableFlag {
    Present = 0,
    ReadWrite = 1,
    UserAccessible = 2,
    WriteThrough = 3,
    CacheDisabled = 4,
    Accessed = 5,
    Dirty = 6,
    LargePage = 7,
    Global = 8,
    NoExecute = 63,
}

impl PageTableFlag {
    #[inline]
    #[must_use]
    pub const fn mask(self) -> u64 {
        1 << self as u8
    }
}

impl PageEntryBits {
    /// Mask of the packed address field.
    pub const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

    /// Flags of a kernel-only, writable mapping.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_read_write(true)
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.address_bits() << 12)
    }

    /// Stores `pa`'s page bits; offset bits are dropped, flags stay untouched.
    #[inline]
    pub const fn set_physical_address(&mut self, pa: PhysicalAddress) {
        self.set_address_bits(pa.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        self.with_address_bits(pa.as_u64() >> 12)
    }

    #[inline]
    #[must_use]
    pub const fn flag(&self, flag: PageTableFlag) -> bool {
        self.into_bits() & flag.mask() != 0
    }

    #[inline]
    pub const fn set_flag(&mut self, flag: PageTableFlag, enabled: bool) {
        let bits = self.into_bits() & !flag.mask();
        *self = Self::from_bits(if enabled { bits | flag.mask() } else { bits });
    }

    /// All flag bits with the address field cleared.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> Self {
        Self::from_bits(self.into_bits() & !Self::ADDRESS_MASK)
    }

    /// The next-level table this entry links to, if it is a present non-leaf entry.
    ///
    /// Must not be called on last-level entries, where every present entry is a leaf.
    #[inline]
    #[must_use]
    pub const fn next_table(&self) -> Option<PhysicalPage> {
        if self.present() && !self.large_page() {
            Some(PhysicalPage::containing_address(self.physical_address()))
        } else {
            None
        }
    }
}
