//! [`PhysMapper`] for a kernel that identity-maps all of physical RAM.
//!
//! Until the kernel's own tables are active this relies on the loader's
//! identity map of low memory, afterwards on `Vmm::init_virtual`, which maps
//! every physical page at the same virtual address.

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// Physical address `pa` is accessed at virtual address `pa`.
#[derive(Debug, Default, Copy, Clone)]
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    #[inline]
    fn phys_to_ptr<T>(&self, pa: PhysicalAddress) -> *mut T {
        core::ptr::with_exposed_provenance_mut(usize::try_from(pa.as_u64()).unwrap_or(usize::MAX))
    }
}
