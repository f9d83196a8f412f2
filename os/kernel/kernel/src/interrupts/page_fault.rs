use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use log::error;

pub const PAGE_FAULT_VECTOR: usize = 0x0E; // 14

/// Page-fault error code pushed by the CPU (Intel SDM Vol. 3A, §6.15).
#[bitfield(u64)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool, // bit 0

    /// 0 = read or execute, 1 = write.
    pub write: bool, // bit 1

    /// 1 = the access came from CPL 3.
    pub user: bool, // bit 2

    /// A reserved bit was set in a paging structure.
    pub reserved_bit: bool, // bit 3

    pub instruction_fetch: bool, // bit 4

    /// Protection-key violation (CR4.PKE).
    pub protection_key: bool, // bit 5

    /// Shadow-stack access (CET).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page (page not mapped)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// Whether `address` lies in virtual page 0, which is never mapped.
#[must_use]
pub const fn is_null_dereference(address: VirtualAddress) -> bool {
    address.as_u64() < PAGE_SIZE
}

/// Logs the faulting address and the decoded error code.
pub fn report_page_fault(cr2: VirtualAddress, err: PageFaultError) {
    error!("PAGE FAULT: cr2={cr2} err={:#x}", err.into_bits());
    if is_null_dereference(cr2) {
        error!("null pointer dereference");
    }
    error!("{}", err.explain());
    error!("{err:?}");
}

#[cfg(target_os = "none")]
pub use handler::page_fault_handler;

#[cfg(target_os = "none")]
mod handler {
    use super::{PageFaultError, report_page_fault};
    use kernel_registers::LoadRegisterUnsafe;
    use kernel_registers::cr2::Cr2;

    /// Interrupt-gate handler: reports the fault, then halts. Never returns.
    #[unsafe(naked)]
    pub extern "C" fn page_fault_handler() {
        core::arch::naked_asm!(
            "cli",
            // The CPU pushed the error code; it sits at [rsp].
            "mov rdi, [rsp]",
            // Align the stack for the call (error code + 5 frame words = 48 bytes).
            "and rsp, -16",
            "call {report}",
            "2: hlt",
            "jmp 2b",
            report = sym report_from_handler,
        )
    }

    extern "C" fn report_from_handler(err: u64) {
        // SAFETY: runs in the page-fault handler before anything else can fault.
        let cr2 = unsafe { Cr2::load_unsafe() }.faulting_address();
        report_page_fault(cr2, PageFaultError::from_bits(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_bits_decode_in_order() {
        let err = PageFaultError::from_bits(0b10_0111);
        assert!(err.present() && err.write() && err.user());
        assert!(!err.reserved_bit() && !err.instruction_fetch());
        assert!(err.protection_key() && !err.shadow_stack());
    }

    #[test]
    fn explanations_follow_the_access_kind() {
        assert_eq!(
            PageFaultError::new().with_write(true).explain(),
            "Non-present page (page not mapped)"
        );
        assert_eq!(
            PageFaultError::new().with_present(true).with_write(true).explain(),
            "Write access to protected page"
        );
        assert_eq!(
            PageFaultError::new()
                .with_present(true)
                .with_instruction_fetch(true)
                .with_user(true)
                .explain(),
            "User-mode instruction fetch on protected page (likely NX or SMEP)"
        );
        assert_eq!(
            PageFaultError::new().with_present(true).with_reserved_bit(true).explain(),
            "Reserved bit set in a paging structure"
        );
    }

    #[test]
    fn only_page_zero_counts_as_null() {
        assert!(is_null_dereference(VirtualAddress::zero()));
        assert!(is_null_dereference(VirtualAddress::new(0x18)));
        assert!(!is_null_dereference(VirtualAddress::new(0x1000)));
    }
}
