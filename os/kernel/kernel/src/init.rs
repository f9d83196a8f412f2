use crate::allocator::KERNEL_ALLOCATOR;
use crate::interrupts::Idt;
use crate::interrupts::page_fault::{PAGE_FAULT_VECTOR, page_fault_handler};
use crate::memory::init_memory;
use crate::tracing::trace_boot_info;
use crate::{halt, kernel_main};
use kernel_info::boot::KernelBootInfo;
use kernel_info::memory::KERNEL_STACK_SIZE;
use kernel_qemu::QemuLogger;
use log::{LevelFilter, error, info};

/// A byte buffer with a guaranteed 16-byte alignment, as the SysV ABI wants
/// for `RSP` at call boundaries.
#[repr(align(16))]
struct Aligned16<const N: usize>([u8; N]);

/// Stack of the bootstrap processor. The kernel never leaves it.
///
/// Lives in `.bss.boot` so the linker script keeps it inside the image, which
/// the kernel page map covers.
#[unsafe(link_section = ".bss.boot")]
#[unsafe(no_mangle)]
static mut BOOT_STACK: Aligned16<KERNEL_STACK_SIZE> = Aligned16([0; KERNEL_STACK_SIZE]);

static mut IDT: Idt = Idt::new();

/// The kernel entry point
///
/// # UEFI Interaction
/// The UEFI loader will jump here after `ExitBootServices`.
///
/// # ABI
/// `sysv64` (Rust's `extern "C"`): the `boot_info` pointer arrives in `RDI`.
///
/// # Naked function & Stack
/// Naked so that no prologue touches the loader's stack before we replace it
/// with [`BOOT_STACK`].
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub extern "C" fn _start_kernel(_boot_info: *const KernelBootInfo) {
    core::arch::naked_asm!(
        "cli",
        // save RDI (boot_info per SysV64)
        "mov r12, rdi",
        "lea rax, [rip + {stack_sym}]",
        "add rax, {stack_size}",
        "and rax, -16",
        "mov rsp, rax",
        // Emulate a CALL by pushing a dummy return address (so RSP % 16 == 8 at entry)
        "push 0",
        "xor rbp, rbp",
        "mov rdi, r12",
        "jmp {rust_entry}",
        stack_sym = sym BOOT_STACK,
        stack_size = const KERNEL_STACK_SIZE,
        rust_entry = sym kernel_entry_on_boot_stack,
    );
}

/// Kernel entry running on [`BOOT_STACK`].
#[unsafe(no_mangle)]
pub extern "C" fn kernel_entry_on_boot_stack(boot_info: *const KernelBootInfo) -> ! {
    // Without a logger the kernel still runs, it just stays silent.
    let _ = QemuLogger::new(LevelFilter::Debug).init();

    info!("Kernel reporting to QEMU! Bringing up memory management ...");
    let bi = unsafe { &*boot_info };
    trace_boot_info(bi);

    info!("Installing page fault handler ...");
    install_page_fault_gate();

    let memory = match unsafe { init_memory(bi) } {
        Ok(memory) => memory,
        Err(e) => {
            error!("memory bring-up failed: {e}");
            if e.is_fatal() {
                error!("error is fatal, halting");
            } else {
                error!("kernel cannot continue without memory management, halting");
            }
            halt()
        }
    };

    if !KERNEL_ALLOCATOR.install(memory) {
        error!("kernel allocator was already installed, halting");
        halt()
    }
    kernel_main()
}

fn install_page_fault_gate() {
    // SAFETY: boot core only, before interrupts are ever enabled.
    #[allow(static_mut_refs)]
    unsafe {
        IDT[PAGE_FAULT_VECTOR]
            .set_handler(page_fault_handler)
            .present(true)
            .gate_interrupt();
        IDT.load();
    }
}
