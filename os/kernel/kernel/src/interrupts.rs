//! # x86-64 Interrupt Descriptor Table (IDT)
//!
//! Just enough of an IDT to get page faults reported during memory bring-up.
//! Every other vector stays non-present; an unexpected exception therefore
//! escalates to a triple fault, which QEMU reports on its own.
//!
//! ```ignore
//! idt[PAGE_FAULT_VECTOR]
//!     .set_handler(page_fault_handler)
//!     .present(true)
//!     .gate_interrupt();
//! unsafe { idt.load() };
//! ```

pub mod page_fault;

use bitfield_struct::bitfield;
use core::mem::size_of;
use core::ops::{Index, IndexMut};

const _: () = assert!(size_of::<IdtEntry>() == 16);
const _: () = assert!(align_of::<Idt>() == 16);

/// The two bytes of an IDT entry packing the IST index and the gate attributes.
///
/// - **low byte**: `IST` (3 bits) + 5 reserved zero bits
/// - **high byte**: `| P | DPL(2) | S(0) | Type(4) |`
#[bitfield(u16)]
pub struct IdtGateAttr {
    /// Interrupt Stack Table index, 0 keeps the current stack.
    #[bits(3)]
    pub ist: u8,

    #[bits(5)]
    __zero0: u8,

    /// 0xE = interrupt gate, 0xF = trap gate.
    #[bits(4)]
    pub typ: u8,

    /// System bit, `0` for interrupt and trap gates.
    #[bits(1)]
    pub s: bool,

    #[bits(2)]
    pub dpl: u8,

    #[bits(1)]
    pub present: bool,
}

impl IdtGateAttr {
    #[inline]
    #[must_use]
    pub const fn interrupt_gate() -> Self {
        Self::new().with_typ(0xE).with_s(false)
    }
}

/// A 256-entry interrupt descriptor table, all gates initially non-present.
#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

impl Idt {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; 256],
        }
    }

    /// Loads this IDT into the IDTR using `lidt`.
    ///
    /// # Safety
    /// Must be called at CPL0. All present entries must reference valid
    /// handler code in the current code segment.
    #[cfg(target_os = "none")]
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn load(&'static self) {
        let idtr = Idtr {
            limit: (size_of::<Self>() - 1) as u16,
            base: core::ptr::from_ref(self) as u64,
        };
        unsafe {
            core::arch::asm!("lidt [{}]", in(reg) &raw const idtr, options(nostack, preserves_flags, readonly));
        }
    }
}

impl Index<usize> for Idt {
    type Output = IdtEntry;
    fn index(&self, i: usize) -> &Self::Output {
        &self.entries[i]
    }
}

impl IndexMut<usize> for Idt {
    fn index_mut(&mut self, i: usize) -> &mut Self::Output {
        &mut self.entries[i]
    }
}

/// Operand of `lidt`.
#[cfg(target_os = "none")]
#[repr(C, packed)]
struct Idtr {
    limit: u16,
    base: u64,
}

/// One 16-byte gate descriptor.
///
/// ```text
/// bytes 0..2   offset[15:0]
/// bytes 2..4   code segment selector
/// bytes 4..6   IST + attributes (IdtGateAttr)
/// bytes 6..8   offset[31:16]
/// bytes 8..12  offset[63:32]
/// bytes 12..16 zero
/// ```
#[repr(C)]
#[derive(Copy, Clone)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    ist_type: u16,
    offset_mid: u16,
    offset_hi: u32,
    zero: u32,
}

impl IdtEntry {
    pub const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        ist_type: IdtGateAttr::new().into_bits(),
        offset_mid: 0,
        offset_hi: 0,
        zero: 0,
    };

    /// Points this entry at `handler` in the current code segment.
    ///
    /// The entry is left non-present; finish it through the returned builder.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_handler(&mut self, handler: extern "C" fn()) -> IdtEntryBuilder<'_> {
        let addr = handler as usize as u64;
        self.offset_lo = (addr & 0xFFFF) as u16;
        self.offset_mid = ((addr >> 16) & 0xFFFF) as u16;
        self.offset_hi = (addr >> 32) as u32;
        self.selector = current_cs();
        self.ist_type = IdtGateAttr::interrupt_gate()
            .with_present(false)
            .with_dpl(0)
            .with_ist(0)
            .into_bits();

        IdtEntryBuilder { entry: self }
    }

    /// The handler address stored in this entry.
    #[must_use]
    pub fn handler_address(&self) -> u64 {
        (u64::from(self.offset_hi) << 32) | (u64::from(self.offset_mid) << 16) | u64::from(self.offset_lo)
    }

    #[must_use]
    pub const fn attributes(&self) -> IdtGateAttr {
        IdtGateAttr::from_bits(self.ist_type)
    }
}

/// Fluent builder returned by [`IdtEntry::set_handler`].
///
/// Every call writes through to the entry; the returned builder only exists for chaining.
pub struct IdtEntryBuilder<'a> {
    entry: &'a mut IdtEntry,
}

#[allow(clippy::return_self_not_must_use, clippy::must_use_candidate)]
impl IdtEntryBuilder<'_> {
    #[inline]
    pub const fn present(self, p: bool) -> Self {
        let bf = IdtGateAttr::from_bits(self.entry.ist_type).with_present(p);
        self.entry.ist_type = bf.into_bits();
        self
    }

    /// Interrupt gate: `IF` is cleared on entry.
    #[inline]
    pub const fn gate_interrupt(self) -> Self {
        let bf = IdtGateAttr::from_bits(self.entry.ist_type)
            .with_typ(0xE)
            .with_s(false);
        self.entry.ist_type = bf.into_bits();
        self
    }

    /// Overrides the code segment selector (defaults to the current CS).
    #[inline]
    pub const fn selector(self, sel: u16) -> Self {
        self.entry.selector = sel;
        self
    }
}

/// The current CS selector. Reading it is allowed at any privilege level.
#[inline]
fn current_cs() -> u16 {
    let cs: u16;
    unsafe {
        core::arch::asm!("mov {0:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags));
    }
    cs
}
