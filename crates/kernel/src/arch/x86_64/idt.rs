//! # Interrupt Descriptor Table and low-level dispatch
//!
//! The IDT holds 256 gates. Each of vectors 0-47 gets its own tiny asm
//! stub that normalises the stack (pushing a dummy error code where the
//! CPU does not supply one), pushes the vector number and all general
//! purpose registers, and jumps to a shared tail that calls the single
//! Rust dispatcher with a pointer to the saved frame. Vectors 48-255
//! share one stub; the dispatcher acknowledges them silently.
//!
//! ## Gate layout (64-bit interrupt gate)
//!
//! ```text
//! Offset  Field
//! ------  --------------------------------------
//! 0       handler address bits 0-15
//! 2       code segment selector
//! 4       IST index (bits 0-2; 0 = main stack)
//! 5       attributes: P | DPL | type (0xE)
//! 6       handler address bits 16-31
//! 8       handler address bits 32-63
//! 12      reserved
//! ```
//!
//! Slots 0-31 are exception gates (DPL 0); slots 32-47 map PIC/IO-APIC
//! IRQ `n` to vector `32 + n`.

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS};
use x86_64::instructions::tables::lidt;
use x86_64::registers::control::Cr2;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use crate::interrupts::{self, InterruptContext, VECTOR_COUNT};

/// Gate attribute byte: present, DPL 0, 64-bit interrupt gate.
const GATE_PRESENT_INT: u8 = 0x8E;

/// Number of vectors with a dedicated stub (exceptions + IRQ window).
const DEDICATED_STUBS: usize = 48;

/// One 16-byte IDT gate.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    attributes: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            attributes: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    /// Build a present interrupt gate for a handler address.
    ///
    /// `ist` selects an Interrupt Stack Table slot; 0 keeps the current
    /// stack.
    pub fn new(handler: u64, selector: u16, ist: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            ist: ist & 0x7,
            attributes: GATE_PRESENT_INT,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    /// Reassembled handler address.
    pub fn handler(&self) -> u64 {
        self.offset_low as u64
            | (self.offset_mid as u64) << 16
            | (self.offset_high as u64) << 32
    }

    pub fn is_present(&self) -> bool {
        self.attributes & 0x80 != 0
    }
}

/// The full 256-slot table.
#[repr(C, align(16))]
pub struct InterruptTable {
    entries: [IdtEntry; VECTOR_COUNT],
}

impl InterruptTable {
    fn new() -> Self {
        Self {
            entries: [IdtEntry::missing(); VECTOR_COUNT],
        }
    }
}

// ---------------------------------------------------------------------
// Vector stubs
//
// The CPU aligns RSP to 16 bytes and pushes SS:RSP, RFLAGS, CS, RIP and
// (for a subset of the exceptions) an error code. The stubs bring every
// vector to the same frame shape, then the shared tail saves the GPRs
// and calls `isr_dispatch(frame)`. With the error-code slot, the vector
// and 15 registers on top of the CPU frame, RSP lands back on a 16-byte
// boundary exactly at the call.
// ---------------------------------------------------------------------

/// Emit the stub for a vector where the CPU pushes no error code.
macro_rules! isr_stub {
    ($vec:literal) => {
        core::arch::global_asm!(concat!(
            ".global isr_stub_", $vec, "\n",
            "isr_stub_", $vec, ":\n",
            "    push 0\n",
            "    push ", $vec, "\n",
            "    jmp isr_common\n",
        ));
    };
}

/// Emit the stub for a vector where the CPU pushed an error code already.
macro_rules! isr_stub_err {
    ($vec:literal) => {
        core::arch::global_asm!(concat!(
            ".global isr_stub_", $vec, "\n",
            "isr_stub_", $vec, ":\n",
            "    push ", $vec, "\n",
            "    jmp isr_common\n",
        ));
    };
}

// Exceptions 0-31. Vectors 8, 10-14, 17, 21, 29 and 30 carry a CPU error
// code; the rest get a dummy so every frame has the same shape.
isr_stub!(0);
isr_stub!(1);
isr_stub!(2);
isr_stub!(3);
isr_stub!(4);
isr_stub!(5);
isr_stub!(6);
isr_stub!(7);
isr_stub_err!(8);
isr_stub!(9);
isr_stub_err!(10);
isr_stub_err!(11);
isr_stub_err!(12);
isr_stub_err!(13);
isr_stub_err!(14);
isr_stub!(15);
isr_stub!(16);
isr_stub_err!(17);
isr_stub!(18);
isr_stub!(19);
isr_stub!(20);
isr_stub_err!(21);
isr_stub!(22);
isr_stub!(23);
isr_stub!(24);
isr_stub!(25);
isr_stub!(26);
isr_stub!(27);
isr_stub!(28);
isr_stub_err!(29);
isr_stub_err!(30);
isr_stub!(31);

// Hardware IRQ window 32-47.
isr_stub!(32);
isr_stub!(33);
isr_stub!(34);
isr_stub!(35);
isr_stub!(36);
isr_stub!(37);
isr_stub!(38);
isr_stub!(39);
isr_stub!(40);
isr_stub!(41);
isr_stub!(42);
isr_stub!(43);
isr_stub!(44);
isr_stub!(45);
isr_stub!(46);
isr_stub!(47);

// Everything above the IRQ window shares one stub; the dispatcher treats
// the whole range as silent, so the exact vector is folded to the
// spurious slot value.
core::arch::global_asm!(
    ".global isr_stub_unknown",
    "isr_stub_unknown:",
    "    push 0",
    "    push 255",
    "    jmp isr_common",
);

// Shared tail: save GPRs, hand the frame to Rust, restore, return.
core::arch::global_asm!(
    ".global isr_common",
    "isr_common:",
    "    push rax",
    "    push rcx",
    "    push rdx",
    "    push rbx",
    "    push rbp",
    "    push rsi",
    "    push rdi",
    "    push r8",
    "    push r9",
    "    push r10",
    "    push r11",
    "    push r12",
    "    push r13",
    "    push r14",
    "    push r15",
    "    cld",
    "    mov rdi, rsp",
    "    call isr_dispatch",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop r11",
    "    pop r10",
    "    pop r9",
    "    pop r8",
    "    pop rdi",
    "    pop rsi",
    "    pop rbp",
    "    pop rbx",
    "    pop rdx",
    "    pop rcx",
    "    pop rax",
    "    add rsp, 16",
    "    iretq",
);

// Address table consumed when the IDT is built.
core::arch::global_asm!(
    ".section .rodata",
    ".global isr_stub_table",
    ".balign 8",
    "isr_stub_table:",
    "    .quad isr_stub_0",
    "    .quad isr_stub_1",
    "    .quad isr_stub_2",
    "    .quad isr_stub_3",
    "    .quad isr_stub_4",
    "    .quad isr_stub_5",
    "    .quad isr_stub_6",
    "    .quad isr_stub_7",
    "    .quad isr_stub_8",
    "    .quad isr_stub_9",
    "    .quad isr_stub_10",
    "    .quad isr_stub_11",
    "    .quad isr_stub_12",
    "    .quad isr_stub_13",
    "    .quad isr_stub_14",
    "    .quad isr_stub_15",
    "    .quad isr_stub_16",
    "    .quad isr_stub_17",
    "    .quad isr_stub_18",
    "    .quad isr_stub_19",
    "    .quad isr_stub_20",
    "    .quad isr_stub_21",
    "    .quad isr_stub_22",
    "    .quad isr_stub_23",
    "    .quad isr_stub_24",
    "    .quad isr_stub_25",
    "    .quad isr_stub_26",
    "    .quad isr_stub_27",
    "    .quad isr_stub_28",
    "    .quad isr_stub_29",
    "    .quad isr_stub_30",
    "    .quad isr_stub_31",
    "    .quad isr_stub_32",
    "    .quad isr_stub_33",
    "    .quad isr_stub_34",
    "    .quad isr_stub_35",
    "    .quad isr_stub_36",
    "    .quad isr_stub_37",
    "    .quad isr_stub_38",
    "    .quad isr_stub_39",
    "    .quad isr_stub_40",
    "    .quad isr_stub_41",
    "    .quad isr_stub_42",
    "    .quad isr_stub_43",
    "    .quad isr_stub_44",
    "    .quad isr_stub_45",
    "    .quad isr_stub_46",
    "    .quad isr_stub_47",
    ".section .text",
);

#[allow(non_upper_case_globals)]
extern "C" {
    static isr_stub_table: [u64; DEDICATED_STUBS];
    fn isr_stub_unknown();
}

/// Register save area as laid out by the stubs, lowest address first.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    // Pushed by the CPU:
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Entry point from the asm tail: decode the saved frame into an
/// architecture-neutral context and hand it to the dispatcher.
#[no_mangle]
extern "C" fn isr_dispatch(frame: *mut InterruptFrame) {
    let frame = unsafe { &mut *frame };
    let fault_address = if frame.vector == 14 {
        Cr2::read().as_u64()
    } else {
        0
    };

    let mut ctx = InterruptContext {
        vector: frame.vector as u8,
        error_code: frame.error_code,
        instruction_pointer: frame.rip,
        stack_pointer: frame.rsp,
        flags: frame.rflags,
        fault_address,
    };

    interrupts::dispatch(&mut ctx);
}

lazy_static! {
    /// The kernel IDT, built once from the stub address table.
    static ref IDT: InterruptTable = {
        let selector = CS::get_reg().0;
        let mut idt = InterruptTable::new();
        unsafe {
            for (vector, &stub) in isr_stub_table.iter().enumerate() {
                idt.entries[vector] = IdtEntry::new(stub, selector, 0);
            }
            for vector in DEDICATED_STUBS..VECTOR_COUNT {
                idt.entries[vector] =
                    IdtEntry::new(isr_stub_unknown as usize as u64, selector, 0);
            }
        }
        idt
    };
}

/// Load the IDT into the CPU.
///
/// # Safety
///
/// Must be called during boot with interrupts disabled, after the GDT of
/// the boot shim is in place (the gates capture the current CS).
pub unsafe fn init() {
    let pointer = DescriptorTablePointer {
        limit: (core::mem::size_of::<InterruptTable>() - 1) as u16,
        base: VirtAddr::new(&*IDT as *const InterruptTable as u64),
    };
    lidt(&pointer);
}
