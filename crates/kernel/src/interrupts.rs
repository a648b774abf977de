//! # Interrupt core
//!
//! Architecture-neutral heart of the interrupt subsystem: the per-vector
//! callback table, the IRQL state machine, and the dispatch policy shared
//! by every entry path. The low-level side (IDT entries, asm stubs, EOI
//! register pokes) lives in `arch::x86_64`.
//!
//! ## Vector space
//!
//! ```text
//! 0-31    CPU exceptions (fatal when unhandled, minus a silenced set)
//! 32-47   Hardware IRQs 0-15 (PIC remap / IO-APIC routing)
//! 48-255  Unused; delivery is acknowledged silently
//! ```
//!
//! ## Dispatch rules
//!
//! * IRQ vectors: invoke the registered callback if any, otherwise mask
//!   the line at the PIC. An IRQ is never fatal: the worst outcome of a
//!   storm from an unknown line is a masked line.
//! * Exception vectors: invoke the registered callback if any. Unhandled
//!   exceptions are fatal except for the silenced set (7, 15, 21, 22-31),
//!   which covers reserved vectors and the no-FPU case.
//! * End-of-interrupt routing depends on which controllers came up, see
//!   [`eoi_plan`]. The subtle row is a LAPIC without an IO-APIC: external
//!   lines still arrive through the PIC, but the CPU acknowledges through
//!   the LAPIC, so both controllers get serviced.

use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Number of interrupt vectors
pub const VECTOR_COUNT: usize = 256;

/// First hardware IRQ vector (PIC master remap base)
pub const IRQ_BASE: u8 = 32;

/// One past the last hardware IRQ vector
pub const IRQ_LIMIT: u8 = 48;

/// Architecture-neutral snapshot of the interrupted state, built by the
/// low-level stub from the saved frame.
#[derive(Debug, Clone, Copy)]
pub struct InterruptContext {
    pub vector: u8,
    pub error_code: u64,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub flags: u64,
    /// Faulting address (CR2); only meaningful for vector 14.
    pub fault_address: u64,
}

/// Per-vector callback
pub type VectorHandler = fn(&mut InterruptContext);

/// Interrupt request level.
///
/// Process-wide state in this single-CPU design: raising the level
/// disables hardware interrupts, lowering it back to `Passive` re-enables
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Irql {
    Passive = 0,
    Dispatch = 1,
    Device = 2,
    High = 3,
}

impl Irql {
    pub fn from_raw(raw: u8) -> Irql {
        match raw {
            0 => Irql::Passive,
            1 => Irql::Dispatch,
            2 => Irql::Device,
            _ => Irql::High,
        }
    }
}

/// Exception mnemonics for the fatal diagnostic, indexed by vector.
const EXCEPTION_NAMES: [&str; 32] = [
    "Divide Error",
    "Debug",
    "NMI",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 FPU Error",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point",
    "Virtualization",
    "Control Protection",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection",
    "VMM Communication",
    "Security Exception",
    "Reserved",
];

/// Exceptions that return silently when no handler is registered:
/// vector 7 (no-FPU), 15 and 21-31 (reserved / spurious).
fn is_silenced_exception(vector: u8) -> bool {
    matches!(vector, 7 | 15 | 21..=31)
}

/// Per-vector callback table
struct VectorTable {
    handlers: [Option<VectorHandler>; VECTOR_COUNT],
}

impl VectorTable {
    const fn new() -> Self {
        Self {
            handlers: [None; VECTOR_COUNT],
        }
    }
}

static VECTORS: Mutex<VectorTable> = Mutex::new(VectorTable::new());

static CURRENT_IRQL: AtomicU8 = AtomicU8::new(Irql::High as u8);

/// Install the vector table and interrupt controllers.
///
/// Loads the IDT, remaps the PIC to vectors 32-47 with every line masked,
/// and leaves hardware interrupts disabled (IRQL stays at `High`).
///
/// # Safety
///
/// Must be called exactly once during boot, before `enable`.
#[cfg(target_arch = "x86_64")]
pub unsafe fn init() {
    crate::arch::x86_64::idt::init();
    crate::arch::x86_64::pic::init();
    CURRENT_IRQL.store(Irql::High as u8, Ordering::SeqCst);
    crate::kinfo!("[INT] IDT installed, PIC remapped, all lines masked");
}

/// Register the callback for a vector, replacing any previous one.
pub fn register(vector: usize, handler: VectorHandler) -> KernelResult {
    if vector >= VECTOR_COUNT {
        return Err(KernelError::InvalidArg);
    }
    VECTORS.lock().handlers[vector] = Some(handler);
    Ok(())
}

/// Remove the callback for a vector.
pub fn unregister(vector: usize) -> KernelResult {
    if vector >= VECTOR_COUNT {
        return Err(KernelError::InvalidArg);
    }
    VECTORS.lock().handlers[vector] = None;
    Ok(())
}

fn handler_for(vector: u8) -> Option<VectorHandler> {
    VECTORS.lock().handlers[vector as usize]
}

/// Current interrupt request level.
pub fn current_irql() -> Irql {
    Irql::from_raw(CURRENT_IRQL.load(Ordering::SeqCst))
}

/// Move to a new IRQL and return the previous one.
///
/// Any level above `Passive` masks hardware interrupts; returning to
/// `Passive` unmasks them.
#[cfg(target_arch = "x86_64")]
pub fn set_irql(new: Irql) -> Irql {
    let prior = Irql::from_raw(CURRENT_IRQL.swap(new as u8, Ordering::SeqCst));
    if new == Irql::Passive {
        crate::arch::interrupts_enable();
    } else {
        crate::arch::interrupts_disable();
    }
    prior
}

/// Enable interrupt delivery (IRQL to `Passive`).
#[cfg(target_arch = "x86_64")]
pub fn enable() {
    set_irql(Irql::Passive);
}

/// Disable interrupt delivery (IRQL to `High`).
#[cfg(target_arch = "x86_64")]
pub fn disable() {
    set_irql(Irql::High);
}

/// Idle the CPU until the next interrupt.
#[cfg(target_arch = "x86_64")]
pub fn wait() {
    crate::arch::wait_for_interrupt();
}

/// Which controllers receive the end-of-interrupt acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EoiPlan {
    pub pic: bool,
    pub lapic: bool,
}

/// EOI routing matrix.
///
/// | LAPIC | IO-APIC | acknowledged at |
/// |-------|---------|-----------------|
/// | yes   | yes     | LAPIC only      |
/// | yes   | no      | PIC and LAPIC   |
/// | no    | any     | PIC only        |
pub fn eoi_plan(lapic_present: bool, ioapic_present: bool) -> EoiPlan {
    match (lapic_present, ioapic_present) {
        (true, true) => EoiPlan {
            pic: false,
            lapic: true,
        },
        (true, false) => EoiPlan {
            pic: true,
            lapic: true,
        },
        (false, _) => EoiPlan {
            pic: true,
            lapic: false,
        },
    }
}

/// Acknowledge the current IRQ at the controllers that routed it.
#[cfg(target_arch = "x86_64")]
fn controller_eoi(irq: u8) {
    use crate::arch::x86_64::{apic, ioapic, pic};

    let plan = eoi_plan(apic::is_enabled(), ioapic::is_enabled());
    if plan.pic {
        unsafe { pic::send_eoi(irq) };
    }
    if plan.lapic {
        apic::eoi();
    }
}

/// Central dispatcher, called by the low-level stub with the decoded
/// context of the interrupted frame.
#[cfg(target_arch = "x86_64")]
pub fn dispatch(ctx: &mut InterruptContext) {
    let vector = ctx.vector;
    if (IRQ_BASE..IRQ_LIMIT).contains(&vector) {
        dispatch_irq(ctx);
    } else if vector < IRQ_BASE {
        dispatch_exception(ctx);
    }
    // Vectors >= 48 (including the 0xFF spurious slot) return silently.
}

#[cfg(target_arch = "x86_64")]
fn dispatch_irq(ctx: &mut InterruptContext) {
    use crate::arch::x86_64::pic;

    let irq = ctx.vector - IRQ_BASE;
    if irq > 15 {
        controller_eoi(irq);
        return;
    }

    // Glitched IRQ 7 / IRQ 15 lines raise an interrupt without a bit in
    // the in-service register; IRQ 15 still owes the master a cascade EOI.
    if (irq == 7 || irq == 15) && unsafe { pic::is_spurious(irq) } {
        if irq == 15 {
            unsafe { pic::send_eoi(2) };
        }
        return;
    }

    match handler_for(ctx.vector) {
        Some(handler) => handler(ctx),
        None => {
            crate::kwarn!("[INT] masking unhandled IRQ {}", irq);
            unsafe { pic::disable_irq(irq) };
        }
    }

    controller_eoi(irq);
}

#[cfg(target_arch = "x86_64")]
fn dispatch_exception(ctx: &mut InterruptContext) {
    if let Some(handler) = handler_for(ctx.vector) {
        handler(ctx);
        return;
    }

    if is_silenced_exception(ctx.vector) {
        return;
    }

    let name = EXCEPTION_NAMES[ctx.vector as usize];
    crate::kerror!(
        "[INT] fatal exception {}: {} (error code {:#x})",
        ctx.vector,
        name,
        ctx.error_code
    );
    crate::kerror!(
        "[INT] rip={:#018x} rsp={:#018x} rflags={:#x}",
        ctx.instruction_pointer,
        ctx.stack_pointer,
        ctx.flags
    );
    if ctx.vector == 14 {
        crate::kerror!("[INT] cr2={:#018x}", ctx.fault_address);
    }
    crate::arch::halt_forever();
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn counting_handler(_ctx: &mut InterruptContext) {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    fn ctx_for(vector: u8) -> InterruptContext {
        InterruptContext {
            vector,
            error_code: 0,
            instruction_pointer: 0x1000,
            stack_pointer: 0x2000,
            flags: 0x202,
            fault_address: 0,
        }
    }

    #[test]
    fn test_register_rejects_out_of_range_vector() {
        assert_eq!(
            register(VECTOR_COUNT, counting_handler),
            Err(KernelError::InvalidArg)
        );
        assert_eq!(unregister(VECTOR_COUNT + 7), Err(KernelError::InvalidArg));
    }

    #[test]
    fn test_unregistered_vector_invokes_no_handler() {
        // Vector 7 is in the silenced set, so dispatching it unhandled is
        // a quiet return rather than a fatal diagnostic.
        let mut ctx = ctx_for(7);

        register(7, counting_handler).unwrap();
        let before = FIRED.load(Ordering::SeqCst);
        dispatch(&mut ctx);
        assert_eq!(FIRED.load(Ordering::SeqCst), before + 1);

        unregister(7).unwrap();
        dispatch(&mut ctx);
        assert_eq!(FIRED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_high_vectors_return_silently() {
        let mut ctx = ctx_for(200);
        dispatch(&mut ctx); // must not touch any controller or panic
    }

    #[test]
    fn test_eoi_matrix() {
        // LAPIC + IO-APIC: the LAPIC alone acknowledges.
        assert_eq!(
            eoi_plan(true, true),
            EoiPlan {
                pic: false,
                lapic: true
            }
        );
        // LAPIC without IO-APIC: the line came through the PIC but the
        // CPU acknowledges through the LAPIC, so both are serviced.
        assert_eq!(
            eoi_plan(true, false),
            EoiPlan {
                pic: true,
                lapic: true
            }
        );
        // Legacy PIC only.
        assert_eq!(
            eoi_plan(false, false),
            EoiPlan {
                pic: true,
                lapic: false
            }
        );
        assert_eq!(
            eoi_plan(false, true),
            EoiPlan {
                pic: true,
                lapic: false
            }
        );
    }

    #[test]
    fn test_silenced_set() {
        assert!(is_silenced_exception(7));
        assert!(is_silenced_exception(15));
        assert!(is_silenced_exception(21));
        assert!(is_silenced_exception(31));
        assert!(!is_silenced_exception(14));
        assert!(!is_silenced_exception(13));
        assert!(!is_silenced_exception(0));
    }

    #[test]
    fn test_irql_ordering() {
        assert!(Irql::Passive < Irql::Dispatch);
        assert!(Irql::Dispatch < Irql::Device);
        assert!(Irql::Device < Irql::High);
        assert_eq!(Irql::from_raw(2), Irql::Device);
        assert_eq!(Irql::from_raw(250), Irql::High);
    }
}
