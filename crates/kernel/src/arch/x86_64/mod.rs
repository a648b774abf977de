//! # x86_64 Architecture Support
//!
//! Platform-specific plumbing for the interrupt subsystem, the paging
//! layer and the device drivers: IDT and dispatch stubs, the legacy 8259A
//! cascade, the Local APIC and IO-APIC, the 8254 PIT, ACPI table walking
//! and the 16550 serial console.
//!
//! ## Boot flow on this architecture
//!
//! ```text
//! Boot shim (long mode, identity-mapped low memory)
//!     ↓
//! kernel_main
//!     ├── serial::init        console up first
//!     ├── interrupts::init    IDT + PIC remap, everything masked
//!     ├── apic::init          LAPIC enable (CPUID gated)
//!     ├── acpi → ioapic::init MADT discovery, RTE programming
//!     ├── mm / paging         bitmap PMM + 4-level tables
//!     ├── time::init          calibrated LAPIC timer or PIT fallback
//!     └── fabric::init        buses enumerate, drivers attach
//! ```
//!
//! ## Hardware access discipline
//!
//! Port I/O, MSR access and MMIO are confined to small `unsafe` leaf
//! functions in the modules below. Everything above them (dispatch policy,
//! table walks, translation) is plain data manipulation.

pub mod acpi;
pub mod apic;
pub mod idt;
pub mod ioapic;
pub mod paging;
pub mod pic;
pub mod pit;
pub mod serial;

use x86_64::instructions::interrupts;
use x86_64::registers::model_specific::Msr;

/// Read a Model-Specific Register.
///
/// # Safety
///
/// The MSR must exist on the running CPU; reading an unimplemented MSR
/// raises #GP.
pub unsafe fn rdmsr(msr: u32) -> u64 {
    Msr::new(msr).read()
}

/// Write a Model-Specific Register.
///
/// # Safety
///
/// The MSR must exist and the value must be architecturally valid for it.
pub unsafe fn wrmsr(msr: u32, value: u64) {
    Msr::new(msr).write(value);
}

/// True when the CPU accepts maskable interrupts (RFLAGS.IF set).
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

/// Set RFLAGS.IF.
pub fn interrupts_enable() {
    interrupts::enable();
}

/// Clear RFLAGS.IF.
pub fn interrupts_disable() {
    interrupts::disable();
}

/// Idle until the next interrupt (`hlt`). The caller is responsible for
/// having interrupts enabled; with them disabled this never returns.
pub fn wait_for_interrupt() {
    x86_64::instructions::hlt();
}

/// Disable interrupts and halt permanently.
pub fn halt_forever() -> ! {
    interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}
