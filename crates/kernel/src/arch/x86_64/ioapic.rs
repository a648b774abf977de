//! # IO-APIC
//!
//! The IO-APIC routes external interrupt lines to Local APICs. Its
//! registers sit behind an index/window pair in one MMIO page:
//!
//! ```text
//! base + 0x00  IOREGSEL   register index
//! base + 0x10  IOWIN      register window
//!
//! Register 0x00       ID
//! Register 0x01       Version | max redirection entry
//! Register 0x10 + 2n  Redirection entry n, low half
//! Register 0x11 + 2n  Redirection entry n, high half
//! ```
//!
//! Each 64-bit redirection entry selects vector, delivery mode,
//! destination mode, polarity, trigger mode, a mask bit, and the target
//! LAPIC ID. This kernel programs every line fixed/physical/high/edge to
//! `vector = IRQ + 32`, aimed at the bootstrap CPU.
//!
//! The MMIO page address comes from the ACPI MADT; 0xFEC00000 is the
//! chipset default when no table mentions one. A version register reading
//! 0 or all-ones means nothing answered at the page, and init fails with
//! [`KernelError::HardwareAbsent`]; the PIC keeps routing in that case.

use bitflags::bitflags;
use core::ptr::{read_volatile, write_volatile};
use spin::{Mutex, Once};

use crate::error::{KernelError, KernelResult};
use crate::interrupts::IRQ_BASE;

use super::{apic, paging};

/// Chipset-default MMIO base, used when the MADT has no IO-APIC record.
pub const DEFAULT_MMIO_BASE: u64 = 0xFEC0_0000;

/// Register index port offset
const IOREGSEL: u64 = 0x00;

/// Register window offset
const IOWIN: u64 = 0x10;

/// ID register
const REG_ID: u32 = 0x00;

/// Version register (bits 0-7 version, 16-23 max redirection entry)
const REG_VERSION: u32 = 0x01;

/// First redirection entry register; entry n occupies `0x10 + 2n` (low)
/// and `0x11 + 2n` (high).
const REG_REDTBL_BASE: u32 = 0x10;

bitflags! {
    /// Control bits in the low half of a redirection entry.
    ///
    /// The unset state of each bit is the mode this kernel wants:
    /// fixed delivery, physical destination, active-high, edge-triggered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RteFlags: u32 {
        /// Lowest-priority delivery (delivery mode bit 0)
        const DELIVERY_LOWEST   = 1 << 8;
        /// SMI delivery (delivery mode bit 1)
        const DELIVERY_SMI      = 1 << 9;
        /// NMI delivery (delivery mode bit 2)
        const DELIVERY_NMI      = 1 << 10;
        /// Logical destination mode
        const LOGICAL_DEST      = 1 << 11;
        /// Delivery status (read-only)
        const SEND_PENDING      = 1 << 12;
        /// Active-low polarity
        const ACTIVE_LOW        = 1 << 13;
        /// Remote IRR (read-only)
        const REMOTE_IRR        = 1 << 14;
        /// Level-triggered
        const LEVEL_TRIGGERED   = 1 << 15;
        /// Line masked
        const MASKED            = 1 << 16;
    }
}

/// Build the 64-bit redirection entry for a hardware IRQ: fixed delivery,
/// physical destination, active-high, edge-triggered, vector `IRQ + 32`.
pub fn redirection_entry(irq: u8, dest_apic_id: u32, masked: bool) -> u64 {
    let mut low = (IRQ_BASE + irq) as u32;
    if masked {
        low |= RteFlags::MASKED.bits();
    }
    let high = dest_apic_id << 24;
    (high as u64) << 32 | low as u64
}

/// One IO-APIC, found via the MADT (or assumed at the default base).
pub struct IoApic {
    /// MMIO base; identity-mapped uncached.
    mmio_base: u64,
    /// First global system interrupt this IO-APIC serves.
    gsi_base: u32,
}

impl IoApic {
    unsafe fn read(&self, reg: u32) -> u32 {
        write_volatile((self.mmio_base + IOREGSEL) as *mut u32, reg);
        read_volatile((self.mmio_base + IOWIN) as *const u32)
    }

    unsafe fn write(&self, reg: u32, value: u32) {
        write_volatile((self.mmio_base + IOREGSEL) as *mut u32, reg);
        write_volatile((self.mmio_base + IOWIN) as *mut u32, value);
    }

    unsafe fn write_entry(&self, irq: u8, entry: u64) {
        let reg = REG_REDTBL_BASE + 2 * irq as u32;
        // High half first: mask state changes in the low half land last.
        self.write(reg + 1, (entry >> 32) as u32);
        self.write(reg, entry as u32);
    }

    /// Route an IRQ to the bootstrap CPU and unmask it.
    ///
    /// # Safety
    ///
    /// A handler should be reachable for `IRQ + 32` before unmasking.
    pub unsafe fn enable_irq(&self, irq: u8) {
        let entry = redirection_entry(irq, apic::local_apic_id(), false);
        self.write_entry(irq, entry);
    }

    /// Mask an IRQ at the redirection table.
    pub unsafe fn disable_irq(&self, irq: u8) {
        let entry = redirection_entry(irq, apic::local_apic_id(), true);
        self.write_entry(irq, entry);
    }
}

static IOAPIC: Once<Mutex<IoApic>> = Once::new();

/// Bring up the IO-APIC at the given physical base.
///
/// # Safety
///
/// Must be called once during boot with interrupts disabled, after the
/// paging layer and the Local APIC are up.
pub unsafe fn init(mmio_base: u64, gsi_base: u32) -> KernelResult {
    paging::kmap_mmio(mmio_base)?;

    let ioapic = IoApic {
        mmio_base,
        gsi_base,
    };

    // A floating or absent page reads as all-ones; a zeroed version
    // register means the window never latched. Either way: no IO-APIC.
    let version = ioapic.read(REG_VERSION);
    if version == 0 || version == 0xFFFF_FFFF {
        crate::kwarn!("[IOAPIC] no controller at {:#x}", mmio_base);
        return Err(KernelError::HardwareAbsent);
    }

    let id = (ioapic.read(REG_ID) >> 24) & 0xF;
    let max_entry = (version >> 16) & 0xFF;
    crate::kinfo!(
        "[IOAPIC] id={} version={:#x} at {:#x}, {} redirection entries, gsi base {}",
        id,
        version & 0xFF,
        mmio_base,
        max_entry + 1,
        ioapic.gsi_base
    );

    // Everything masked until a driver claims its line.
    for irq in 0..=max_entry.min(23) as u8 {
        ioapic.disable_irq(irq);
    }

    IOAPIC.call_once(|| Mutex::new(ioapic));
    Ok(())
}

/// True once `init` has succeeded; feeds the EOI routing matrix.
pub fn is_enabled() -> bool {
    IOAPIC.get().is_some()
}

/// Route an IRQ to the bootstrap CPU and unmask it.
///
/// # Safety
///
/// A handler should be reachable for `IRQ + 32` before unmasking.
pub unsafe fn enable_irq(irq: u8) -> KernelResult {
    match IOAPIC.get() {
        Some(ioapic) => {
            ioapic.lock().enable_irq(irq);
            Ok(())
        }
        None => Err(KernelError::HardwareAbsent),
    }
}

/// Mask an IRQ at the redirection table.
pub unsafe fn disable_irq(irq: u8) -> KernelResult {
    match IOAPIC.get() {
        Some(ioapic) => {
            ioapic.lock().disable_irq(irq);
            Ok(())
        }
        None => Err(KernelError::HardwareAbsent),
    }
}
