//! # RodNIX kernel core
//!
//! A small 64-bit kernel for x86_64 PC hardware. This crate is the hard
//! core: the interrupt subsystem (IDT, dispatch, PIC/LAPIC/IO-APIC
//! routing and EOI discipline, IRQL masking), the physical memory
//! manager and 4-level paging layer, the Fabric device registry with its
//! IRQ multiplexer, and the PS/2 input pipeline. The boot shim, the VGA
//! console, storage and filesystems live outside and meet this crate at
//! `kernel_main` and the service registry.
//!
//! ## Module map
//!
//! ```text
//! error        kernel-wide error taxonomy
//! klog         log ring + serial mirror, kerror!/kwarn!/kinfo!/kdebug!
//! interrupts   vector registry, IRQL, dispatch + EOI policy
//! arch         x86_64: IDT/stubs, PIC, LAPIC, IO-APIC, PIT, ACPI,
//!              paging, serial
//! mm           bitmap physical memory manager
//! fabric       bus/driver/device/service registry + IRQ multiplexer
//! input        scancode ring, translator FSM, line-oriented consumer
//! drivers      platform bus, PCI bus, PS/2 keyboard
//! time         tick accounting over the timer IRQ
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
#![cfg_attr(feature = "strict", deny(unsafe_op_in_unsafe_fn))]

#[macro_use]
pub mod klog;

pub mod arch;
pub mod drivers;
pub mod error;
pub mod fabric;
pub mod input;
pub mod interrupts;
pub mod mm;
pub mod panic;
pub mod time;

/// Boot parameters handed over by the boot shim.
///
/// The managed physical range and the ACPI scan window are parameters
/// rather than constants so the shim can pass through a firmware memory
/// map; the defaults reproduce the classic fixed layout.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// First byte of the PMM-managed physical range (page-aligned).
    pub mem_start: u64,
    /// One past the last managed byte (page-aligned).
    pub mem_end: u64,
    /// RSDP scan window, normally the BIOS read-only segment.
    pub acpi_scan_start: u64,
    pub acpi_scan_end: u64,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            mem_start: 0x0010_0000,  // 1 MiB
            mem_end: 0x0400_0000,    // 64 MiB
            acpi_scan_start: crate::arch::x86_64::acpi::BIOS_SCAN_START,
            acpi_scan_end: crate::arch::x86_64::acpi::BIOS_SCAN_END,
        }
    }
}

/// Console echo sink handed to the input pipeline.
#[cfg(target_arch = "x86_64")]
fn console_echo(byte: u8) {
    arch::console_write(&[byte]);
}

/// Fatal boot error: log and park.
#[cfg(target_arch = "x86_64")]
fn boot_fail(stage: &str, err: error::KernelError) -> ! {
    kerror!("[BOOT] {} failed: {}", stage, err);
    arch::halt_forever();
}

/// Kernel entry, called by the boot shim in long mode with the boot
/// identity mappings live and interrupts disabled.
///
/// Bring-up order: console → interrupt subsystem → PMM → paging →
/// LAPIC → IO-APIC (via MADT) → timer → Fabric buses and drivers →
/// interrupts on → idle loop draining the input pipeline.
#[cfg(target_arch = "x86_64")]
#[no_mangle]
pub extern "C" fn kernel_main(config: &BootConfig) -> ! {
    arch::x86_64::serial::init();
    kinfo!("[BOOT] RodNIX starting");

    unsafe {
        interrupts::init();

        if let Err(err) = mm::init(config.mem_start, config.mem_end) {
            boot_fail("pmm init", err);
        }
        arch::x86_64::paging::init();

        // Controllers are best-effort: a machine without a LAPIC runs on
        // the PIC alone, one without an IO-APIC routes through the PIC
        // with the LAPIC acknowledging alongside.
        let lapic_up = arch::x86_64::apic::init().is_ok();
        if lapic_up {
            let record =
                arch::x86_64::acpi::discover_ioapic(config.acpi_scan_start, config.acpi_scan_end);
            let (base, gsi) = match record {
                Some(r) => (r.address as u64, r.gsi_base),
                None => (arch::x86_64::ioapic::DEFAULT_MMIO_BASE, 0),
            };
            let _ = arch::x86_64::ioapic::init(base, gsi);
        }

        if let Err(err) = time::init(time::DEFAULT_HZ) {
            boot_fail("timer init", err);
        }
    }

    if let Err(err) = fabric::register_bus(&drivers::platform::PLATFORM_BUS) {
        boot_fail("platform bus", err);
    }
    if let Err(err) = fabric::register_bus(&drivers::pci::PCI_BUS) {
        boot_fail("pci bus", err);
    }
    if let Err(err) = fabric::register_driver(&drivers::ps2_kbd::PS2_KEYBOARD_DRIVER) {
        boot_fail("keyboard driver", err);
    }

    input::set_echo(console_echo);
    interrupts::enable();
    kinfo!(
        "[BOOT] up: {} devices, {} bound, {} pages free",
        fabric::fabric().device_count(),
        fabric::fabric().bound_count(),
        mm::stats().map(|s| s.free_pages).unwrap_or(0)
    );

    // Idle: everything else happens in interrupt handlers and the
    // input pipeline.
    loop {
        input::process_pending();
        interrupts::wait();
    }
}
