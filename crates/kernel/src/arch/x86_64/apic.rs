//! # Local APIC
//!
//! xAPIC driver for the bootstrap processor. The Local APIC replaces the
//! 8259A as the CPU-side interrupt controller and carries the timer the
//! kernel uses as its primary tick source.
//!
//! ## Bring-up
//!
//! 1. CPUID leaf 1, EDX bit 9; no APIC means [`KernelError::HardwareAbsent`].
//! 2. Read `IA32_APIC_BASE` (MSR 0x1B): the MMIO page physical address
//!    lives in bits 12+, the global enable in bit 11.
//! 3. Set the enable bit, identity-map the MMIO page uncached.
//! 4. Program the spurious vector register with `enable | 0xFF`.
//!
//! ## Register map (offsets from the MMIO base)
//!
//! ```text
//! 0x020 ID          0x0F0 SVR            0x380 Timer initial count
//! 0x030 Version     0x320 LVT timer      0x390 Timer current count
//! 0x080 TPR         0x0B0 EOI            0x3E0 Timer divide config
//! ```
//!
//! ## Timer calibration
//!
//! The LAPIC timer runs off the bus clock, so its rate is measured, not
//! assumed: the timer free-runs one-shot from 0xFFFF_FFFF with divide-16
//! while the PIT marks off exactly one 10 ms tick, and the consumed count
//! scales by 102/1024 (a division-free ≈ ÷10) to ticks per millisecond.
//! A floor of 10 000 ticks/ms covers both a failed measurement (zero) and
//! implausibly slow readings.

use core::ptr::{read_volatile, write_volatile};
use raw_cpuid::CpuId;
use spin::{Mutex, Once};

use crate::error::{KernelError, KernelResult};

use super::{paging, pit, rdmsr, wrmsr};

/// MSR holding the APIC base address and enable bit
const IA32_APIC_BASE: u32 = 0x1B;

/// IA32_APIC_BASE bit 11: global APIC enable
const APIC_BASE_ENABLE: u64 = 1 << 11;

/// Physical base mask: bits 12 and up
const APIC_BASE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

// Register offsets
const REG_ID: u64 = 0x020;
const REG_VERSION: u64 = 0x030;
const REG_TPR: u64 = 0x080;
const REG_EOI: u64 = 0x0B0;
const REG_SVR: u64 = 0x0F0;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INITCNT: u64 = 0x380;
const REG_TIMER_CURRCNT: u64 = 0x390;
const REG_TIMER_DIV: u64 = 0x3E0;

/// SVR: software enable | spurious vector 0xFF
const SVR_ENABLE_SPURIOUS: u32 = (1 << 8) | 0xFF;

/// LVT: masked entry
const LVT_MASKED: u32 = 1 << 16;

/// LVT timer: periodic mode
const LVT_TIMER_PERIODIC: u32 = 1 << 17;

/// Divide configuration encoding for divide-by-16
const TIMER_DIV_16: u32 = 0x3;

/// Timer interrupt vector (IRQ 0 slot)
pub const TIMER_VECTOR: u8 = 32;

/// Floor and fallback for the calibrated rate (ticks per millisecond)
const MIN_TICKS_PER_MS: u32 = 10_000;

/// Scale a one-PIT-tick (10 ms) consumption measurement to ticks/ms.
///
/// `(elapsed * 102) >> 10` approximates ÷10 without a divide; the result
/// is floored at [`MIN_TICKS_PER_MS`], which also covers a measurement of
/// zero (PIT misbehaving, emulator skew).
pub fn ticks_per_ms_from(elapsed_per_10ms: u32) -> u32 {
    let scaled = ((elapsed_per_10ms as u64 * 102) >> 10) as u32;
    scaled.max(MIN_TICKS_PER_MS)
}

/// The bootstrap processor's Local APIC.
pub struct LocalApic {
    /// MMIO base; identity-mapped uncached, so also the virtual address.
    mmio_base: u64,
    /// Calibrated timer rate, ticks per millisecond.
    ticks_per_ms: u32,
}

impl LocalApic {
    unsafe fn read(&self, offset: u64) -> u32 {
        read_volatile((self.mmio_base + offset) as *const u32)
    }

    unsafe fn write(&self, offset: u64, value: u32) {
        write_volatile((self.mmio_base + offset) as *mut u32, value);
    }

    /// APIC ID of this CPU (destination field for IO-APIC routes).
    pub fn id(&self) -> u32 {
        unsafe { self.read(REG_ID) >> 24 }
    }

    /// Version register, for the boot log.
    pub fn version(&self) -> u32 {
        unsafe { self.read(REG_VERSION) & 0xFF }
    }

    /// Acknowledge the in-service interrupt.
    pub fn eoi(&self) {
        unsafe { self.write(REG_EOI, 0) };
    }

    /// Measure the timer rate against one PIT tick.
    ///
    /// # Safety
    ///
    /// Must run with interrupts disabled; takes over PIT channel 0 for
    /// the duration.
    unsafe fn calibrate_timer(&mut self) {
        self.write(REG_TIMER_DIV, TIMER_DIV_16);
        self.write(REG_LVT_TIMER, LVT_MASKED | TIMER_VECTOR as u32);
        self.write(REG_TIMER_INITCNT, 0xFFFF_FFFF);

        pit::wait_one_cycle();

        let end = self.read(REG_TIMER_CURRCNT);
        let elapsed = 0xFFFF_FFFF - end;
        self.write(REG_TIMER_INITCNT, 0);

        self.ticks_per_ms = ticks_per_ms_from(elapsed);
    }

    /// Start the timer periodic at `freq_hz`, delivering [`TIMER_VECTOR`].
    ///
    /// # Safety
    ///
    /// A handler must be reachable for the timer vector.
    pub unsafe fn start_periodic(&self, freq_hz: u32) {
        let period_ms = 1000 / freq_hz.max(1);
        let initial = self.ticks_per_ms * period_ms.max(1);

        self.write(REG_TIMER_DIV, TIMER_DIV_16);
        self.write(REG_LVT_TIMER, LVT_TIMER_PERIODIC | TIMER_VECTOR as u32);
        self.write(REG_TIMER_INITCNT, initial);
    }

    /// Calibrated timer rate in ticks per millisecond.
    pub fn ticks_per_ms(&self) -> u32 {
        self.ticks_per_ms
    }
}

static LAPIC: Once<Mutex<LocalApic>> = Once::new();

/// Bring up the BSP's Local APIC.
///
/// # Safety
///
/// Must be called once during boot with interrupts disabled, after the
/// paging layer is up (the MMIO page gets an uncached identity mapping).
pub unsafe fn init() -> KernelResult {
    let cpuid = CpuId::new();
    let has_apic = cpuid
        .get_feature_info()
        .map(|f| f.has_apic())
        .unwrap_or(false);
    if !has_apic {
        crate::kwarn!("[APIC] no local APIC reported by CPUID");
        return Err(KernelError::HardwareAbsent);
    }

    let mut base_msr = rdmsr(IA32_APIC_BASE);
    base_msr |= APIC_BASE_ENABLE;
    wrmsr(IA32_APIC_BASE, base_msr);

    let mmio_base = base_msr & APIC_BASE_ADDR_MASK;
    paging::kmap_mmio(mmio_base)?;

    let mut apic = LocalApic {
        mmio_base,
        ticks_per_ms: MIN_TICKS_PER_MS,
    };

    apic.write(REG_TPR, 0);
    apic.write(REG_SVR, SVR_ENABLE_SPURIOUS);
    apic.calibrate_timer();

    crate::kinfo!(
        "[APIC] local APIC id={} version={:#x} at {:#x}, {} ticks/ms",
        apic.id(),
        apic.version(),
        mmio_base,
        apic.ticks_per_ms()
    );

    LAPIC.call_once(|| Mutex::new(apic));
    Ok(())
}

/// True once `init` has succeeded; feeds the EOI routing matrix.
pub fn is_enabled() -> bool {
    LAPIC.get().is_some()
}

/// Acknowledge the in-service interrupt; no-op without a LAPIC.
pub fn eoi() {
    if let Some(apic) = LAPIC.get() {
        apic.lock().eoi();
    }
}

/// APIC ID of the bootstrap processor (0 without a LAPIC).
pub fn local_apic_id() -> u32 {
    LAPIC.get().map(|apic| apic.lock().id()).unwrap_or(0)
}

/// Start the periodic timer at `freq_hz`.
///
/// # Safety
///
/// A handler must be reachable for [`TIMER_VECTOR`].
pub unsafe fn start_timer(freq_hz: u32) -> KernelResult {
    match LAPIC.get() {
        Some(apic) => {
            apic.lock().start_periodic(freq_hz);
            Ok(())
        }
        None => Err(KernelError::HardwareAbsent),
    }
}
