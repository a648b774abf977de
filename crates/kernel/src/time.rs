//! Tick accounting
//!
//! A monotonic tick counter fed by the vector-32 timer interrupt. The
//! tick source is the calibrated LAPIC timer when one came up, otherwise
//! the PIT through PIC IRQ 0; either way the handler is claimed through
//! the IRQ multiplexer like any other driver.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::KernelResult;

/// Default tick rate
pub const DEFAULT_HZ: u32 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);
static MS_PER_TICK: AtomicU64 = AtomicU64::new(0);

/// IRQ-multiplexer handler for the timer vector.
fn timer_tick(_vector: u8, _arg: usize) {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Record the configured rate; split out so the arithmetic is visible
/// to tests that cannot touch the timer hardware.
fn configure(freq_hz: u32) {
    MS_PER_TICK.store(1000 / freq_hz.max(1) as u64, Ordering::Relaxed);
}

/// Raw ticks since the timer started.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since the timer started (0 before `init`).
pub fn uptime_ms() -> u64 {
    TICKS.load(Ordering::Relaxed) * MS_PER_TICK.load(Ordering::Relaxed)
}

/// Start the periodic timer at `freq_hz` and hook the tick counter.
///
/// # Safety
///
/// Interrupt subsystem and (when present) the LAPIC must be initialised;
/// interrupts still globally disabled.
#[cfg(target_arch = "x86_64")]
pub unsafe fn init(freq_hz: u32) -> KernelResult {
    use crate::arch::x86_64::{apic, pic, pit};

    configure(freq_hz);
    crate::fabric::irq::request_irq(apic::TIMER_VECTOR, timer_tick, 0)?;

    if apic::is_enabled() {
        apic::start_timer(freq_hz)?;
        crate::kinfo!("[TIME] LAPIC timer at {} Hz", freq_hz);
    } else {
        pit::start_periodic(freq_hz);
        pic::enable_irq(0);
        crate::kinfo!("[TIME] PIT timer at {} Hz via PIC", freq_hz);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_accounting() {
        configure(100); // 10 ms per tick
        let base_ticks = ticks();
        let base_ms = uptime_ms();

        for _ in 0..5 {
            timer_tick(32, 0);
        }

        assert_eq!(ticks() - base_ticks, 5);
        assert_eq!(uptime_ms() - base_ms, 50);

        // A zero rate clamps instead of dividing by zero.
        configure(0);
        assert_eq!(MS_PER_TICK.load(Ordering::Relaxed), 1000);
        configure(DEFAULT_HZ);
    }
}
