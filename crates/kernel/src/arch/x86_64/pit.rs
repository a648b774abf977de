//! # 8254 PIT (Programmable Interval Timer)
//!
//! Channel 0 of the PIT serves two roles here:
//!
//! * the reference clock for calibrating the Local APIC timer: one PIT
//!   tick at 100 Hz is an exact 10 ms yardstick, and
//! * the fallback periodic timer source (through PIC IRQ 0) on machines
//!   where the LAPIC did not come up.
//!
//! The chip has a fixed 1.193182 MHz input; output frequency is selected
//! by a 16-bit divisor. Programming uses mode 3 (square wave) with
//! lobyte/hibyte access, the classic PC configuration.
//!
//! ```text
//! Command 0x36 = channel 0 | lobyte/hibyte | mode 3 | binary
//! Command 0x00 = latch channel 0 (counter read)
//! ```

use x86_64::instructions::port::Port;

/// PIT input frequency in Hz
pub const PIT_FREQUENCY: u32 = 1_193_182;

/// Channel 0 data port
const CHANNEL0: u16 = 0x40;

/// Mode/command register
const COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte, mode 3, binary
const CMD_CH0_MODE3: u8 = 0x36;

/// Latch channel 0 for a coherent counter read
const CMD_CH0_LATCH: u8 = 0x00;

/// Reference frequency used for LAPIC calibration (one tick = 10 ms)
pub const CALIBRATION_HZ: u32 = 100;

/// Divisor that produces `freq_hz` output, saturated to the chip's
/// 16-bit range. The chip treats a divisor of 0 as 65536.
pub const fn divisor_for(freq_hz: u32) -> u16 {
    let raw = PIT_FREQUENCY / freq_hz;
    if raw > 0xFFFF {
        0
    } else if raw < 1 {
        1
    } else {
        raw as u16
    }
}

/// Program channel 0 periodic at the given frequency.
///
/// # Safety
///
/// Reprogramming while IRQ 0 is unmasked shifts the tick train; callers
/// program the channel before unmasking the line.
pub unsafe fn start_periodic(freq_hz: u32) {
    let divisor = divisor_for(freq_hz);
    let mut command: Port<u8> = Port::new(COMMAND);
    let mut channel0: Port<u8> = Port::new(CHANNEL0);

    command.write(CMD_CH0_MODE3);
    channel0.write(divisor as u8);
    channel0.write((divisor >> 8) as u8);
}

/// Latched read of the channel 0 down-counter.
unsafe fn read_count() -> u16 {
    let mut command: Port<u8> = Port::new(COMMAND);
    let mut channel0: Port<u8> = Port::new(CHANNEL0);

    command.write(CMD_CH0_LATCH);
    let low = channel0.read();
    let high = channel0.read();
    u16::from_le_bytes([low, high])
}

/// Busy-wait for exactly one full channel 0 cycle.
///
/// Programs the channel at [`CALIBRATION_HZ`] and spins on the latched
/// counter until it reloads; the down-counter jumping back *up* marks the
/// cycle boundary. Used with interrupts masked during LAPIC calibration.
///
/// # Safety
///
/// Takes over channel 0; the periodic configuration must be restored by
/// the caller if the PIT is the active timer source.
pub unsafe fn wait_one_cycle() {
    start_periodic(CALIBRATION_HZ);

    let mut last = read_count();
    loop {
        let now = read_count();
        if now > last {
            break;
        }
        last = now;
    }
}
