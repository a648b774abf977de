//! Architecture support
//!
//! RodNIX targets x86_64 PC hardware; other architecture ports live behind
//! the same function surface (`console_write`, `wait_for_interrupt`,
//! interrupt-flag control) but are out of scope for this tree.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Write raw bytes to the boot console.
///
/// A no-op until the serial port has been initialised, so logging is safe
/// from the earliest boot paths (and from hosted tests, which never
/// initialise a port).
pub fn console_write(bytes: &[u8]) {
    #[cfg(target_arch = "x86_64")]
    x86_64::serial::write_bytes(bytes);
    #[cfg(not(target_arch = "x86_64"))]
    let _ = bytes;
}

/// Idle the CPU until the next interrupt arrives.
#[cfg(target_arch = "x86_64")]
pub fn wait_for_interrupt() {
    x86_64::wait_for_interrupt();
}

/// Enable hardware interrupt delivery.
#[cfg(target_arch = "x86_64")]
pub fn interrupts_enable() {
    x86_64::interrupts_enable();
}

/// Disable hardware interrupt delivery.
#[cfg(target_arch = "x86_64")]
pub fn interrupts_disable() {
    x86_64::interrupts_disable();
}

/// Stop the CPU permanently; used by fatal exception and panic paths.
#[cfg(target_arch = "x86_64")]
pub fn halt_forever() -> ! {
    x86_64::halt_forever();
}
