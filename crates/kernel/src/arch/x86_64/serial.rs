//! 16550 UART serial console
//!
//! COM1 is the kernel's log sink. The port is brought up first thing in
//! `kernel_main`; until then (and in hosted tests, always) the writers
//! below are silent no-ops and the log ring is the only capture.

use spin::{Mutex, Once};
use uart_16550::SerialPort;

/// COM1 base I/O port
const COM1_BASE: u16 = 0x3F8;

static COM1: Once<Mutex<SerialPort>> = Once::new();

/// Initialise COM1 (115200 8N1, FIFOs enabled).
///
/// Idempotent; later calls reuse the first port instance.
pub fn init() {
    COM1.call_once(|| {
        let mut port = unsafe { SerialPort::new(COM1_BASE) };
        port.init();
        Mutex::new(port)
    });
}

/// Write raw bytes to COM1; silently discarded before `init`.
pub fn write_bytes(bytes: &[u8]) {
    if let Some(port) = COM1.get() {
        let mut port = port.lock();
        for &byte in bytes {
            port.send(byte);
        }
    }
}

/// Write a single byte to COM1; silently discarded before `init`.
pub fn write_byte(byte: u8) {
    if let Some(port) = COM1.get() {
        port.lock().send(byte);
    }
}
