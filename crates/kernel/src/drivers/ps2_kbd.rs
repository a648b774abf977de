//! PS/2 keyboard driver (8042 controller)
//!
//! The producer end of the input pipeline. `attach` configures the 8042
//! (keyboard port enabled, IRQ 1 on, scancode set 1 translation), claims
//! the keyboard vector through the IRQ multiplexer, unmasks the line at
//! whichever controller routes it, and tells the device to start
//! scanning. The IRQ handler itself does one thing: read the data port
//! and feed the byte to the scancode ring. Translation happens on the
//! consumer side, never in interrupt context.

use bitflags::bitflags;
use x86_64::instructions::port::Port;

use crate::error::KernelResult;
use crate::fabric::{irq, FabricDevice, FabricDriver};
use crate::input;

/// 8042 data port (read scancodes, write device commands)
const DATA_PORT: u16 = 0x60;

/// 8042 status (read) / command (write) port
const STATUS_PORT: u16 = 0x64;

bitflags! {
    /// 8042 status register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ps2Status: u8 {
        /// Output buffer full: a byte is waiting on the data port
        const OUTPUT_FULL = 1 << 0;
        /// Input buffer full: the controller is still busy with the
        /// previous write
        const INPUT_FULL  = 1 << 1;
        /// Passed self-test
        const SYSTEM      = 1 << 2;
        /// Last write went to the command port
        const COMMAND     = 1 << 3;
    }
}

// Controller commands
const CMD_READ_CONFIG: u8 = 0x20;
const CMD_WRITE_CONFIG: u8 = 0x60;
const CMD_DISABLE_MOUSE: u8 = 0xA7;
const CMD_ENABLE_KEYBOARD: u8 = 0xAE;

// Controller configuration bits
const CONFIG_KEYBOARD_INTERRUPT: u8 = 0x01;
const CONFIG_MOUSE_INTERRUPT: u8 = 0x02;
const CONFIG_KEYBOARD_DISABLE: u8 = 0x10;
const CONFIG_TRANSLATE: u8 = 0x40;

/// Device command: enable scanning
const DEV_ENABLE_SCANNING: u8 = 0xF4;

/// Keyboard hardware IRQ and its remapped vector
pub const KEYBOARD_IRQ: u8 = 1;
pub const KEYBOARD_VECTOR: u8 = 33;

/// Bounded poll of the status register.
fn wait_status(set: Ps2Status, want: bool) {
    let mut status_port: Port<u8> = Port::new(STATUS_PORT);
    for _ in 0..10_000 {
        let status = Ps2Status::from_bits_truncate(unsafe { status_port.read() });
        if status.contains(set) == want {
            return;
        }
    }
}

/// Configure the 8042: keyboard port on, IRQ 1 on, set 1 translation,
/// mouse path off.
///
/// # Safety
///
/// Kernel context with interrupts still masked for IRQ 1.
unsafe fn controller_init() {
    let mut data: Port<u8> = Port::new(DATA_PORT);
    let mut command: Port<u8> = Port::new(STATUS_PORT);

    command.write(CMD_DISABLE_MOUSE);

    // Flush anything stale out of the output buffer.
    data.read();

    command.write(CMD_READ_CONFIG);
    wait_status(Ps2Status::OUTPUT_FULL, true);
    let mut config = data.read();

    config |= CONFIG_KEYBOARD_INTERRUPT | CONFIG_TRANSLATE;
    config &= !(CONFIG_MOUSE_INTERRUPT | CONFIG_KEYBOARD_DISABLE);

    command.write(CMD_WRITE_CONFIG);
    wait_status(Ps2Status::INPUT_FULL, false);
    data.write(config);

    command.write(CMD_ENABLE_KEYBOARD);

    // Tell the device itself to stream make/break codes.
    wait_status(Ps2Status::INPUT_FULL, false);
    data.write(DEV_ENABLE_SCANNING);
}

/// IRQ 1 handler: pull the byte and hand it to the scancode ring.
/// A full ring drops the byte; the EOI is the dispatcher's job.
fn keyboard_irq(_vector: u8, _arg: usize) {
    let byte = unsafe { Port::<u8>::new(DATA_PORT).read() };
    input::push_scancode(byte);
}

pub struct Ps2KeyboardDriver;

impl FabricDriver for Ps2KeyboardDriver {
    fn name(&self) -> &'static str {
        "ps2-kbd"
    }

    fn probe(&self, device: &FabricDevice) -> bool {
        device.name == "ps2-keyboard"
    }

    fn attach(&self, _device: &FabricDevice) -> KernelResult {
        irq::request_irq(KEYBOARD_VECTOR, keyboard_irq, DATA_PORT as usize)?;

        unsafe {
            controller_init();
            if crate::arch::x86_64::ioapic::is_enabled() {
                crate::arch::x86_64::ioapic::enable_irq(KEYBOARD_IRQ)?;
            } else {
                crate::arch::x86_64::pic::enable_irq(KEYBOARD_IRQ);
            }
        }

        crate::kinfo!("[PS2] keyboard attached on IRQ {}", KEYBOARD_IRQ);
        Ok(())
    }

    fn detach(&self, _device: &FabricDevice) -> KernelResult {
        unsafe {
            if crate::arch::x86_64::ioapic::is_enabled() {
                crate::arch::x86_64::ioapic::disable_irq(KEYBOARD_IRQ)?;
            } else {
                crate::arch::x86_64::pic::disable_irq(KEYBOARD_IRQ);
            }
        }
        irq::free_irq(KEYBOARD_VECTOR, keyboard_irq)
    }
}

/// The singleton keyboard driver.
pub static PS2_KEYBOARD_DRIVER: Ps2KeyboardDriver = Ps2KeyboardDriver;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::platform::CLASS_INPUT;

    #[test]
    fn test_probe_matches_the_platform_keyboard_only() {
        let keyboard = FabricDevice::new("ps2-keyboard", 0, 0, CLASS_INPUT, 0, 0, 0x60);
        let mouse = FabricDevice::new("ps2-mouse", 0, 0, CLASS_INPUT, 0, 0, 0x60);
        let nic = FabricDevice::new("pci-network", 0x8086, 0x100E, 0x02, 0, 0, 0);

        assert!(PS2_KEYBOARD_DRIVER.probe(&keyboard));
        assert!(!PS2_KEYBOARD_DRIVER.probe(&mouse));
        assert!(!PS2_KEYBOARD_DRIVER.probe(&nic));
    }

    #[test]
    fn test_keyboard_vector_is_irq_plus_base() {
        assert_eq!(KEYBOARD_VECTOR, 32 + KEYBOARD_IRQ);
    }

    #[test]
    fn test_status_bits() {
        let status = Ps2Status::from_bits_truncate(0x03);
        assert!(status.contains(Ps2Status::OUTPUT_FULL));
        assert!(status.contains(Ps2Status::INPUT_FULL));
    }
}
