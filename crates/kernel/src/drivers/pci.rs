//! PCI bus enumeration
//!
//! Legacy configuration-space access through the 0xCF8/0xCFC port pair.
//! The address register encodes the target function:
//!
//! ```text
//! 31      enable
//! 23-16   bus
//! 15-11   device
//! 10-8    function
//! 7-2     dword-aligned register offset
//! ```
//!
//! Enumeration walks every bus/device/function, skips empty slots
//! (vendor 0xFFFF), honours the multi-function bit in the header type,
//! and publishes one Fabric device per discovered function with its
//! vendor/device/class identity and the packed slot address as the
//! bus-private cookie.

use x86_64::instructions::port::Port;

use crate::fabric::{Fabric, FabricBus, FabricDevice};

/// Configuration address register
const CONFIG_ADDRESS: u16 = 0xCF8;

/// Configuration data window
const CONFIG_DATA: u16 = 0xCFC;

/// Vendor ID read from an empty slot
const VENDOR_NONE: u16 = 0xFFFF;

/// Compose the CONFIG_ADDRESS value for one register of one function.
pub const fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    (1 << 31)
        | ((bus as u32) << 16)
        | ((device as u32) << 11)
        | ((function as u32) << 8)
        | (offset as u32 & !3)
}

/// Pack a function's location into the Fabric bus-private cookie.
pub const fn slot_cookie(bus: u8, device: u8, function: u8) -> u64 {
    ((bus as u64) << 8) | ((device as u64) << 3) | (function as u64)
}

/// Read one configuration dword.
///
/// # Safety
///
/// Port I/O; kernel context only.
unsafe fn config_read32(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    Port::<u32>::new(CONFIG_ADDRESS).write(config_address(bus, device, function, offset));
    Port::<u32>::new(CONFIG_DATA).read()
}

/// Stable display name for a function, by class code.
pub fn class_name(class_code: u8) -> &'static str {
    match class_code {
        0x01 => "pci-storage",
        0x02 => "pci-network",
        0x03 => "pci-display",
        0x04 => "pci-multimedia",
        0x05 => "pci-memory",
        0x06 => "pci-bridge",
        0x07 => "pci-comm",
        0x08 => "pci-system",
        0x09 => "pci-input",
        0x0C => "pci-serial-bus",
        _ => "pci-device",
    }
}

pub struct PciBus;

impl PciBus {
    /// Probe one function; returns its published-device description or
    /// `None` for an empty slot.
    unsafe fn probe_function(bus: u8, device: u8, function: u8) -> Option<FabricDevice> {
        let id = config_read32(bus, device, function, 0x00);
        let vendor_id = id as u16;
        if vendor_id == VENDOR_NONE {
            return None;
        }
        let device_id = (id >> 16) as u16;

        let class_reg = config_read32(bus, device, function, 0x08);
        let class_code = (class_reg >> 24) as u8;
        let subclass = (class_reg >> 16) as u8;
        let prog_if = (class_reg >> 8) as u8;

        Some(FabricDevice::new(
            class_name(class_code),
            vendor_id,
            device_id,
            class_code,
            subclass,
            prog_if,
            slot_cookie(bus, device, function),
        ))
    }

    unsafe fn is_multifunction(bus: u8, device: u8) -> bool {
        let header = config_read32(bus, device, 0, 0x0C);
        (header >> 16) as u8 & 0x80 != 0
    }
}

impl FabricBus for PciBus {
    fn name(&self) -> &'static str {
        "pci"
    }

    fn enumerate(&self, fabric: &Fabric) {
        let mut found = 0usize;
        for bus in 0..=255u8 {
            for device in 0..32u8 {
                let first = unsafe { Self::probe_function(bus, device, 0) };
                let Some(first) = first else { continue };

                let functions = if unsafe { Self::is_multifunction(bus, device) } {
                    8
                } else {
                    1
                };

                if fabric.publish_device(first).is_ok() {
                    found += 1;
                }
                for function in 1..functions {
                    if let Some(dev) = unsafe { Self::probe_function(bus, device, function) } {
                        if fabric.publish_device(dev).is_ok() {
                            found += 1;
                        }
                    }
                }
            }
        }
        crate::kinfo!("[PCI] enumeration complete, {} functions", found);
    }
}

/// The singleton PCI bus.
pub static PCI_BUS: PciBus = PciBus;
