//! Legacy platform bus
//!
//! Publishes the fixed-function PC devices that no enumerable bus will
//! ever report, currently just the 8042 PS/2 keyboard. Putting them through
//! the Fabric keeps the keyboard driver on the ordinary probe/attach
//! path instead of being a boot-time special case.

use crate::fabric::{Fabric, FabricBus, FabricDevice};

/// Class code used for the legacy input devices this bus publishes.
pub const CLASS_INPUT: u8 = 0x09;

/// 8042 data port, stashed as the device's bus-private cookie.
const PS2_DATA_PORT: u64 = 0x60;

pub struct PlatformBus;

impl FabricBus for PlatformBus {
    fn name(&self) -> &'static str {
        "platform"
    }

    fn enumerate(&self, fabric: &Fabric) {
        let keyboard = FabricDevice::new(
            "ps2-keyboard",
            0,
            0,
            CLASS_INPUT,
            0x00,
            0x00,
            PS2_DATA_PORT,
        );
        if fabric.publish_device(keyboard).is_err() {
            crate::kwarn!("[PLATFORM] device table full, ps2-keyboard not published");
        }
    }
}

/// The singleton platform bus.
pub static PLATFORM_BUS: PlatformBus = PlatformBus;
