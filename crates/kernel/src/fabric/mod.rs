//! # Fabric, the device object model
//!
//! Flat registries for buses, drivers, devices and services, plus the
//! probe/attach matcher that binds them. Storage is fixed-capacity
//! (16 buses, 64 drivers, 256 devices, 64 services) behind one spinlock;
//! the IRQ multiplexer in [`irq`] keeps its own lock.
//!
//! ## Matching discipline
//!
//! `probe` and `attach` are driver code and may take arbitrary time,
//! claim IRQs or publish services, so the registry never holds its lock
//! across them. Walks snapshot an index under the lock, drop it, call
//! into the driver, and re-acquire to record the result:
//!
//! ```text
//! publish_device:  push unbound  → walk drivers (lock dropped per call)
//! register_driver: push          → walk unbound devices likewise
//! ```
//!
//! The first driver whose `probe` says yes *and* whose `attach` succeeds
//! is recorded as the device's driver. A failing `attach` leaves the
//! device unbound and the walk moves on: best-effort bring-up, nothing
//! is rolled back.
//!
//! Handles are plain indexes into the device table; slots are never
//! reused, so a handle stays valid for the kernel's lifetime.

pub mod irq;

use core::any::Any;
use heapless::Vec;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Table capacities
pub const MAX_BUSES: usize = 16;
pub const MAX_DRIVERS: usize = 64;
pub const MAX_DEVICES: usize = 256;
pub const MAX_SERVICES: usize = 64;

/// Index of a published device; stable for the kernel's lifetime.
pub type DeviceHandle = usize;

/// Index of a registered driver.
pub type DriverHandle = usize;

/// A published device. `driver.is_some()` means bound.
#[derive(Debug, Clone, Copy)]
pub struct FabricDevice {
    pub name: &'static str,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
    /// Bus-private cookie: a PCI slot address, a port base, whatever the
    /// publishing bus needs to find the hardware again.
    pub bus_private: u64,
    driver: Option<DriverHandle>,
}

impl FabricDevice {
    pub const fn new(
        name: &'static str,
        vendor_id: u16,
        device_id: u16,
        class_code: u8,
        subclass: u8,
        prog_if: u8,
        bus_private: u64,
    ) -> Self {
        Self {
            name,
            vendor_id,
            device_id,
            class_code,
            subclass,
            prog_if,
            bus_private,
            driver: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.driver.is_some()
    }

    pub fn driver(&self) -> Option<DriverHandle> {
        self.driver
    }
}

/// A bus publishes devices when registered.
pub trait FabricBus: Sync {
    fn name(&self) -> &'static str;

    /// Enumerate and publish this bus's devices into the registry.
    /// Invoked synchronously by `register_bus`.
    fn enumerate(&self, fabric: &Fabric);
}

/// A driver binds to devices through the matcher.
pub trait FabricDriver: Sync {
    fn name(&self) -> &'static str;

    /// Pure match decision; must not touch hardware or registries.
    fn probe(&self, device: &FabricDevice) -> bool;

    /// Claim the device: install handlers, publish services, bring up
    /// hardware. Must be reversible by `detach`.
    fn attach(&self, device: &FabricDevice) -> KernelResult;

    /// Undo `attach`.
    fn detach(&self, device: &FabricDevice) -> KernelResult {
        let _ = device;
        Ok(())
    }

    fn suspend(&self, device: &FabricDevice) -> KernelResult {
        let _ = device;
        Ok(())
    }

    fn resume(&self, device: &FabricDevice) -> KernelResult {
        let _ = device;
        Ok(())
    }
}

/// A named service published by a driver.
///
/// `ops` is a driver-defined operations object; consumers downcast it to
/// the concrete type they expect.
#[derive(Clone, Copy)]
pub struct FabricService {
    pub name: &'static str,
    pub ops: &'static (dyn Any + Send + Sync),
    pub context: u64,
}

struct Tables {
    buses: Vec<&'static dyn FabricBus, MAX_BUSES>,
    drivers: Vec<&'static dyn FabricDriver, MAX_DRIVERS>,
    devices: Vec<FabricDevice, MAX_DEVICES>,
    services: Vec<FabricService, MAX_SERVICES>,
}

/// The registry. One global instance serves the kernel; tests build
/// their own.
pub struct Fabric {
    tables: Mutex<Tables>,
}

impl Fabric {
    pub const fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                buses: Vec::new(),
                drivers: Vec::new(),
                devices: Vec::new(),
                services: Vec::new(),
            }),
        }
    }

    /// Add a bus and run its enumeration synchronously.
    pub fn register_bus(&self, bus: &'static dyn FabricBus) -> KernelResult {
        self.tables
            .lock()
            .buses
            .push(bus)
            .map_err(|_| KernelError::Resource)?;
        crate::kinfo!("[FABRIC] bus {} registered", bus.name());
        bus.enumerate(self);
        Ok(())
    }

    /// Publish a device and try to bind it to a registered driver.
    pub fn publish_device(&self, device: FabricDevice) -> KernelResult<DeviceHandle> {
        let handle = {
            let mut tables = self.tables.lock();
            let handle = tables.devices.len();
            tables
                .devices
                .push(device)
                .map_err(|_| KernelError::Resource)?;
            handle
        };
        crate::kdebug!(
            "[FABRIC] device {} published ({:04x}:{:04x} class {:02x}.{:02x})",
            device.name,
            device.vendor_id,
            device.device_id,
            device.class_code,
            device.subclass
        );

        let driver_count = self.tables.lock().drivers.len();
        for index in 0..driver_count {
            if self.try_bind(handle, index) {
                break;
            }
        }
        Ok(handle)
    }

    /// Add a driver and walk the already-published devices for matches.
    pub fn register_driver(&self, driver: &'static dyn FabricDriver) -> KernelResult<DriverHandle> {
        let handle = {
            let mut tables = self.tables.lock();
            let handle = tables.drivers.len();
            tables
                .drivers
                .push(driver)
                .map_err(|_| KernelError::Resource)?;
            handle
        };
        crate::kinfo!("[FABRIC] driver {} registered", driver.name());

        let device_count = self.tables.lock().devices.len();
        for device in 0..device_count {
            self.try_bind(device, handle);
        }
        Ok(handle)
    }

    /// Attempt one device/driver pairing with the lock dropped around
    /// the driver calls. Returns true when the device ended up bound
    /// (by this driver or concurrently by another walk).
    fn try_bind(&self, device_handle: DeviceHandle, driver_handle: DriverHandle) -> bool {
        let (snapshot, driver) = {
            let tables = self.tables.lock();
            let device = match tables.devices.get(device_handle) {
                Some(d) => *d,
                None => return false,
            };
            if device.is_bound() {
                return true;
            }
            let driver = match tables.drivers.get(driver_handle) {
                Some(d) => *d,
                None => return false,
            };
            (device, driver)
        };

        if !driver.probe(&snapshot) {
            return false;
        }

        match driver.attach(&snapshot) {
            Ok(()) => {
                let mut tables = self.tables.lock();
                if let Some(device) = tables.devices.get_mut(device_handle) {
                    if device.is_bound() {
                        return true;
                    }
                    device.driver = Some(driver_handle);
                }
                crate::kinfo!(
                    "[FABRIC] {} bound to {}",
                    snapshot.name,
                    driver.name()
                );
                true
            }
            Err(err) => {
                // Best-effort bring-up: the device stays unbound and the
                // system stays live.
                crate::kwarn!(
                    "[FABRIC] attach of {} to {} failed: {}",
                    snapshot.name,
                    driver.name(),
                    err
                );
                false
            }
        }
    }

    /// Unbind a device, running its driver's `detach`.
    pub fn detach_device(&self, handle: DeviceHandle) -> KernelResult {
        let (snapshot, driver) = {
            let tables = self.tables.lock();
            let device = *tables.devices.get(handle).ok_or(KernelError::InvalidArg)?;
            let driver_handle = device.driver.ok_or(KernelError::NotPresent)?;
            (device, tables.drivers[driver_handle])
        };

        driver.detach(&snapshot)?;

        let mut tables = self.tables.lock();
        if let Some(device) = tables.devices.get_mut(handle) {
            device.driver = None;
        }
        Ok(())
    }

    /// Snapshot of a published device.
    pub fn device(&self, handle: DeviceHandle) -> Option<FabricDevice> {
        self.tables.lock().devices.get(handle).copied()
    }

    pub fn device_count(&self) -> usize {
        self.tables.lock().devices.len()
    }

    pub fn bound_count(&self) -> usize {
        self.tables
            .lock()
            .devices
            .iter()
            .filter(|d| d.is_bound())
            .count()
    }

    /// Publish a named service. Names are not deduplicated; lookup
    /// returns the first registration.
    pub fn publish_service(&self, service: FabricService) -> KernelResult {
        self.tables
            .lock()
            .services
            .push(service)
            .map_err(|_| KernelError::Resource)?;
        crate::kinfo!("[FABRIC] service {} published", service.name);
        Ok(())
    }

    /// Linear name lookup, first match wins.
    pub fn lookup_service(&self, name: &str) -> Option<FabricService> {
        self.tables
            .lock()
            .services
            .iter()
            .find(|s| s.name == name)
            .copied()
    }
}

/// The kernel's registry.
static FABRIC: Fabric = Fabric::new();

/// Access the global registry.
pub fn fabric() -> &'static Fabric {
    &FABRIC
}

/// Register a bus with the global registry (enumerates synchronously).
pub fn register_bus(bus: &'static dyn FabricBus) -> KernelResult {
    FABRIC.register_bus(bus)
}

/// Register a driver with the global registry.
pub fn register_driver(driver: &'static dyn FabricDriver) -> KernelResult<DriverHandle> {
    FABRIC.register_driver(driver)
}

/// Publish a device to the global registry.
pub fn publish_device(device: FabricDevice) -> KernelResult<DeviceHandle> {
    FABRIC.publish_device(device)
}

/// Publish a service to the global registry.
pub fn publish_service(service: FabricService) -> KernelResult {
    FABRIC.publish_service(service)
}

/// Look up a service in the global registry.
pub fn lookup_service(name: &str) -> Option<FabricService> {
    FABRIC.lookup_service(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct ClassDriver {
        name: &'static str,
        class_code: u8,
        attaches: AtomicUsize,
        detaches: AtomicUsize,
        fail_attach: bool,
    }

    impl ClassDriver {
        const fn matching(name: &'static str, class_code: u8) -> Self {
            Self {
                name,
                class_code,
                attaches: AtomicUsize::new(0),
                detaches: AtomicUsize::new(0),
                fail_attach: false,
            }
        }

        const fn failing(name: &'static str, class_code: u8) -> Self {
            Self {
                name,
                class_code,
                attaches: AtomicUsize::new(0),
                detaches: AtomicUsize::new(0),
                fail_attach: true,
            }
        }
    }

    impl FabricDriver for ClassDriver {
        fn name(&self) -> &'static str {
            self.name
        }

        fn probe(&self, device: &FabricDevice) -> bool {
            device.class_code == self.class_code
        }

        fn attach(&self, _device: &FabricDevice) -> KernelResult {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            if self.fail_attach {
                Err(KernelError::Busy)
            } else {
                Ok(())
            }
        }

        fn detach(&self, _device: &FabricDevice) -> KernelResult {
            self.detaches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_device(name: &'static str, class_code: u8) -> FabricDevice {
        FabricDevice::new(name, 0x1234, 0x5678, class_code, 0, 0, 0)
    }

    #[test]
    fn test_driver_then_device_binds() {
        static DRIVER: ClassDriver = ClassDriver::matching("input-a", 0x09);
        let fabric = Fabric::new();

        let driver = fabric.register_driver(&DRIVER).unwrap();
        let device = fabric.publish_device(sample_device("kbd", 0x09)).unwrap();

        let snapshot = fabric.device(device).unwrap();
        assert!(snapshot.is_bound());
        assert_eq!(snapshot.driver(), Some(driver));
        assert_eq!(DRIVER.attaches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_then_driver_binds() {
        static DRIVER: ClassDriver = ClassDriver::matching("input-b", 0x09);
        let fabric = Fabric::new();

        let device = fabric.publish_device(sample_device("kbd", 0x09)).unwrap();
        assert!(!fabric.device(device).unwrap().is_bound());

        fabric.register_driver(&DRIVER).unwrap();
        assert!(fabric.device(device).unwrap().is_bound());
    }

    #[test]
    fn test_non_matching_driver_stays_unbound() {
        static DRIVER: ClassDriver = ClassDriver::matching("net", 0x02);
        let fabric = Fabric::new();

        fabric.register_driver(&DRIVER).unwrap();
        let device = fabric.publish_device(sample_device("kbd", 0x09)).unwrap();

        assert!(!fabric.device(device).unwrap().is_bound());
        assert_eq!(DRIVER.attaches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_first_successful_driver_wins() {
        static FIRST: ClassDriver = ClassDriver::matching("first", 0x09);
        static SECOND: ClassDriver = ClassDriver::matching("second", 0x09);
        let fabric = Fabric::new();

        let first = fabric.register_driver(&FIRST).unwrap();
        fabric.register_driver(&SECOND).unwrap();
        let device = fabric.publish_device(sample_device("kbd", 0x09)).unwrap();

        assert_eq!(fabric.device(device).unwrap().driver(), Some(first));
        assert_eq!(SECOND.attaches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_attach_falls_through_to_next_driver() {
        static BROKEN: ClassDriver = ClassDriver::failing("broken", 0x09);
        static WORKING: ClassDriver = ClassDriver::matching("working", 0x09);
        let fabric = Fabric::new();

        fabric.register_driver(&BROKEN).unwrap();
        let working = fabric.register_driver(&WORKING).unwrap();
        let device = fabric.publish_device(sample_device("kbd", 0x09)).unwrap();

        assert_eq!(BROKEN.attaches.load(Ordering::SeqCst), 1);
        assert_eq!(fabric.device(device).unwrap().driver(), Some(working));
    }

    #[test]
    fn test_failed_attach_leaves_system_live() {
        static BROKEN: ClassDriver = ClassDriver::failing("broken", 0x09);
        let fabric = Fabric::new();

        fabric.register_driver(&BROKEN).unwrap();
        let device = fabric.publish_device(sample_device("kbd", 0x09)).unwrap();

        assert!(!fabric.device(device).unwrap().is_bound());
        // The registry still accepts further work.
        let other = fabric.publish_device(sample_device("mouse", 0x0A)).unwrap();
        assert_eq!(fabric.device_count(), 2);
        assert!(!fabric.device(other).unwrap().is_bound());
    }

    #[test]
    fn test_detach_reverses_attach() {
        static DRIVER: ClassDriver = ClassDriver::matching("input-c", 0x09);
        let fabric = Fabric::new();

        fabric.register_driver(&DRIVER).unwrap();
        let device = fabric.publish_device(sample_device("kbd", 0x09)).unwrap();
        assert!(fabric.device(device).unwrap().is_bound());

        fabric.detach_device(device).unwrap();
        assert!(!fabric.device(device).unwrap().is_bound());
        assert_eq!(DRIVER.detaches.load(Ordering::SeqCst), 1);

        assert_eq!(fabric.detach_device(device), Err(KernelError::NotPresent));
    }

    #[test]
    fn test_bus_enumeration_publishes_synchronously() {
        struct TwoPortBus;
        impl FabricBus for TwoPortBus {
            fn name(&self) -> &'static str {
                "two-port"
            }
            fn enumerate(&self, fabric: &Fabric) {
                fabric
                    .publish_device(sample_device("port0", 0x0C))
                    .unwrap();
                fabric
                    .publish_device(sample_device("port1", 0x0C))
                    .unwrap();
            }
        }
        static BUS: TwoPortBus = TwoPortBus;

        let fabric = Fabric::new();
        fabric.register_bus(&BUS).unwrap();
        assert_eq!(fabric.device_count(), 2);
    }

    #[test]
    fn test_service_lookup_first_match_wins() {
        static OPS_A: u32 = 0xA;
        static OPS_B: u32 = 0xB;
        let fabric = Fabric::new();

        fabric
            .publish_service(FabricService {
                name: "console",
                ops: &OPS_A,
                context: 1,
            })
            .unwrap();
        fabric
            .publish_service(FabricService {
                name: "console",
                ops: &OPS_B,
                context: 2,
            })
            .unwrap();

        let hit = fabric.lookup_service("console").unwrap();
        assert_eq!(hit.context, 1);
        assert_eq!(hit.ops.downcast_ref::<u32>(), Some(&0xA));
        assert!(fabric.lookup_service("missing").is_none());
    }

    #[test]
    fn test_service_table_capacity_is_enforced() {
        static OPS: u32 = 0;
        let fabric = Fabric::new();

        for _ in 0..MAX_SERVICES {
            fabric
                .publish_service(FabricService {
                    name: "filler",
                    ops: &OPS,
                    context: 0,
                })
                .unwrap();
        }
        assert_eq!(
            fabric.publish_service(FabricService {
                name: "overflow",
                ops: &OPS,
                context: 0,
            }),
            Err(KernelError::Resource)
        );
    }
}
