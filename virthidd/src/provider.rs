//! Reference device provider backing the bridge

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use libvirthid::{ConnectionRef, Error, ListOutcome, Provider};
use tracing::{debug, info, warn};

use crate::config::LimitsConfig;
use crate::device::{DeviceRegistry, VirtualDevice};

/// In-memory virtual HID provider
pub struct HidProvider {
    devices: RwLock<DeviceRegistry>,
    limits: LimitsConfig,
}

impl HidProvider {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            devices: RwLock::new(DeviceRegistry::new()),
            limits,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, DeviceRegistry> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DeviceRegistry> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn device_count(&self) -> usize {
        self.read().count()
    }

    /// Snapshot of a device's properties
    pub fn device(&self, name: &[u8]) -> Option<VirtualDevice> {
        self.read().get(name).cloned()
    }

    /// Push a host-originated report to the device's subscriber
    pub fn set_report(&self, name: &[u8], report: &[u8]) -> libvirthid::Result<()> {
        // The registry lock is not held across delivery, which may sleep
        let subscriber = {
            let devices = self.read();
            let device = devices
                .get(name)
                .ok_or(Error::DeviceError("unknown device"))?;
            device
                .subscriber()
                .cloned()
                .ok_or(Error::FailedPrecondition("no subscriber registered"))?
        };
        subscriber.notify(report)
    }
}

/// Lossy name for log output
fn lossy_name(name: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(name)
}

impl Provider for HidProvider {
    fn create(
        &self,
        name: &[u8],
        descriptor: &[u8],
        serial: &[u8],
        vendor_id: u32,
        product_id: u32,
    ) -> bool {
        if name.is_empty() || descriptor.len() > self.limits.max_descriptor_len {
            warn!("Rejected device {}: bad name or descriptor", lossy_name(name));
            return false;
        }

        let mut devices = self.write();
        if devices.count() >= self.limits.max_devices {
            warn!("Device limit ({}) reached", self.limits.max_devices);
            return false;
        }

        let device = VirtualDevice::new(name, descriptor, serial, vendor_id, product_id);
        if !devices.add(device) {
            warn!("Device {} already exists", lossy_name(name));
            return false;
        }

        info!(
            "Created device {} ({:04x}:{:04x})",
            lossy_name(name),
            vendor_id,
            product_id
        );
        true
    }

    fn destroy(&self, name: &[u8]) -> bool {
        match self.write().remove(name) {
            Some(device) => {
                info!(
                    "Destroyed device {} ({:04x}:{:04x}, serial {}, {} byte descriptor, {} input reports)",
                    device.display_name(),
                    device.vendor_id(),
                    device.product_id(),
                    lossy_name(device.serial_number()),
                    device.report_descriptor().len(),
                    device.input_reports()
                );
                true
            }
            None => false,
        }
    }

    fn send(&self, name: &[u8], report: &[u8]) -> bool {
        let mut devices = self.write();
        match devices.get_mut(name) {
            Some(device) => {
                device.handle_input(report);
                debug!("{}: input report ({} bytes)", device.display_name(), report.len());
                true
            }
            None => false,
        }
    }

    fn list(&self, destination: &mut [u8]) -> Option<ListOutcome> {
        let devices = self.read();
        let mut needed = 0usize;
        let mut written = 0usize;
        let mut items = 0usize;
        let mut full = false;

        for device in devices.all() {
            let entry = device.name();
            let size = entry.len() + 1;
            needed += size;

            // Whole entries only; stop at the first one that does not fit
            if full || written + size > destination.len() {
                full = true;
                continue;
            }
            destination[written..written + entry.len()].copy_from_slice(entry);
            destination[written + entry.len()] = 0;
            written += size;
            items += 1;
        }

        Some(ListOutcome {
            needed: u16::try_from(needed).unwrap_or(u16::MAX),
            items: u16::try_from(items).unwrap_or(u16::MAX),
        })
    }

    fn subscribe(&self, name: &[u8], connection: ConnectionRef) -> bool {
        let mut devices = self.write();
        match devices.get_mut(name) {
            Some(device) => {
                debug!("{}: subscriber {:?}", device.display_name(), connection);
                device.subscribe(connection);
                true
            }
            None => false,
        }
    }
}
