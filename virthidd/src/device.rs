//! Virtual device representation and registry

use libvirthid::ConnectionRef;

/// A virtual HID device
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    /// Unique device name
    name: Vec<u8>,
    /// Serial number string
    serial_number: Vec<u8>,
    vendor_id: u32,
    product_id: u32,
    /// HID report descriptor, opaque to the bridge
    report_descriptor: Vec<u8>,
    /// Input reports received from the client
    input_reports: u64,
    last_input: Option<Vec<u8>>,
    /// Connection receiving this device's output reports
    subscriber: Option<ConnectionRef>,
}

impl VirtualDevice {
    pub fn new(
        name: &[u8],
        report_descriptor: &[u8],
        serial_number: &[u8],
        vendor_id: u32,
        product_id: u32,
    ) -> Self {
        Self {
            name: name.to_vec(),
            serial_number: serial_number.to_vec(),
            vendor_id,
            product_id,
            report_descriptor: report_descriptor.to_vec(),
            input_reports: 0,
            last_input: None,
            subscriber: None,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Name for log output
    pub fn display_name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn serial_number(&self) -> &[u8] {
        &self.serial_number
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u32 {
        self.product_id
    }

    pub fn report_descriptor(&self) -> &[u8] {
        &self.report_descriptor
    }

    pub fn input_reports(&self) -> u64 {
        self.input_reports
    }

    pub fn last_input(&self) -> Option<&[u8]> {
        self.last_input.as_deref()
    }

    /// Record a client-originated input report
    pub fn handle_input(&mut self, report: &[u8]) {
        self.input_reports += 1;
        self.last_input = Some(report.to_vec());
    }

    /// Route output reports to `connection`, replacing any previous subscriber
    pub fn subscribe(&mut self, connection: ConnectionRef) {
        self.subscriber = Some(connection);
    }

    pub fn subscriber(&self) -> Option<&ConnectionRef> {
        self.subscriber.as_ref()
    }
}

/// Device registry, in creation order
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<VirtualDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device; fails if the name is taken
    pub fn add(&mut self, device: VirtualDevice) -> bool {
        if self.get(device.name()).is_some() {
            return false;
        }
        self.devices.push(device);
        true
    }

    /// Remove a device by name
    pub fn remove(&mut self, name: &[u8]) -> Option<VirtualDevice> {
        let index = self.devices.iter().position(|d| d.name() == name)?;
        Some(self.devices.remove(index))
    }

    pub fn get(&self, name: &[u8]) -> Option<&VirtualDevice> {
        self.devices.iter().find(|d| d.name() == name)
    }

    pub fn get_mut(&mut self, name: &[u8]) -> Option<&mut VirtualDevice> {
        self.devices.iter_mut().find(|d| d.name() == name)
    }

    pub fn all(&self) -> impl Iterator<Item = &VirtualDevice> {
        self.devices.iter()
    }

    pub fn count(&self) -> usize {
        self.devices.len()
    }
}
