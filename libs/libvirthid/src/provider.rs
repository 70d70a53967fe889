//! Interface to the component that owns the virtual devices

use crate::connection::ConnectionRef;

/// Result of a successful device enumeration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListOutcome {
    /// Bytes required to hold the complete listing
    pub needed: u16,
    /// Entries actually written to the destination
    pub items: u16,
}

/// Virtual device provider
///
/// Names, descriptors and reports are opaque byte strings to the bridge. A
/// `false` (or `None`) return is reported to the client as a device error.
pub trait Provider: Send + Sync {
    /// Create a device
    fn create(
        &self,
        name: &[u8],
        descriptor: &[u8],
        serial: &[u8],
        vendor_id: u32,
        product_id: u32,
    ) -> bool;

    /// Destroy a device by name
    fn destroy(&self, name: &[u8]) -> bool;

    /// Feed a client-originated report to a device
    fn send(&self, name: &[u8], report: &[u8]) -> bool;

    /// Enumerate devices into `destination`
    ///
    /// Capacity is `destination.len()`. The provider must not write past it
    /// and reports the size the complete listing would need.
    fn list(&self, destination: &mut [u8]) -> Option<ListOutcome>;

    /// Route a device's host-originated reports to `connection`
    fn subscribe(&self, name: &[u8], connection: ConnectionRef) -> bool;
}
