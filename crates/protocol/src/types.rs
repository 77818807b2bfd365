//! USB type definitions
//!
//! Device descriptors as seen by the streaming core, the endpoint selector
//! that addresses a bulk channel, and the result of a single transfer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction bit of a USB endpoint address (set = device-to-host)
const ENDPOINT_DIR_IN: u8 = 0x80;

/// Mask of the endpoint number inside an endpoint address
const ENDPOINT_NUMBER_MASK: u8 = 0x0f;

/// Unique device identifier (host-assigned)
///
/// Opaque handle to a physical device. Stable while the device stays
/// attached; a replug yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Device descriptor returned by enumeration
///
/// The vendor id is what the registry filters on; the remaining fields are
/// informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Host-assigned device identifier
    pub id: DeviceId,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Bus number on the host
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
    /// Product string (if it could be read)
    pub product: Option<String>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:04x}:{:04x} (bus {} addr {})",
            self.id, self.vendor_id, self.product_id, self.bus_number, self.device_address
        )?;
        if let Some(product) = &self.product {
            write!(f, " {}", product)?;
        }
        Ok(())
    }
}

/// Addresses one bulk channel of a device
///
/// Fixed per adapter variant. `configuration` is the bConfigurationValue,
/// `endpoint` the bare endpoint number (direction bit clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointSelector {
    pub configuration: u8,
    pub interface: u8,
    pub alternate: u8,
    pub endpoint: u8,
}

impl EndpointSelector {
    pub const fn new(configuration: u8, interface: u8, alternate: u8, endpoint: u8) -> Self {
        Self {
            configuration,
            interface,
            alternate,
            endpoint: endpoint & ENDPOINT_NUMBER_MASK,
        }
    }

    /// Endpoint address for host-to-device (bulk-out) transfers
    pub const fn out_address(&self) -> u8 {
        self.endpoint & ENDPOINT_NUMBER_MASK
    }

    /// Endpoint address for device-to-host (bulk-in) transfers
    pub const fn in_address(&self) -> u8 {
        (self.endpoint & ENDPOINT_NUMBER_MASK) | ENDPOINT_DIR_IN
    }
}

/// Completion status of a transfer that reached the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Transfer completed
    Ok,
    /// Endpoint halted
    Stall,
    /// Device sent more data than requested
    Babble,
}

/// Result of one bulk transfer
///
/// Transport-level failures are not represented here; they surface as
/// [`UsbError`](crate::UsbError) instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub status: TransferStatus,
    /// Bytes received (bulk-in) or empty (bulk-out)
    pub payload: Vec<u8>,
}

impl TransferResult {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            status: TransferStatus::Ok,
            payload,
        }
    }

    pub fn stall() -> Self {
        Self {
            status: TransferStatus::Stall,
            payload: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == TransferStatus::Ok
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Hot-plug notification
///
/// Emitted for devices of any vendor; consumers filter themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HotplugEvent {
    Connected {
        bus_number: u8,
        device_address: u8,
        vendor_id: Option<u16>,
    },
    Disconnected {
        bus_number: u8,
        device_address: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_addresses() {
        let selector = EndpointSelector::new(1, 1, 0, 1);
        assert_eq!(selector.out_address(), 0x01);
        assert_eq!(selector.in_address(), 0x81);
    }

    #[test]
    fn test_selector_strips_direction_bit() {
        let selector = EndpointSelector::new(1, 0, 0, 0x82);
        assert_eq!(selector.endpoint, 2);
        assert_eq!(selector.out_address(), 0x02);
        assert_eq!(selector.in_address(), 0x82);
    }

    #[test]
    fn test_transfer_result_helpers() {
        let ok = TransferResult::ok(vec![1, 2, 3]);
        assert!(ok.is_ok());
        assert!(!ok.is_empty());

        let stall = TransferResult::stall();
        assert!(!stall.is_ok());
        assert!(stall.is_empty());
    }

    #[test]
    fn test_device_info_display() {
        let info = DeviceInfo {
            id: DeviceId(3),
            vendor_id: 0x2ec2,
            product_id: 0x0004,
            bus_number: 1,
            device_address: 7,
            product: Some("Live S".to_string()),
        };
        assert_eq!(info.to_string(), "#3 2ec2:0004 (bus 1 addr 7) Live S");
    }
}
