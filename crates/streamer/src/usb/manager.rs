//! USB device manager
//!
//! Owns every attached device on the USB thread: id assignment, the
//! authorization flags, exclusive open and the per-device operations.
//! The device table is resynced with the bus on every enumeration.

use crate::usb::device::UsbDevice;
use crate::usb::transfers::{self, map_rusb_error};
use protocol::{DeviceId, DeviceInfo, EndpointSelector, TransferResult, UsbError};
use rusb::{Context, Device, UsbContext};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Linux Foundation, the vendor of root hubs
const ROOT_HUB_VENDOR: u16 = 0x1d6b;
const HUB_CLASS: u8 = 9;

/// USB device manager
pub struct DeviceManager {
    context: Context,
    /// Attached devices by (bus, address)
    devices: HashMap<(u8, u8), UsbDevice>,
    device_ids: HashMap<DeviceId, (u8, u8)>,
    next_device_id: u32,
    /// Authorize devices as soon as they are seen
    auto_authorize: bool,
    transfer_timeout: Duration,
}

impl DeviceManager {
    pub fn new(context: Context, auto_authorize: bool, transfer_timeout: Duration) -> Self {
        Self {
            context,
            devices: HashMap::new(),
            device_ids: HashMap::new(),
            next_device_id: 1,
            auto_authorize,
            transfer_timeout,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Resync the device table with the bus
    pub fn refresh(&mut self) -> Result<(), UsbError> {
        let attached = self.context.devices().map_err(map_rusb_error)?;
        let mut present = HashSet::new();

        for device in attached.iter() {
            let key = (device.bus_number(), device.address());
            present.insert(key);
            if !self.devices.contains_key(&key) {
                self.add_device(device);
            }
        }

        let gone: Vec<_> = self
            .devices
            .keys()
            .filter(|key| !present.contains(*key))
            .copied()
            .collect();
        for (bus, address) in gone {
            self.remove_device(bus, address);
        }

        Ok(())
    }

    fn add_device(&mut self, device: Device<Context>) {
        let key = (device.bus_number(), device.address());

        // Root hubs can't be streamed from
        if let Ok(desc) = device.device_descriptor()
            && desc.vendor_id() == ROOT_HUB_VENDOR
            && desc.class_code() == HUB_CLASS
        {
            return;
        }

        let id = DeviceId(self.next_device_id);
        match UsbDevice::new(device, id, self.auto_authorize) {
            Ok(usb_device) => {
                self.next_device_id += 1;
                debug!(
                    "Added device {}: bus={}, addr={}, vid={:#06x}",
                    id,
                    key.0,
                    key.1,
                    usb_device.vendor_id()
                );
                self.device_ids.insert(id, key);
                self.devices.insert(key, usb_device);
            }
            Err(e) => warn!(
                "Failed to read descriptor of device at bus={}, addr={}: {}",
                key.0, key.1, e
            ),
        }
    }

    fn remove_device(&mut self, bus: u8, address: u8) {
        if let Some(device) = self.devices.remove(&(bus, address)) {
            self.device_ids.remove(&device.id());
            if device.is_open() {
                info!("Open device {} was disconnected", device.id());
            } else {
                debug!("Removed device {}: bus={}, addr={}", device.id(), bus, address);
            }
        }
    }

    fn device(&self, id: DeviceId) -> Option<&UsbDevice> {
        let key = self.device_ids.get(&id)?;
        self.devices.get(key)
    }

    fn device_mut(&mut self, id: DeviceId) -> Option<&mut UsbDevice> {
        let key = *self.device_ids.get(&id)?;
        self.devices.get_mut(&key)
    }

    /// Authorized device that is still attached
    fn authorized_mut(&mut self, id: DeviceId) -> Result<&mut UsbDevice, UsbError> {
        self.device_mut(id)
            .filter(|d| d.is_authorized())
            .ok_or(UsbError::NoDevice)
    }

    /// Authorized devices in id order
    pub fn list_devices(&mut self) -> Result<Vec<DeviceInfo>, UsbError> {
        self.refresh()?;
        let mut devices: Vec<_> = self
            .devices
            .values()
            .filter(|d| d.is_authorized())
            .map(|d| d.device_info())
            .collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    /// Authorize a device of `vendor_id`
    ///
    /// The first attached, not yet authorized device that can be opened wins.
    /// Without one, an already authorized device of the vendor is picked
    /// again, the way a browser picker lists paired devices.
    pub fn request_authorization(&mut self, vendor_id: u16) -> Result<DeviceInfo, UsbError> {
        self.refresh()?;

        let mut candidates: Vec<_> = self
            .devices
            .values()
            .filter(|d| d.vendor_id() == vendor_id)
            .map(|d| (d.id(), d.is_authorized()))
            .collect();
        candidates.sort_by_key(|(id, _)| *id);

        let selection = select_for_authorization(&candidates, |id| {
            self.device(id).ok_or(UsbError::NoDevice)?.probe()
        })?;

        let device = self.device_mut(selection.id()).ok_or(UsbError::NoDevice)?;
        match selection {
            Selection::Granted(id) => {
                device.authorize();
                info!("Authorized device {}", id);
            }
            Selection::AlreadyAuthorized(id) => {
                debug!("Device {} was already authorized", id);
            }
        }
        Ok(device.device_info())
    }

    /// Revoke authorization, closing the device if open
    pub fn revoke_authorization(&mut self, id: DeviceId) -> Result<(), UsbError> {
        let device = self.authorized_mut(id).map_err(|_| UsbError::NotFound)?;
        device.revoke();
        info!("Revoked authorization of device {}", id);
        Ok(())
    }

    /// Open exclusively; a second open is `Busy`
    pub fn open(&mut self, id: DeviceId) -> Result<(), UsbError> {
        let device = self
            .device_mut(id)
            .filter(|d| d.is_authorized())
            .ok_or(UsbError::NotFound)?;
        device.open()?;
        info!("Opened device {}", id);
        Ok(())
    }

    pub fn close(&mut self, id: DeviceId) {
        match self.device_mut(id) {
            Some(device) if device.is_open() => {
                device.close();
                info!("Closed device {}", id);
            }
            Some(_) => debug!("Device {} already closed", id),
            None => debug!("Close of unknown device {}", id),
        }
    }

    /// Close every open device
    pub fn close_all(&mut self) {
        for device in self.devices.values_mut() {
            device.close();
        }
    }

    pub fn select_configuration(
        &mut self,
        id: DeviceId,
        configuration: u8,
    ) -> Result<(), UsbError> {
        self.authorized_mut(id)?.select_configuration(configuration)
    }

    pub fn claim_interface(&mut self, id: DeviceId, interface: u8) -> Result<(), UsbError> {
        self.authorized_mut(id)?.claim_interface(interface)
    }

    pub fn select_alternate_setting(
        &mut self,
        id: DeviceId,
        interface: u8,
        alternate: u8,
    ) -> Result<(), UsbError> {
        self.authorized_mut(id)?
            .select_alternate_setting(interface, alternate)
    }

    pub fn reset(&mut self, id: DeviceId) -> Result<(), UsbError> {
        self.authorized_mut(id)?.reset()
    }

    pub fn max_packet_size(
        &self,
        id: DeviceId,
        selector: EndpointSelector,
    ) -> Result<usize, UsbError> {
        self.device(id)
            .filter(|d| d.is_authorized())
            .ok_or(UsbError::NoDevice)?
            .max_packet_size(selector)
    }

    pub fn bulk_out(
        &self,
        id: DeviceId,
        endpoint: u8,
        data: &[u8],
    ) -> Result<TransferResult, UsbError> {
        let device = self.device(id).ok_or(UsbError::NoDevice)?;
        transfers::bulk_out(device.handle()?, endpoint, data, self.transfer_timeout)
    }

    pub fn bulk_in(
        &self,
        id: DeviceId,
        endpoint: u8,
        length: usize,
    ) -> Result<TransferResult, UsbError> {
        let device = self.device(id).ok_or(UsbError::NoDevice)?;
        transfers::bulk_in(device.handle()?, endpoint, length, self.transfer_timeout)
    }
}

/// Device an authorization request resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    Granted(DeviceId),
    AlreadyAuthorized(DeviceId),
}

impl Selection {
    fn id(self) -> DeviceId {
        match self {
            Selection::Granted(id) | Selection::AlreadyAuthorized(id) => id,
        }
    }
}

/// Pick the device an authorization request resolves to
///
/// `candidates` are the vendor's attached devices as `(id, authorized)` in id
/// order. Unauthorized ones are probed first. `Access` when every probe was
/// denied and nothing is authorized yet, `Cancelled` when nothing fits.
fn select_for_authorization(
    candidates: &[(DeviceId, bool)],
    mut probe: impl FnMut(DeviceId) -> Result<(), UsbError>,
) -> Result<Selection, UsbError> {
    let mut denied = false;
    for &(id, _) in candidates.iter().filter(|(_, authorized)| !authorized) {
        match probe(id) {
            Ok(()) => return Ok(Selection::Granted(id)),
            Err(UsbError::Access) => {
                warn!("Access to device {} denied", id);
                denied = true;
            }
            Err(e) => debug!("Device {} can't be opened: {}", id, e),
        }
    }

    if let Some(&(id, _)) = candidates.iter().find(|(_, authorized)| *authorized) {
        return Ok(Selection::AlreadyAuthorized(id));
    }

    Err(if denied {
        UsbError::Access
    } else {
        UsbError::Cancelled
    })
}
