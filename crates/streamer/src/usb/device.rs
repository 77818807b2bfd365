//! USB device abstraction
//!
//! Wrapper around rusb::Device with a cached descriptor, the authorization
//! flag, and the open handle with whatever it claimed.

use crate::usb::transfers::map_rusb_error;
use protocol::{DeviceId, DeviceInfo, EndpointSelector, UsbError};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use tracing::{debug, warn};

/// USB device wrapper with cached information
pub struct UsbDevice {
    device: Device<Context>,
    /// Host-assigned, stable while attached
    id: DeviceId,
    descriptor: DeviceDescriptor,
    product: Option<String>,
    authorized: bool,
    handle: Option<DeviceHandle<Context>>,
    /// Interfaces claimed through this handle
    claimed_interfaces: Vec<u8>,
    /// Interfaces whose kernel driver we detached
    detached_interfaces: Vec<u8>,
}

impl UsbDevice {
    /// Reads and caches the device descriptor and product string
    pub fn new(
        device: Device<Context>,
        id: DeviceId,
        authorized: bool,
    ) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;
        let product = read_product_string(&device, &descriptor);

        Ok(Self {
            device,
            id,
            descriptor,
            product,
            authorized,
            handle: None,
            claimed_interfaces: Vec::new(),
            detached_interfaces: Vec::new(),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn device_address(&self) -> u8 {
        self.device.address()
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn authorize(&mut self) {
        self.authorized = true;
    }

    /// Drop authorization, closing the device if open
    pub fn revoke(&mut self) {
        self.close();
        self.authorized = false;
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            bus_number: self.bus_number(),
            device_address: self.device_address(),
            product: self.product.clone(),
        }
    }

    /// Check the device can be opened, without keeping it open
    pub fn probe(&self) -> Result<(), UsbError> {
        self.device.open().map(drop).map_err(map_rusb_error)
    }

    /// Open the device exclusively
    pub fn open(&mut self) -> Result<(), UsbError> {
        if self.handle.is_some() {
            return Err(UsbError::Busy);
        }

        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", self.id, e);
            map_rusb_error(e)
        })?;

        debug!("Opened device {}", self.id);
        self.handle = Some(handle);
        Ok(())
    }

    /// Close the device
    ///
    /// Releases claimed interfaces and reattaches kernel drivers we detached.
    pub fn close(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        for interface in self.claimed_interfaces.drain(..) {
            if let Err(e) = handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
        }

        for interface in self.detached_interfaces.drain(..) {
            match handle.attach_kernel_driver(interface) {
                Ok(()) => debug!(
                    "Reattached kernel driver to interface {} on device {}",
                    interface, self.id
                ),
                Err(e) => debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                ),
            }
        }

        debug!("Closed device {}", self.id);
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Open handle, or `NoDevice` when closed
    pub fn handle(&self) -> Result<&DeviceHandle<Context>, UsbError> {
        self.handle.as_ref().ok_or(UsbError::NoDevice)
    }

    fn handle_mut(&mut self) -> Result<&mut DeviceHandle<Context>, UsbError> {
        self.handle.as_mut().ok_or(UsbError::NoDevice)
    }

    /// Make `configuration` active, unless it already is
    pub fn select_configuration(&mut self, configuration: u8) -> Result<(), UsbError> {
        let id = self.id;
        let handle = self.handle_mut()?;

        if handle.active_configuration().ok() == Some(configuration) {
            debug!("Configuration {} already active on device {}", configuration, id);
            return Ok(());
        }

        handle
            .set_active_configuration(configuration)
            .map_err(map_rusb_error)?;
        debug!("Selected configuration {} on device {}", configuration, id);
        Ok(())
    }

    /// Claim an interface, detaching the kernel driver first if one is bound
    pub fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        let id = self.id;
        let handle = self.handle.as_mut().ok_or(UsbError::NoDevice)?;

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on device {}",
                    interface, id
                );
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => self.detached_interfaces.push(interface),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        handle.claim_interface(interface).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface, e);
            map_rusb_error(e)
        })?;

        debug!("Claimed interface {} on device {}", interface, id);
        if !self.claimed_interfaces.contains(&interface) {
            self.claimed_interfaces.push(interface);
        }
        Ok(())
    }

    pub fn select_alternate_setting(
        &mut self,
        interface: u8,
        alternate: u8,
    ) -> Result<(), UsbError> {
        let id = self.id;
        self.handle_mut()?
            .set_alternate_setting(interface, alternate)
            .map_err(map_rusb_error)?;
        debug!(
            "Selected alternate setting {} of interface {} on device {}",
            alternate, interface, id
        );
        Ok(())
    }

    /// Reset the device
    ///
    /// libusb restores the configuration and claimed interfaces afterwards.
    pub fn reset(&mut self) -> Result<(), UsbError> {
        let id = self.id;
        self.handle_mut()?.reset().map_err(map_rusb_error)?;
        debug!("Reset device {}", id);
        Ok(())
    }

    /// Max packet size of the bulk-in endpoint `selector` points at
    pub fn max_packet_size(&self, selector: EndpointSelector) -> Result<usize, UsbError> {
        if self.handle.is_none() {
            return Err(UsbError::NoDevice);
        }

        let address = selector.in_address();
        for index in 0..self.descriptor.num_configurations() {
            let config = self.device.config_descriptor(index).map_err(map_rusb_error)?;
            if config.number() != selector.configuration {
                continue;
            }

            for interface in config.interfaces() {
                if interface.number() != selector.interface {
                    continue;
                }
                for setting in interface.descriptors() {
                    if setting.setting_number() != selector.alternate {
                        continue;
                    }
                    for endpoint in setting.endpoint_descriptors() {
                        if endpoint.address() == address {
                            return Ok(endpoint.max_packet_size() as usize);
                        }
                    }
                }
            }
        }

        warn!("Device {} has no endpoint matching {:?}", self.id, selector);
        Err(UsbError::NotFound)
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_product_string(device: &Device<Context>, descriptor: &DeviceDescriptor) -> Option<String> {
    let index = descriptor.product_string_index()?;
    let handle = device.open().ok()?;
    handle.read_string_descriptor_ascii(index).ok()
}
