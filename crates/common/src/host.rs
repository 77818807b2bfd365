//! Host USB capability
//!
//! The streaming core never talks to a USB stack directly. It is written
//! against [`UsbHost`], which the blocking rusb worker provides through
//! [`UsbBridge`](crate::UsbBridge) and tests provide through
//! `test_utils::MockHost`.
//!
//! Every operation except [`UsbHost::close`] and [`UsbHost::hotplug_events`]
//! is asynchronous. `close` is fire-and-forget so it can run from `Drop`.

use protocol::{DeviceId, DeviceInfo, EndpointSelector, HotplugEvent, TransferResult, UsbError};
use std::future::Future;
use tokio::sync::broadcast;

pub type UsbResult<T> = std::result::Result<T, UsbError>;

/// Capability surface of the host USB platform
///
/// Implementations are cheap handles: cloning one shares the underlying
/// host.
pub trait UsbHost: Clone + Send + Sync + 'static {
    /// All devices the host currently knows about (authorized and attached),
    /// of every vendor, in host order.
    fn enumerate(&self) -> impl Future<Output = UsbResult<Vec<DeviceInfo>>> + Send;

    /// Ask for access to one more device of `vendor_id`.
    ///
    /// Fails with [`UsbError::Access`] when permission is denied and
    /// [`UsbError::Cancelled`] when no device was selected.
    fn request_authorization(
        &self,
        vendor_id: u16,
    ) -> impl Future<Output = UsbResult<DeviceInfo>> + Send;

    /// Drop access to a device. Closes it if open.
    fn revoke_authorization(&self, device: DeviceId) -> impl Future<Output = UsbResult<()>> + Send;

    /// Open a device. A device can be open at most once.
    fn open(&self, device: DeviceId) -> impl Future<Output = UsbResult<()>> + Send;

    /// Release an open device. No-op if it is not open.
    fn close(&self, device: DeviceId);

    fn select_configuration(
        &self,
        device: DeviceId,
        configuration: u8,
    ) -> impl Future<Output = UsbResult<()>> + Send;

    fn claim_interface(
        &self,
        device: DeviceId,
        interface: u8,
    ) -> impl Future<Output = UsbResult<()>> + Send;

    fn select_alternate_setting(
        &self,
        device: DeviceId,
        interface: u8,
        alternate: u8,
    ) -> impl Future<Output = UsbResult<()>> + Send;

    /// Full device reset
    fn reset(&self, device: DeviceId) -> impl Future<Output = UsbResult<()>> + Send;

    /// Maximum packet size of the bulk-in endpoint addressed by `selector`
    fn max_packet_size(
        &self,
        device: DeviceId,
        selector: EndpointSelector,
    ) -> impl Future<Output = UsbResult<usize>> + Send;

    /// Write `data` to the bulk-out endpoint address `endpoint`
    fn bulk_transfer_out(
        &self,
        device: DeviceId,
        endpoint: u8,
        data: Vec<u8>,
    ) -> impl Future<Output = UsbResult<TransferResult>> + Send;

    /// Read up to `max_length` bytes from the bulk-in endpoint address `endpoint`
    fn bulk_transfer_in(
        &self,
        device: DeviceId,
        endpoint: u8,
        max_length: usize,
    ) -> impl Future<Output = UsbResult<TransferResult>> + Send;

    /// Subscribe to connect/disconnect notifications for devices of any vendor
    fn hotplug_events(&self) -> broadcast::Receiver<HotplugEvent>;
}
