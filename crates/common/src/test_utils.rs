//! Test utilities for deck-stream
//!
//! Provides an in-memory [`UsbHost`] and helper functions for testing across
//! crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockHost, mock_device};
//!
//! let host = MockHost::new();
//! host.add_device(mock_device(1, 0x2ec2));
//! assert_eq!(host.device_count(), 1);
//! ```

use crate::host::{UsbHost, UsbResult};
use protocol::{DeviceId, DeviceInfo, EndpointSelector, HotplugEvent, TransferResult, UsbError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor id of the devices the default adapter profile drives
pub const TEST_VENDOR_ID: u16 = 0x2ec2;

/// Reply the mock gives to a handshake unless told otherwise
pub const ACCEPTED_HANDSHAKE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\r\n";

/// Packet size reported by the mock unless told otherwise
pub const DEFAULT_PACKET_SIZE: usize = 512;

/// Create a mock DeviceInfo for testing
///
/// # Example
/// ```
/// use common::test_utils::mock_device;
///
/// let device = mock_device(1, 0x2ec2);
/// assert_eq!(device.id.0, 1);
/// assert_eq!(device.vendor_id, 0x2ec2);
/// ```
pub fn mock_device(id: u32, vendor_id: u16) -> DeviceInfo {
    DeviceInfo {
        id: DeviceId(id),
        vendor_id,
        product_id: 0x0004,
        bus_number: 1,
        device_address: (id % 128) as u8,
        product: Some(format!("Test Product {}", id)),
    }
}

/// One recorded call on a [`MockHost`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Enumerate,
    RequestAuthorization(u16),
    RevokeAuthorization(DeviceId),
    Open(DeviceId),
    Close(DeviceId),
    SelectConfiguration(DeviceId, u8),
    ClaimInterface(DeviceId, u8),
    SelectAlternateSetting(DeviceId, u8, u8),
    Reset(DeviceId),
    MaxPacketSize(DeviceId, EndpointSelector),
    BulkOut(DeviceId, u8, Vec<u8>),
    BulkIn(DeviceId, u8, usize),
}

#[derive(Debug, Default)]
struct MockState {
    /// Authorized devices, in host order
    devices: Vec<DeviceInfo>,
    /// Devices an authorization request can grant
    grantable: VecDeque<DeviceInfo>,
    authorization_error: Option<UsbError>,
    enumerate_errors: VecDeque<UsbError>,
    revoke_errors: HashMap<DeviceId, UsbError>,
    open: HashSet<DeviceId>,
    open_errors: VecDeque<UsbError>,
    write_errors: VecDeque<UsbError>,
    /// Replies to the read following a bulk-out; `None` never answers
    handshake_replies: VecDeque<Option<Vec<u8>>>,
    awaiting_reply: bool,
    frames: VecDeque<UsbResult<TransferResult>>,
    hang_reads: bool,
    frame_counter: u8,
    packet_size: Option<usize>,
    calls: Vec<HostCall>,
}

enum ReadStep {
    Ready(UsbResult<TransferResult>),
    Hang,
}

/// Scriptable in-memory USB host
///
/// Records every call. By default it accepts handshakes and produces an
/// endless series of 4-byte frames `[n, n, n, n]` with `n` counting up.
#[derive(Clone, Debug)]
pub struct MockHost {
    state: Arc<Mutex<MockState>>,
    hotplug_tx: broadcast::Sender<HotplugEvent>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    pub fn new() -> Self {
        let (hotplug_tx, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            hotplug_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock host state poisoned")
    }

    /// Add an already-authorized device without a hot-plug event
    pub fn add_device(&self, device: DeviceInfo) {
        self.lock().devices.push(device);
    }

    /// Attach and authorize a device, then announce it
    pub fn plug(&self, device: DeviceInfo) {
        let event = HotplugEvent::Connected {
            bus_number: device.bus_number,
            device_address: device.device_address,
            vendor_id: Some(device.vendor_id),
        };
        self.add_device(device);
        let _ = self.hotplug_tx.send(event);
    }

    /// Detach a device, then announce it
    pub fn unplug(&self, id: DeviceId) {
        let removed = {
            let mut state = self.lock();
            state.open.remove(&id);
            let index = state.devices.iter().position(|d| d.id == id);
            index.map(|i| state.devices.remove(i))
        };
        if let Some(device) = removed {
            let _ = self.hotplug_tx.send(HotplugEvent::Disconnected {
                bus_number: device.bus_number,
                device_address: device.device_address,
            });
        }
    }

    /// Publish an arbitrary hot-plug event
    pub fn emit(&self, event: HotplugEvent) {
        let _ = self.hotplug_tx.send(event);
    }

    /// Make a device available to the next authorization request
    pub fn offer(&self, device: DeviceInfo) {
        self.lock().grantable.push_back(device);
    }

    /// Make every authorization request fail with `error`
    pub fn deny_authorization(&self, error: UsbError) {
        self.lock().authorization_error = Some(error);
    }

    /// Fail the next `open` with `error`
    pub fn fail_next_open(&self, error: UsbError) {
        self.lock().open_errors.push_back(error);
    }

    /// Fail the next `enumerate` with `error`
    pub fn fail_next_enumerate(&self, error: UsbError) {
        self.lock().enumerate_errors.push_back(error);
    }

    /// Revoking `device` fails with `error` and leaves it authorized
    pub fn fail_revoke(&self, device: DeviceId, error: UsbError) {
        self.lock().revoke_errors.insert(device, error);
    }

    /// Fail the next bulk-out (the handshake request) with `error`
    pub fn fail_next_handshake_write(&self, error: UsbError) {
        self.lock().write_errors.push_back(error);
    }

    /// Queue the reply to the next handshake read
    pub fn reply_to_handshake(&self, reply: &[u8]) {
        self.lock().handshake_replies.push_back(Some(reply.to_vec()));
    }

    /// The next handshake read never completes
    pub fn ignore_next_handshake(&self) {
        self.lock().handshake_replies.push_back(None);
    }

    /// Queue the result of the next streaming read
    pub fn push_frame(&self, frame: UsbResult<TransferResult>) {
        self.lock().frames.push_back(frame);
    }

    /// Once the frame queue is drained, reads never complete
    pub fn hang_reads(&self) {
        self.lock().hang_reads = true;
    }

    pub fn set_packet_size(&self, size: usize) {
        self.lock().packet_size = Some(size);
    }

    pub fn device_count(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_open(&self, id: DeviceId) -> bool {
        self.lock().open.contains(&id)
    }

    /// Every call recorded so far
    pub fn calls(&self) -> Vec<HostCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls matching `predicate`
    pub fn count(&self, predicate: impl Fn(&HostCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn opens(&self) -> usize {
        self.count(|c| matches!(c, HostCall::Open(_)))
    }

    pub fn closes(&self) -> usize {
        self.count(|c| matches!(c, HostCall::Close(_)))
    }

    pub fn resets(&self) -> usize {
        self.count(|c| matches!(c, HostCall::Reset(_)))
    }

    pub fn reads(&self) -> usize {
        self.count(|c| matches!(c, HostCall::BulkIn(..)))
    }

    pub fn writes(&self) -> usize {
        self.count(|c| matches!(c, HostCall::BulkOut(..)))
    }

    /// Record a call against an open device
    fn record_open_call(&self, device: DeviceId, call: HostCall) -> UsbResult<()> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.open.contains(&device) {
            Ok(())
        } else {
            Err(UsbError::NoDevice)
        }
    }

    fn next_read(&self, device: DeviceId, endpoint: u8, max_length: usize) -> ReadStep {
        let mut state = self.lock();
        state.calls.push(HostCall::BulkIn(device, endpoint, max_length));
        if !state.open.contains(&device) {
            return ReadStep::Ready(Err(UsbError::NoDevice));
        }

        if state.awaiting_reply {
            state.awaiting_reply = false;
            return match state.handshake_replies.pop_front() {
                Some(Some(mut reply)) => {
                    reply.truncate(max_length);
                    ReadStep::Ready(Ok(TransferResult::ok(reply)))
                }
                Some(None) => ReadStep::Hang,
                None => ReadStep::Ready(Ok(TransferResult::ok(ACCEPTED_HANDSHAKE.to_vec()))),
            };
        }

        if let Some(frame) = state.frames.pop_front() {
            return ReadStep::Ready(frame);
        }
        if state.hang_reads {
            return ReadStep::Hang;
        }

        let n = state.frame_counter;
        state.frame_counter = n.wrapping_add(1);
        ReadStep::Ready(Ok(TransferResult::ok(vec![n; 4])))
    }
}

impl UsbHost for MockHost {
    async fn enumerate(&self) -> UsbResult<Vec<DeviceInfo>> {
        let mut state = self.lock();
        state.calls.push(HostCall::Enumerate);
        if let Some(error) = state.enumerate_errors.pop_front() {
            return Err(error);
        }
        Ok(state.devices.clone())
    }

    async fn request_authorization(&self, vendor_id: u16) -> UsbResult<DeviceInfo> {
        let mut state = self.lock();
        state.calls.push(HostCall::RequestAuthorization(vendor_id));
        if let Some(error) = state.authorization_error.clone() {
            return Err(error);
        }

        let index = state
            .grantable
            .iter()
            .position(|d| d.vendor_id == vendor_id)
            .ok_or(UsbError::Cancelled)?;
        let device = state.grantable.remove(index).ok_or(UsbError::Cancelled)?;
        state.devices.push(device.clone());
        Ok(device)
    }

    async fn revoke_authorization(&self, device: DeviceId) -> UsbResult<()> {
        let mut state = self.lock();
        state.calls.push(HostCall::RevokeAuthorization(device));
        if let Some(error) = state.revoke_errors.remove(&device) {
            return Err(error);
        }
        state.open.remove(&device);
        let before = state.devices.len();
        state.devices.retain(|d| d.id != device);
        if state.devices.len() == before {
            Err(UsbError::NotFound)
        } else {
            Ok(())
        }
    }

    async fn open(&self, device: DeviceId) -> UsbResult<()> {
        let mut state = self.lock();
        state.calls.push(HostCall::Open(device));
        if let Some(error) = state.open_errors.pop_front() {
            return Err(error);
        }
        if !state.devices.iter().any(|d| d.id == device) {
            return Err(UsbError::NotFound);
        }
        if !state.open.insert(device) {
            return Err(UsbError::Busy);
        }
        state.awaiting_reply = false;
        Ok(())
    }

    fn close(&self, device: DeviceId) {
        let mut state = self.lock();
        state.calls.push(HostCall::Close(device));
        state.open.remove(&device);
    }

    async fn select_configuration(&self, device: DeviceId, configuration: u8) -> UsbResult<()> {
        self.record_open_call(device, HostCall::SelectConfiguration(device, configuration))
    }

    async fn claim_interface(&self, device: DeviceId, interface: u8) -> UsbResult<()> {
        self.record_open_call(device, HostCall::ClaimInterface(device, interface))
    }

    async fn select_alternate_setting(
        &self,
        device: DeviceId,
        interface: u8,
        alternate: u8,
    ) -> UsbResult<()> {
        self.record_open_call(
            device,
            HostCall::SelectAlternateSetting(device, interface, alternate),
        )
    }

    async fn reset(&self, device: DeviceId) -> UsbResult<()> {
        self.record_open_call(device, HostCall::Reset(device))?;
        self.lock().awaiting_reply = false;
        Ok(())
    }

    async fn max_packet_size(
        &self,
        device: DeviceId,
        selector: EndpointSelector,
    ) -> UsbResult<usize> {
        self.record_open_call(device, HostCall::MaxPacketSize(device, selector))?;
        Ok(self.lock().packet_size.unwrap_or(DEFAULT_PACKET_SIZE))
    }

    async fn bulk_transfer_out(
        &self,
        device: DeviceId,
        endpoint: u8,
        data: Vec<u8>,
    ) -> UsbResult<TransferResult> {
        self.record_open_call(device, HostCall::BulkOut(device, endpoint, data))?;
        let mut state = self.lock();
        if let Some(error) = state.write_errors.pop_front() {
            return Err(error);
        }
        state.awaiting_reply = true;
        Ok(TransferResult::ok(Vec::new()))
    }

    async fn bulk_transfer_in(
        &self,
        device: DeviceId,
        endpoint: u8,
        max_length: usize,
    ) -> UsbResult<TransferResult> {
        match self.next_read(device, endpoint, max_length) {
            ReadStep::Ready(result) => result,
            ReadStep::Hang => std::future::pending().await,
        }
    }

    fn hotplug_events(&self) -> broadcast::Receiver<HotplugEvent> {
        self.hotplug_tx.subscribe()
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
