//! Transport channel
//!
//! Raw bulk-out/bulk-in operations against an already-opened device. No
//! retries, no protocol policy: results and errors go straight back to the
//! caller.

use common::{UsbHost, UsbResult};
use protocol::{DeviceId, EndpointSelector, TransferResult};
use tracing::trace;

/// Bulk channel of one open device
pub struct TransportChannel<H: UsbHost> {
    host: H,
    device: DeviceId,
    selector: EndpointSelector,
    packet_size: usize,
}

impl<H: UsbHost> TransportChannel<H> {
    pub fn new(host: H, device: DeviceId, selector: EndpointSelector, packet_size: usize) -> Self {
        Self {
            host,
            device,
            selector,
            packet_size,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Maximum packet size of the bulk-in endpoint
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Write `data` to the bulk-out endpoint
    pub async fn write(&self, data: &[u8]) -> UsbResult<TransferResult> {
        let endpoint = self.selector.out_address();
        trace!(
            "Bulk out: device={}, endpoint={:#04x}, len={}",
            self.device,
            endpoint,
            data.len()
        );
        self.host
            .bulk_transfer_out(self.device, endpoint, data.to_vec())
            .await
    }

    /// Read one max-packet-size transfer from the bulk-in endpoint
    pub async fn read(&self) -> UsbResult<TransferResult> {
        let endpoint = self.selector.in_address();
        let result = self
            .host
            .bulk_transfer_in(self.device, endpoint, self.packet_size)
            .await?;
        trace!(
            "Bulk in: device={}, endpoint={:#04x}, status={:?}, len={}",
            self.device,
            endpoint,
            result.status,
            result.payload.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{HostCall, MockHost, TEST_VENDOR_ID, mock_device};

    async fn open_channel(host: &MockHost) -> TransportChannel<MockHost> {
        host.add_device(mock_device(1, TEST_VENDOR_ID));
        host.open(DeviceId(1)).await.unwrap();
        TransportChannel::new(host.clone(), DeviceId(1), EndpointSelector::new(1, 1, 0, 1), 64)
    }

    #[tokio::test]
    async fn test_write_uses_out_address() {
        let host = MockHost::new();
        let channel = open_channel(&host).await;

        channel.write(b"ping").await.unwrap();
        assert!(
            host.calls()
                .contains(&HostCall::BulkOut(DeviceId(1), 0x01, b"ping".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_read_requests_one_packet_from_in_address() {
        let host = MockHost::new();
        let channel = open_channel(&host).await;

        let result = channel.read().await.unwrap();
        assert!(result.is_ok());
        assert!(host.calls().contains(&HostCall::BulkIn(DeviceId(1), 0x81, 64)));
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let host = MockHost::new();
        let channel = open_channel(&host).await;
        host.push_frame(Err(protocol::UsbError::Io));

        assert_eq!(channel.read().await, Err(protocol::UsbError::Io));
        // No retry on failure
        assert_eq!(host.reads(), 1);
    }
}
