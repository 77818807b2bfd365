//! Device adapter
//!
//! Owns one device end to end: open, select configuration, claim interface,
//! select alternate setting, handshake, then continuous bulk-in reads.
//!
//! A failed or timed-out handshake is retried exactly once after a full
//! device reset. Anything beyond that is the caller's problem; see
//! [`pipeline`](crate::pipeline) for whole-chain retries.
//!
//! The adapter closes its device when dropped, so cancelling a
//! [`ReadStream`] by dropping it always releases the handle exactly once.

use crate::channel::TransportChannel;
use crate::error::AdapterError;
use common::UsbHost;
use protocol::handshake::check_response_prefix;
use protocol::{
    DeviceInfo, EndpointSelector, HandshakeError, TransferResult, UPGRADE_REQUEST,
    UPGRADE_RESPONSE_PREFIX,
};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Deadline for one handshake exchange (write + read)
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle of a [`DeviceAdapter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterState {
    Unopened,
    Configuring,
    Handshaking,
    Streaming,
    Failed,
    Closed,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::Unopened => write!(f, "unopened"),
            AdapterState::Configuring => write!(f, "configuring"),
            AdapterState::Handshaking => write!(f, "handshaking"),
            AdapterState::Streaming => write!(f, "streaming"),
            AdapterState::Failed => write!(f, "failed"),
            AdapterState::Closed => write!(f, "closed"),
        }
    }
}

/// Request/response pair that gates streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Bytes written over bulk-out
    pub request: &'static [u8],
    /// Prefix the ASCII-decoded reply must start with
    pub response_prefix: &'static str,
}

impl Handshake {
    /// Pseudo-HTTP websocket upgrade
    pub const UPGRADE: Handshake = Handshake {
        request: UPGRADE_REQUEST,
        response_prefix: UPGRADE_RESPONSE_PREFIX,
    };

    pub fn check(&self, response: &[u8]) -> Result<(), AdapterError> {
        check_response_prefix(response, self.response_prefix).map_err(
            |HandshakeError::Rejected { response }| AdapterError::HandshakeRejected { response },
        )
    }
}

/// One adapter variant: where its bulk channel lives and how it shakes hands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterProfile {
    pub name: &'static str,
    /// Vendor the profile is meant for
    pub vendor_id: u16,
    pub selector: EndpointSelector,
    pub handshake: Handshake,
}

impl AdapterProfile {
    /// Loupedeck consoles: configuration 1, interface 1, alternate 0, endpoint 1
    pub const LOUPEDECK: AdapterProfile = AdapterProfile {
        name: "loupedeck",
        vendor_id: 0x2ec2,
        selector: EndpointSelector::new(1, 1, 0, 1),
        handshake: Handshake::UPGRADE,
    };
}

/// Exclusive owner of one open device
pub struct DeviceAdapter<H: UsbHost> {
    host: H,
    device: DeviceInfo,
    profile: AdapterProfile,
    state: AdapterState,
    /// Whether `open` succeeded and `close` is still owed
    opened: bool,
    channel: Option<TransportChannel<H>>,
    resets: u32,
}

impl<H: UsbHost> DeviceAdapter<H> {
    pub fn new(host: H, device: DeviceInfo, profile: AdapterProfile) -> Self {
        Self {
            host,
            device,
            profile,
            state: AdapterState::Unopened,
            opened: false,
            channel: None,
            resets: 0,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn profile(&self) -> &AdapterProfile {
        &self.profile
    }

    /// Number of device resets issued so far
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Max packet size of the bulk-in endpoint, once configured
    pub fn packet_size(&self) -> Option<usize> {
        self.channel.as_ref().map(|c| c.packet_size())
    }

    fn invalid(&self, operation: &'static str) -> AdapterError {
        AdapterError::InvalidState {
            state: self.state,
            operation,
        }
    }

    /// Bring the device from `Unopened` to `Streaming`
    ///
    /// On failure the adapter is left `Failed`; construct a new one to try
    /// again.
    pub async fn initialize(&mut self) -> Result<(), AdapterError> {
        if self.state != AdapterState::Unopened {
            return Err(self.invalid("initialize"));
        }

        info!(
            "Initializing {} adapter for {}",
            self.profile.name, self.device
        );

        match self.bring_up().await {
            Ok(()) => {
                self.state = AdapterState::Streaming;
                info!(
                    "Device {} streaming (packet size {}, resets {})",
                    self.device.id,
                    self.packet_size().unwrap_or_default(),
                    self.resets
                );
                Ok(())
            }
            Err(e) => {
                self.state = AdapterState::Failed;
                warn!("Failed to initialize {}: {}", self.device, e);
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self) -> Result<(), AdapterError> {
        let id = self.device.id;
        let selector = self.profile.selector;

        self.host.open(id).await?;
        self.opened = true;
        self.state = AdapterState::Configuring;

        self.host
            .select_configuration(id, selector.configuration)
            .await?;
        self.host.claim_interface(id, selector.interface).await?;
        self.host
            .select_alternate_setting(id, selector.interface, selector.alternate)
            .await?;

        let packet_size = self.host.max_packet_size(id, selector).await?;
        debug!(
            "Configured {}: {:?}, max packet size {}",
            id, selector, packet_size
        );
        self.channel = Some(TransportChannel::new(
            self.host.clone(),
            id,
            selector,
            packet_size,
        ));

        match self.handshake().await {
            Ok(()) => Ok(()),
            Err(first) if first.is_handshake_failure() => {
                warn!("Handshake with {} failed ({}), resetting device", id, first);
                self.host.reset(id).await?;
                self.resets += 1;

                self.handshake().await.map_err(|second| {
                    if second.is_handshake_failure() {
                        AdapterError::InitFailed(Box::new(second))
                    } else {
                        second
                    }
                })
            }
            Err(e) => Err(e),
        }
    }

    /// One handshake exchange, bounded by [`HANDSHAKE_TIMEOUT`]
    async fn handshake(&mut self) -> Result<(), AdapterError> {
        let Some(channel) = &self.channel else {
            return Err(self.invalid("handshake"));
        };
        self.state = AdapterState::Handshaking;

        let handshake = self.profile.handshake;
        let exchange = async {
            channel.write(handshake.request).await?;
            let reply = channel.read().await?;
            handshake.check(&reply.payload)
        };

        let result = match tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::HandshakeTimeout(HANDSHAKE_TIMEOUT)),
        };

        if result.is_err() {
            self.state = AdapterState::Configuring;
        } else {
            debug!("Handshake with {} accepted", self.device.id);
        }
        result
    }

    /// Turn a streaming adapter into its read stream
    pub fn into_read_stream(self) -> Result<ReadStream<H>, AdapterError> {
        if self.state != AdapterState::Streaming {
            return Err(self.invalid("read"));
        }
        Ok(ReadStream { adapter: self })
    }

    /// Release the device; idempotent
    pub fn destroy(&mut self) {
        if self.state == AdapterState::Closed {
            return;
        }
        self.channel = None;
        if self.opened {
            self.opened = false;
            self.host.close(self.device.id);
            info!("Closed {} (was {})", self.device.id, self.state);
        }
        self.state = AdapterState::Closed;
    }
}

impl<H: UsbHost> Drop for DeviceAdapter<H> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<H: UsbHost> fmt::Debug for DeviceAdapter<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAdapter")
            .field("device", &self.device.id)
            .field("profile", &self.profile.name)
            .field("state", &self.state)
            .field("resets", &self.resets)
            .finish()
    }
}

/// Continuous bulk-in reads from a streaming adapter
///
/// Each [`next`](ReadStream::next) issues exactly one read; nothing is read
/// ahead. A transport error is yielded once and ends the stream. Dropping
/// the stream closes the device.
#[derive(Debug)]
pub struct ReadStream<H: UsbHost> {
    adapter: DeviceAdapter<H>,
}

impl<H: UsbHost> ReadStream<H> {
    pub async fn next(&mut self) -> Option<Result<TransferResult, AdapterError>> {
        if self.adapter.state != AdapterState::Streaming {
            return None;
        }
        let channel = self.adapter.channel.as_ref()?;

        match channel.read().await {
            Ok(result) => Some(Ok(result)),
            Err(e) => {
                warn!("Read from {} failed: {}", self.adapter.device.id, e);
                self.adapter.state = AdapterState::Failed;
                Some(Err(AdapterError::Transfer(e)))
            }
        }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.adapter.device
    }

    pub fn state(&self) -> AdapterState {
        self.adapter.state
    }

    /// Stop streaming and release the device
    pub fn close(mut self) {
        self.adapter.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockHost, TEST_VENDOR_ID, mock_device};
    use protocol::UsbError;

    fn adapter(host: &MockHost) -> DeviceAdapter<MockHost> {
        let device = mock_device(1, TEST_VENDOR_ID);
        host.add_device(device.clone());
        DeviceAdapter::new(host.clone(), device, AdapterProfile::LOUPEDECK)
    }

    #[test]
    fn test_profile_selector() {
        let selector = AdapterProfile::LOUPEDECK.selector;
        assert_eq!(selector.configuration, 1);
        assert_eq!(selector.interface, 1);
        assert_eq!(selector.alternate, 0);
        assert_eq!(selector.endpoint, 1);
    }

    #[test]
    fn test_handshake_check() {
        assert!(Handshake::UPGRADE.check(b"HTTP/1.1 101").is_ok());
        assert_eq!(
            Handshake::UPGRADE.check(b"nope"),
            Err(AdapterError::HandshakeRejected {
                response: "nope".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_initialize_twice_is_rejected() {
        let host = MockHost::new();
        let mut adapter = adapter(&host);

        adapter.initialize().await.unwrap();
        let err = adapter.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            AdapterError::InvalidState {
                state: AdapterState::Streaming,
                ..
            }
        ));
        assert_eq!(host.opens(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_does_not_close() {
        let host = MockHost::new();
        host.fail_next_open(UsbError::Access);
        let mut adapter = adapter(&host);

        let err = adapter.initialize().await.unwrap_err();
        assert_eq!(err, AdapterError::Transfer(UsbError::Access));
        assert_eq!(adapter.state(), AdapterState::Failed);

        adapter.destroy();
        assert_eq!(host.closes(), 0);
        assert_eq!(adapter.state(), AdapterState::Closed);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let host = MockHost::new();
        let mut adapter = adapter(&host);
        adapter.initialize().await.unwrap();

        adapter.destroy();
        adapter.destroy();
        drop(adapter);
        assert_eq!(host.closes(), 1);
    }

    #[tokio::test]
    async fn test_read_stream_requires_streaming() {
        let host = MockHost::new();
        let adapter = adapter(&host);

        let err = adapter.into_read_stream().unwrap_err();
        assert!(matches!(
            err,
            AdapterError::InvalidState {
                state: AdapterState::Unopened,
                operation: "read"
            }
        ));
        assert_eq!(host.reads(), 0);
    }

    #[tokio::test]
    async fn test_closed_stream_yields_nothing() {
        let host = MockHost::new();
        let mut adapter = adapter(&host);
        adapter.initialize().await.unwrap();
        let mut stream = adapter.into_read_stream().unwrap();
        let reads_before = host.reads();

        stream.adapter.destroy();
        assert!(stream.next().await.is_none());
        assert_eq!(host.reads(), reads_before);
    }
}
