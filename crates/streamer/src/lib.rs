//! deck-stream core
//!
//! Discovers vendor-specific USB devices, brings one up through a
//! configure-and-handshake sequence and streams its bulk-in transfers.
//!
//! - [`registry`]: which authorized devices of the vendor are present, and
//!   when that changes
//! - [`adapter`]: one device from open to streaming, with a single
//!   reset-and-retry of the handshake
//! - [`channel`]: raw bulk-out/bulk-in on an open device
//! - [`pipeline`]: registry, adapter and read stream wired into one frame
//!   feed with whole-chain retries
//! - [`usb`]: the rusb host behind [`common::UsbBridge`]
//!
//! Everything above [`usb`] is generic over [`common::UsbHost`].

pub mod adapter;
pub mod channel;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod usb;

pub use adapter::{
    AdapterProfile, AdapterState, DeviceAdapter, HANDSHAKE_TIMEOUT, Handshake, ReadStream,
};
pub use channel::TransportChannel;
pub use error::{AdapterError, PipelineError, RegistryError};
pub use pipeline::{FrameItem, FrameStream, MAX_CHAIN_ATTEMPTS, StreamPipeline};
pub use registry::{DeviceRegistry, Snapshot, SnapshotStream};
