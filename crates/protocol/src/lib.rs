//! Protocol library for deck-stream
//!
//! This crate defines the wire-level vocabulary shared by the host side and
//! the streaming core: device descriptors, endpoint selectors, transfer
//! results, hot-plug notifications, the USB error taxonomy and the upgrade
//! handshake that gates streaming.
//!
//! # Example
//!
//! ```
//! use protocol::{UPGRADE_REQUEST, check_upgrade_response};
//!
//! assert!(UPGRADE_REQUEST.starts_with(b"GET /index.html"));
//! assert!(check_upgrade_response(b"HTTP/1.1 101 Switching Protocols").is_ok());
//! assert!(check_upgrade_response(b"garbage").is_err());
//! ```

pub mod error;
pub mod handshake;
pub mod types;

pub use error::{HandshakeError, UsbError};
pub use handshake::{UPGRADE_REQUEST, UPGRADE_RESPONSE_PREFIX, check_upgrade_response};
pub use types::{
    DeviceId, DeviceInfo, EndpointSelector, HotplugEvent, TransferResult, TransferStatus,
};
