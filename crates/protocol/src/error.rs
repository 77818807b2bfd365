//! Protocol error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// USB error types
///
/// Host-level failure of a USB operation. Mirrors the libusb error codes,
/// plus `Cancelled` for a declined authorization prompt.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsbError {
    /// Transfer timed out
    #[error("operation timed out")]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("endpoint stalled")]
    Pipe,
    /// Device was disconnected
    #[error("device disconnected")]
    NoDevice,
    /// Device or endpoint not found
    #[error("device or endpoint not found")]
    NotFound,
    /// Device is busy (already open or interface claimed elsewhere)
    #[error("device busy")]
    Busy,
    /// Buffer overflow
    #[error("buffer overflow")]
    Overflow,
    /// I/O error
    #[error("I/O error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied")]
    Access,
    /// The user (or host) declined to select a device
    #[error("no device selected")]
    Cancelled,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

impl UsbError {
    pub fn other(message: impl Into<String>) -> Self {
        UsbError::Other {
            message: message.into(),
        }
    }
}

/// Upgrade handshake failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// Response did not carry the expected prefix
    #[error("invalid handshake response: {response:?}")]
    Rejected { response: String },
}
