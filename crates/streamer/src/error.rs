//! Error types of the streaming core

use crate::adapter::AdapterState;
use protocol::UsbError;
use std::time::Duration;
use thiserror::Error;

/// Device registry errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The host refused access to the device
    #[error("permission denied")]
    PermissionDenied,

    /// No device was selected in the authorization prompt
    #[error("no device selected")]
    UserCancelled,

    #[error("USB host error: {0}")]
    Host(UsbError),
}

impl From<UsbError> for RegistryError {
    fn from(err: UsbError) -> Self {
        match err {
            UsbError::Access => RegistryError::PermissionDenied,
            UsbError::Cancelled => RegistryError::UserCancelled,
            other => RegistryError::Host(other),
        }
    }
}

/// Device adapter errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// Operation not allowed in the current state
    #[error("cannot {operation} while {state}")]
    InvalidState {
        state: AdapterState,
        operation: &'static str,
    },

    /// Handshake response lacked the expected prefix
    #[error("handshake rejected: {response:?}")]
    HandshakeRejected { response: String },

    /// No handshake response within the deadline
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Handshake failed again after the device reset
    #[error("adapter initialization failed: {0}")]
    InitFailed(Box<AdapterError>),

    /// Transport-level failure of a USB operation
    #[error("transfer failed: {0}")]
    Transfer(#[from] UsbError),
}

impl AdapterError {
    /// Whether a device reset may cure this failure
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            AdapterError::HandshakeRejected { .. } | AdapterError::HandshakeTimeout(_)
        )
    }
}

/// Stream pipeline errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// Every chain attempt failed
    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: AdapterError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_mapping() {
        assert_eq!(
            RegistryError::from(UsbError::Access),
            RegistryError::PermissionDenied
        );
        assert_eq!(
            RegistryError::from(UsbError::Cancelled),
            RegistryError::UserCancelled
        );
        assert_eq!(
            RegistryError::from(UsbError::Io),
            RegistryError::Host(UsbError::Io)
        );
    }

    #[test]
    fn test_handshake_failures_are_resettable() {
        let rejected = AdapterError::HandshakeRejected {
            response: String::new(),
        };
        assert!(rejected.is_handshake_failure());
        assert!(AdapterError::HandshakeTimeout(Duration::from_millis(500)).is_handshake_failure());
        assert!(!AdapterError::Transfer(UsbError::Pipe).is_handshake_failure());
        assert!(!AdapterError::InitFailed(Box::new(rejected)).is_handshake_failure());
    }

    #[test]
    fn test_exhausted_display() {
        let err = PipelineError::Exhausted {
            attempts: 3,
            last: AdapterError::Transfer(UsbError::NoDevice),
        };
        assert_eq!(
            err.to_string(),
            "giving up after 3 attempts: transfer failed: device disconnected"
        );
    }
}
