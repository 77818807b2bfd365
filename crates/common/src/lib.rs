//! Common utilities for deck-stream
//!
//! This crate provides the pieces shared between the streaming core and the
//! USB worker thread: the host USB capability trait, the async channel bridge
//! that implements it on top of a blocking worker, error handling, logging
//! setup and, behind the `test-utils` feature, test utilities.

pub mod channel;
pub mod error;
pub mod host;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use channel::{UsbBridge, UsbCommand, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use host::{UsbHost, UsbResult};
pub use logging::setup_logging;
