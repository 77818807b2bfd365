//! USB subsystem
//!
//! The rusb-backed host behind [`common::UsbBridge`]:
//! - Device enumeration, authorization and exclusive open
//! - Hot-plug detection (libusb callbacks, or bus polling)
//! - Bulk transfer execution
//!
//! libusb calls block, so everything here runs on dedicated threads and is
//! reached from the Tokio runtime through the bridge's command channel.

pub mod device;
pub mod manager;
pub mod transfers;
pub mod worker;

pub use device::UsbDevice;
pub use manager::DeviceManager;
pub use worker::{UsbThreads, UsbWorkerThread, WorkerSettings, spawn_usb_worker};
