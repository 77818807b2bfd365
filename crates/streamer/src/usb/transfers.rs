//! Bulk transfer execution
//!
//! Blocking rusb bulk transfers run on the USB thread, with rusb errors
//! mapped to protocol errors.

use protocol::{TransferResult, TransferStatus, UsbError};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Write `data` to a bulk-out endpoint
///
/// A stalled endpoint is reported as a `Stall` result, not an error.
pub fn bulk_out(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    data: &[u8],
    timeout: Duration,
) -> Result<TransferResult, UsbError> {
    match handle.write_bulk(endpoint, data, timeout) {
        Ok(written) => {
            trace!("Bulk out {:#04x}: {}/{} bytes", endpoint, written, data.len());
            Ok(TransferResult::ok(Vec::new()))
        }
        Err(rusb::Error::Pipe) => {
            warn!("Bulk out endpoint {:#04x} stalled", endpoint);
            Ok(TransferResult::stall())
        }
        Err(e) => Err(map_rusb_error(e)),
    }
}

/// Read up to `length` bytes from a bulk-in endpoint
///
/// A timeout means the device had nothing to send and yields an empty `Ok`
/// result. Stall and babble are reported as statuses.
pub fn bulk_in(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    length: usize,
    timeout: Duration,
) -> Result<TransferResult, UsbError> {
    let mut buffer = vec![0u8; length];
    match handle.read_bulk(endpoint, &mut buffer, timeout) {
        Ok(len) => {
            buffer.truncate(len);
            trace!("Bulk in {:#04x}: {} bytes", endpoint, len);
            Ok(TransferResult::ok(buffer))
        }
        Err(rusb::Error::Timeout) => {
            debug!(
                "Bulk in timeout on endpoint {:#04x} - returning empty (no data available)",
                endpoint
            );
            Ok(TransferResult::ok(Vec::new()))
        }
        Err(rusb::Error::Pipe) => {
            warn!("Bulk in endpoint {:#04x} stalled", endpoint);
            Ok(TransferResult::stall())
        }
        Err(rusb::Error::Overflow) => {
            warn!("Bulk in endpoint {:#04x} babbled", endpoint);
            Ok(TransferResult {
                status: TransferStatus::Babble,
                payload: Vec::new(),
            })
        }
        Err(e) => Err(map_rusb_error(e)),
    }
}

/// Map rusb::Error to protocol::UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}
