//! Async channel bridge between Tokio runtime and USB thread
//!
//! [`UsbBridge`] is the async half: it implements [`UsbHost`] by turning
//! every call into a [`UsbCommand`] carrying a oneshot responder.
//! [`UsbWorker`] is the blocking half owned by the USB thread, which
//! executes commands in FIFO order and publishes hot-plug events.
//!
//! `close` travels on its own unbounded queue so it is never dropped when
//! the command queue is full. The worker drains pending closes before every
//! command, which keeps a close ahead of any later re-open.

use crate::host::{UsbHost, UsbResult};
use async_channel::{Receiver, Sender, bounded, unbounded};
use std::cell::Cell;
use protocol::{DeviceId, DeviceInfo, EndpointSelector, HotplugEvent, TransferResult, UsbError};
use tokio::sync::{broadcast, oneshot};
use tracing::warn;

/// Capacity of the hot-plug broadcast feed
const HOTPLUG_CAPACITY: usize = 64;

/// Capacity of the command queue
const COMMAND_CAPACITY: usize = 256;

/// Channel a command's result is sent back on
pub type Responder<T> = oneshot::Sender<UsbResult<T>>;

/// Commands from Tokio runtime to USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List known devices
    Enumerate {
        response: Responder<Vec<DeviceInfo>>,
    },

    /// Grant access to one more device of a vendor
    RequestAuthorization {
        vendor_id: u16,
        response: Responder<DeviceInfo>,
    },

    /// Revoke access to a device (closes it if open)
    RevokeAuthorization {
        device: DeviceId,
        response: Responder<()>,
    },

    /// Open a device
    Open {
        device: DeviceId,
        response: Responder<()>,
    },

    /// Close a device (no response)
    Close { device: DeviceId },

    SelectConfiguration {
        device: DeviceId,
        configuration: u8,
        response: Responder<()>,
    },

    ClaimInterface {
        device: DeviceId,
        interface: u8,
        response: Responder<()>,
    },

    SelectAlternateSetting {
        device: DeviceId,
        interface: u8,
        alternate: u8,
        response: Responder<()>,
    },

    /// Reset a device
    Reset {
        device: DeviceId,
        response: Responder<()>,
    },

    /// Resolve the bulk-in max packet size for a selector
    MaxPacketSize {
        device: DeviceId,
        selector: EndpointSelector,
        response: Responder<usize>,
    },

    /// Bulk-out transfer
    BulkOut {
        device: DeviceId,
        endpoint: u8,
        data: Vec<u8>,
        response: Responder<TransferResult>,
    },

    /// Bulk-in transfer
    BulkIn {
        device: DeviceId,
        endpoint: u8,
        length: usize,
        response: Responder<TransferResult>,
    },

    /// Shutdown the USB thread gracefully
    Shutdown,
}

/// Handle for Tokio runtime (async)
///
/// A `None` on the command queue only wakes the worker for a queued close.
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<Option<UsbCommand>>,
    close_tx: Sender<DeviceId>,
    hotplug_tx: broadcast::Sender<HotplugEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(Some(cmd))
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the USB thread to stop after the commands already queued
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.send_command(UsbCommand::Shutdown).await
    }

    /// Send a command and wait for its result
    async fn request<T, F>(&self, build: F) -> UsbResult<T>
    where
        T: Send,
        F: FnOnce(Responder<T>) -> UsbCommand + Send,
    {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Some(build(tx)))
            .await
            .map_err(|_| worker_unavailable())?;
        rx.await.map_err(|_| worker_unavailable())?
    }
}

fn worker_unavailable() -> UsbError {
    UsbError::other("USB worker unavailable")
}

impl UsbHost for UsbBridge {
    async fn enumerate(&self) -> UsbResult<Vec<DeviceInfo>> {
        self.request(|response| UsbCommand::Enumerate { response })
            .await
    }

    async fn request_authorization(&self, vendor_id: u16) -> UsbResult<DeviceInfo> {
        self.request(|response| UsbCommand::RequestAuthorization {
            vendor_id,
            response,
        })
        .await
    }

    async fn revoke_authorization(&self, device: DeviceId) -> UsbResult<()> {
        self.request(|response| UsbCommand::RevokeAuthorization { device, response })
            .await
    }

    async fn open(&self, device: DeviceId) -> UsbResult<()> {
        self.request(|response| UsbCommand::Open { device, response })
            .await
    }

    fn close(&self, device: DeviceId) {
        if self.close_tx.try_send(device).is_err() {
            warn!("USB worker gone, device {} not closed", device);
            return;
        }
        // A full queue means the worker is busy and sees the close next
        let _ = self.cmd_tx.try_send(None);
    }

    async fn select_configuration(&self, device: DeviceId, configuration: u8) -> UsbResult<()> {
        self.request(|response| UsbCommand::SelectConfiguration {
            device,
            configuration,
            response,
        })
        .await
    }

    async fn claim_interface(&self, device: DeviceId, interface: u8) -> UsbResult<()> {
        self.request(|response| UsbCommand::ClaimInterface {
            device,
            interface,
            response,
        })
        .await
    }

    async fn select_alternate_setting(
        &self,
        device: DeviceId,
        interface: u8,
        alternate: u8,
    ) -> UsbResult<()> {
        self.request(|response| UsbCommand::SelectAlternateSetting {
            device,
            interface,
            alternate,
            response,
        })
        .await
    }

    async fn reset(&self, device: DeviceId) -> UsbResult<()> {
        self.request(|response| UsbCommand::Reset { device, response })
            .await
    }

    async fn max_packet_size(
        &self,
        device: DeviceId,
        selector: EndpointSelector,
    ) -> UsbResult<usize> {
        self.request(|response| UsbCommand::MaxPacketSize {
            device,
            selector,
            response,
        })
        .await
    }

    async fn bulk_transfer_out(
        &self,
        device: DeviceId,
        endpoint: u8,
        data: Vec<u8>,
    ) -> UsbResult<TransferResult> {
        self.request(|response| UsbCommand::BulkOut {
            device,
            endpoint,
            data,
            response,
        })
        .await
    }

    async fn bulk_transfer_in(
        &self,
        device: DeviceId,
        endpoint: u8,
        max_length: usize,
    ) -> UsbResult<TransferResult> {
        self.request(|response| UsbCommand::BulkIn {
            device,
            endpoint,
            length: max_length,
            response,
        })
        .await
    }

    fn hotplug_events(&self) -> broadcast::Receiver<HotplugEvent> {
        self.hotplug_tx.subscribe()
    }
}

/// Handle for USB thread (blocking)
pub struct UsbWorker {
    cmd_rx: Receiver<Option<UsbCommand>>,
    close_rx: Receiver<DeviceId>,
    /// Command received while a close was still queued
    pending: Cell<Option<UsbCommand>>,
    hotplug_tx: broadcast::Sender<HotplugEvent>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    ///
    /// Queued closes always come first.
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        loop {
            if let Some(cmd) = self.next_ready() {
                return Ok(cmd);
            }
            let queued = self
                .cmd_rx
                .recv_blocking()
                .map_err(|e| crate::Error::Channel(e.to_string()))?;
            self.pending.set(queued);
        }
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        loop {
            if let Some(cmd) = self.next_ready() {
                return Some(cmd);
            }
            let queued = self.cmd_rx.try_recv().ok()?;
            self.pending.set(queued);
        }
    }

    fn next_ready(&self) -> Option<UsbCommand> {
        match self.close_rx.try_recv() {
            Ok(device) => Some(UsbCommand::Close { device }),
            Err(_) => self.pending.take(),
        }
    }

    /// Sender side of the hot-plug feed, for the event pump thread
    pub fn hotplug_sender(&self) -> broadcast::Sender<HotplugEvent> {
        self.hotplug_tx.clone()
    }

    /// Publish a hot-plug event; returns the number of subscribers reached
    pub fn publish_hotplug(&self, event: HotplugEvent) -> usize {
        self.hotplug_tx.send(event).unwrap_or(0)
    }
}

/// Create the channel bridge between Tokio and USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(COMMAND_CAPACITY);
    let (close_tx, close_rx) = unbounded();
    let (hotplug_tx, _) = broadcast::channel(HOTPLUG_CAPACITY);

    (
        UsbBridge {
            cmd_tx,
            close_tx,
            hotplug_tx: hotplug_tx.clone(),
        },
        UsbWorker {
            cmd_rx,
            close_rx,
            pending: Cell::new(None),
            hotplug_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_usb_bridge();

        // Spawn a thread to simulate USB worker
        let handle = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            match cmd {
                UsbCommand::Enumerate { response } => {
                    let _ = response.send(Ok(Vec::new()));
                    true
                }
                _ => false,
            }
        });

        let devices = bridge.enumerate().await.unwrap();
        assert!(devices.is_empty());
        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_worker_error_is_forwarded() {
        let (bridge, worker) = create_usb_bridge();

        let handle = std::thread::spawn(move || {
            if let Ok(UsbCommand::Open { response, .. }) = worker.recv_command() {
                let _ = response.send(Err(UsbError::Busy));
            }
        });

        assert_eq!(bridge.open(DeviceId(1)).await, Err(UsbError::Busy));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_worker_reports_unavailable() {
        let (bridge, worker) = create_usb_bridge();
        drop(worker);

        let err = bridge.reset(DeviceId(1)).await.unwrap_err();
        assert!(matches!(err, UsbError::Other { .. }));
    }

    #[test]
    fn test_close_is_queued_without_waiting() {
        let (bridge, worker) = create_usb_bridge();
        bridge.close(DeviceId(4));

        match worker.try_recv_command() {
            Some(UsbCommand::Close { device }) => assert_eq!(device, DeviceId(4)),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_close_survives_full_queue() {
        let (bridge, worker) = create_usb_bridge();
        for _ in 0..COMMAND_CAPACITY {
            let (tx, _rx) = oneshot::channel();
            bridge
                .cmd_tx
                .try_send(Some(UsbCommand::Reset {
                    device: DeviceId(1),
                    response: tx,
                }))
                .unwrap();
        }
        assert!(bridge.cmd_tx.is_full());

        bridge.close(DeviceId(7));

        match worker.try_recv_command() {
            Some(UsbCommand::Close { device }) => assert_eq!(device, DeviceId(7)),
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(matches!(
            worker.try_recv_command(),
            Some(UsbCommand::Reset { .. })
        ));
    }

    #[test]
    fn test_close_queued_after_receive_goes_first() {
        let (bridge, worker) = create_usb_bridge();
        let (tx, _rx) = oneshot::channel();
        bridge
            .cmd_tx
            .try_send(Some(UsbCommand::Open {
                device: DeviceId(2),
                response: tx,
            }))
            .unwrap();

        // The open is pulled off the queue, then a close lands
        worker.pending.set(worker.cmd_rx.try_recv().unwrap());
        bridge.close(DeviceId(2));

        assert!(matches!(
            worker.try_recv_command(),
            Some(UsbCommand::Close { .. })
        ));
        assert!(matches!(
            worker.try_recv_command(),
            Some(UsbCommand::Open { .. })
        ));
        // Only the wake-up was left behind
        assert!(worker.try_recv_command().is_none());
    }

    #[tokio::test]
    async fn test_hotplug_fan_out() {
        let (bridge, worker) = create_usb_bridge();
        let mut first = bridge.hotplug_events();
        let mut second = bridge.hotplug_events();

        let event = HotplugEvent::Disconnected {
            bus_number: 1,
            device_address: 2,
        };
        assert_eq!(worker.publish_hotplug(event.clone()), 2);

        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }
}
