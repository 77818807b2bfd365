//! Device registry
//!
//! Tracks which authorized devices of one vendor are present. Holds no
//! handles and no locks: every query goes to the host.
//!
//! Hot-plug notifications are coarse (any vendor, no delta). The registry
//! answers each one by enumerating again and re-filtering, so a
//! [`Snapshot`] is always the result of one complete enumeration.

use crate::error::RegistryError;
use common::UsbHost;
use protocol::{DeviceInfo, HotplugEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// Capacity of the manual refresh feed
const REFRESH_CAPACITY: usize = 16;

/// Owned, ordered view of the matching devices at one point in time
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot(pub Vec<DeviceInfo>);

impl Snapshot {
    /// First device in host order
    #[inline]
    pub fn first(&self) -> Option<&DeviceInfo> {
        self.0.first()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.0.iter()
    }

    /// Consume the snapshot and return the device list
    #[inline]
    pub fn into_inner(self) -> Vec<DeviceInfo> {
        self.0
    }
}

impl IntoIterator for Snapshot {
    type Item = DeviceInfo;
    type IntoIter = std::vec::IntoIter<DeviceInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Vendor-filtered view of the host's authorized devices
#[derive(Clone)]
pub struct DeviceRegistry<H: UsbHost> {
    host: H,
    vendor_id: u16,
    refresh_tx: broadcast::Sender<()>,
}

impl<H: UsbHost> DeviceRegistry<H> {
    pub fn new(host: H, vendor_id: u16) -> Self {
        let (refresh_tx, _) = broadcast::channel(REFRESH_CAPACITY);
        Self {
            host,
            vendor_id,
            refresh_tx,
        }
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Matching devices in host order
    ///
    /// A host failure is logged and reported as "no devices".
    pub async fn list(&self) -> Vec<DeviceInfo> {
        match self.host.enumerate().await {
            Ok(devices) => devices
                .into_iter()
                .filter(|d| d.vendor_id == self.vendor_id)
                .collect(),
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                Vec::new()
            }
        }
    }

    /// Ask the host to authorize another device of our vendor
    pub async fn request_new(&self) -> Result<DeviceInfo, RegistryError> {
        match self.host.request_authorization(self.vendor_id).await {
            Ok(device) => {
                info!("Authorized {}", device);
                self.reload();
                Ok(device)
            }
            Err(e) => {
                let err = RegistryError::from(e);
                warn!(
                    "Authorization request for vendor {:04x} failed: {}",
                    self.vendor_id, err
                );
                Err(err)
            }
        }
    }

    /// Revoke every matching device, then refresh
    ///
    /// Keeps going past a failed revocation; the first failure is returned.
    pub async fn forget_all(&self) -> Result<(), RegistryError> {
        let devices = self.list().await;
        let mut first_error = None;

        for device in &devices {
            match self.host.revoke_authorization(device.id).await {
                Ok(()) => info!("Forgot {}", device),
                Err(e) => {
                    warn!("Failed to forget {}: {}", device, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.reload();
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Wake every [`SnapshotStream`] for a fresh enumeration
    pub fn reload(&self) {
        let receivers = self.refresh_tx.send(()).unwrap_or(0);
        debug!("Registry refresh ({} subscribers)", receivers);
    }

    /// Independent subscription to snapshot changes
    pub fn changes(&self) -> SnapshotStream<H> {
        SnapshotStream {
            hotplug_rx: self.host.hotplug_events(),
            refresh_rx: self.refresh_tx.subscribe(),
            registry: self.clone(),
            started: false,
            hotplug_open: true,
        }
    }
}

/// Endless sequence of [`Snapshot`]s
///
/// The first [`next`](SnapshotStream::next) enumerates immediately. Every
/// later one waits for a hot-plug event or a manual refresh first.
pub struct SnapshotStream<H: UsbHost> {
    registry: DeviceRegistry<H>,
    hotplug_rx: broadcast::Receiver<HotplugEvent>,
    refresh_rx: broadcast::Receiver<()>,
    started: bool,
    hotplug_open: bool,
}

impl<H: UsbHost> SnapshotStream<H> {
    pub async fn next(&mut self) -> Snapshot {
        if self.started {
            self.wait_for_trigger().await;
        } else {
            self.started = true;
        }
        Snapshot(self.registry.list().await)
    }

    async fn wait_for_trigger(&mut self) {
        loop {
            tokio::select! {
                event = self.hotplug_rx.recv(), if self.hotplug_open => match event {
                    Ok(event) => {
                        debug!("Hot-plug: {:?}", event);
                        return;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        debug!("Missed {} hot-plug events", missed);
                        return;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Hot-plug feed closed, relying on manual refresh");
                        self.hotplug_open = false;
                    }
                },
                // The stream owns a registry clone, so this feed never closes
                _ = self.refresh_rx.recv() => return,
            }
        }
    }
}
