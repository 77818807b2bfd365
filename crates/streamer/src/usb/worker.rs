//! USB worker threads
//!
//! The command thread owns the [`DeviceManager`] and executes
//! [`UsbCommand`]s one at a time in arrival order, so a `close` queued from
//! a dropped adapter always lands before a later `open` of the same device.
//!
//! The event thread runs `libusb_handle_events()` for hot-plug callbacks,
//! or polls the bus when libusb has no hot-plug support, and publishes
//! [`HotplugEvent`]s on the bridge's broadcast feed.

use crate::usb::manager::DeviceManager;
use common::{UsbCommand, UsbWorker};
use protocol::HotplugEvent;
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// How long one `handle_events` call may block
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Settings of the USB threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Treat every attached device as authorized
    pub auto_authorize: bool,
    /// Timeout of one bulk transfer
    pub transfer_timeout: Duration,
    /// Bus polling interval when hot-plug is unavailable
    pub hotplug_poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            auto_authorize: true,
            transfer_timeout: Duration::from_millis(1000),
            hotplug_poll_interval: Duration::from_millis(1000),
        }
    }
}

/// USB command thread
pub struct UsbWorkerThread {
    manager: DeviceManager,
    worker: UsbWorker,
}

impl UsbWorkerThread {
    pub fn new(worker: UsbWorker, context: Context, settings: WorkerSettings) -> Self {
        let manager = DeviceManager::new(
            context,
            settings.auto_authorize,
            settings.transfer_timeout,
        );
        Self { manager, worker }
    }

    /// Execute commands until `Shutdown` or until every bridge is dropped
    pub fn run(mut self) {
        info!("USB worker thread started");

        if let Err(e) = self.manager.refresh() {
            warn!("Initial USB enumeration failed: {}", e);
        }

        loop {
            match self.worker.recv_command() {
                Ok(UsbCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Ok(cmd) => self.handle_command(cmd),
                Err(e) => {
                    debug!("Command channel closed: {}", e);
                    break;
                }
            }
        }

        self.manager.close_all();
        info!("USB worker thread stopped");
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&mut self, cmd: UsbCommand) {
        // Keep the thread alive across a panicking command
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: UsbCommand) {
        let manager = &mut self.manager;
        match cmd {
            UsbCommand::Enumerate { response } => {
                let result = manager.list_devices();
                if let Ok(devices) = &result {
                    debug!("Enumerated {} authorized devices", devices.len());
                }
                let _ = response.send(result);
            }

            UsbCommand::RequestAuthorization {
                vendor_id,
                response,
            } => {
                debug!("Authorization requested for vendor {:#06x}", vendor_id);
                let _ = response.send(manager.request_authorization(vendor_id));
            }

            UsbCommand::RevokeAuthorization { device, response } => {
                let _ = response.send(manager.revoke_authorization(device));
            }

            UsbCommand::Open { device, response } => {
                let _ = response.send(manager.open(device));
            }

            UsbCommand::Close { device } => manager.close(device),

            UsbCommand::SelectConfiguration {
                device,
                configuration,
                response,
            } => {
                let _ = response.send(manager.select_configuration(device, configuration));
            }

            UsbCommand::ClaimInterface {
                device,
                interface,
                response,
            } => {
                let _ = response.send(manager.claim_interface(device, interface));
            }

            UsbCommand::SelectAlternateSetting {
                device,
                interface,
                alternate,
                response,
            } => {
                let result = manager.select_alternate_setting(device, interface, alternate);
                let _ = response.send(result);
            }

            UsbCommand::Reset { device, response } => {
                debug!("Resetting device {}", device);
                let _ = response.send(manager.reset(device));
            }

            UsbCommand::MaxPacketSize {
                device,
                selector,
                response,
            } => {
                let _ = response.send(manager.max_packet_size(device, selector));
            }

            UsbCommand::BulkOut {
                device,
                endpoint,
                data,
                response,
            } => {
                let _ = response.send(manager.bulk_out(device, endpoint, &data));
            }

            UsbCommand::BulkIn {
                device,
                endpoint,
                length,
                response,
            } => {
                let _ = response.send(manager.bulk_in(device, endpoint, length));
            }

            // Handled by run()
            UsbCommand::Shutdown => {}
        }
    }
}

/// Forwards libusb hot-plug callbacks to the broadcast feed
struct HotplugForwarder {
    hotplug_tx: broadcast::Sender<HotplugEvent>,
}

impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        let event = HotplugEvent::Connected {
            bus_number: device.bus_number(),
            device_address: device.address(),
            vendor_id: device.device_descriptor().ok().map(|d| d.vendor_id()),
        };
        debug!("Hot-plug: {:?}", event);
        let _ = self.hotplug_tx.send(event);
    }

    fn device_left(&mut self, device: Device<T>) {
        let event = HotplugEvent::Disconnected {
            bus_number: device.bus_number(),
            device_address: device.address(),
        };
        debug!("Hot-plug: {:?}", event);
        let _ = self.hotplug_tx.send(event);
    }
}

/// Hot-plug event thread
struct EventPump {
    context: Context,
    hotplug_tx: broadcast::Sender<HotplugEvent>,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
}

impl EventPump {
    fn run(self) {
        if !rusb::has_hotplug() {
            info!(
                "libusb lacks hot-plug support, polling every {:?}",
                self.poll_interval
            );
            self.poll();
            return;
        }

        let forwarder = HotplugForwarder {
            hotplug_tx: self.hotplug_tx.clone(),
        };
        let registration = match HotplugBuilder::new()
            .enumerate(false)
            .register::<Context, _>(&self.context, Box::new(forwarder))
        {
            Ok(registration) => registration,
            Err(e) => {
                warn!("Hot-plug registration failed ({}), falling back to polling", e);
                self.poll();
                return;
            }
        };
        debug!("Hot-plug callbacks registered");

        while !self.stop.load(Ordering::Acquire) {
            match self.context.handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TIMEOUT);
                }
            }
        }

        drop(registration);
        debug!("USB event thread stopped");
    }

    /// Diff the bus against the previous scan every `poll_interval`
    fn poll(&self) {
        let mut known = self.scan().unwrap_or_default();

        while !self.stop.load(Ordering::Acquire) {
            std::thread::sleep(self.poll_interval);
            let Some(current) = self.scan() else {
                continue;
            };

            for &(bus_number, device_address, vendor_id) in current.difference(&known) {
                let _ = self.hotplug_tx.send(HotplugEvent::Connected {
                    bus_number,
                    device_address,
                    vendor_id: Some(vendor_id),
                });
            }
            for &(bus_number, device_address, _) in known.difference(&current) {
                let _ = self.hotplug_tx.send(HotplugEvent::Disconnected {
                    bus_number,
                    device_address,
                });
            }
            known = current;
        }
    }

    fn scan(&self) -> Option<HashSet<(u8, u8, u16)>> {
        match self.context.devices() {
            Ok(devices) => Some(
                devices
                    .iter()
                    .filter_map(|d| {
                        let vendor_id = d.device_descriptor().ok()?.vendor_id();
                        Some((d.bus_number(), d.address(), vendor_id))
                    })
                    .collect(),
            ),
            Err(e) => {
                warn!("Failed to scan USB bus: {}", e);
                None
            }
        }
    }
}

/// Join handles of the USB threads
pub struct UsbThreads {
    command: JoinHandle<()>,
    events: JoinHandle<()>,
}

impl UsbThreads {
    /// Wait for both threads; call after `UsbBridge::shutdown`
    pub fn join(self) {
        if self.command.join().is_err() {
            error!("USB worker thread panicked");
        }
        if self.events.join().is_err() {
            error!("USB event thread panicked");
        }
    }
}

/// Spawn the USB command and event threads
///
/// Both stop once the command thread exits, after `Shutdown` or when every
/// bridge has been dropped.
pub fn spawn_usb_worker(
    worker: UsbWorker,
    context: Context,
    settings: WorkerSettings,
) -> std::io::Result<UsbThreads> {
    let stop = Arc::new(AtomicBool::new(false));

    let pump = EventPump {
        context: context.clone(),
        hotplug_tx: worker.hotplug_sender(),
        poll_interval: settings.hotplug_poll_interval,
        stop: Arc::clone(&stop),
    };
    let events = std::thread::Builder::new()
        .name("usb-events".to_string())
        .spawn(move || pump.run())?;

    let worker_thread = UsbWorkerThread::new(worker, context, settings);
    let command = start_command_thread(
        move || worker_thread.run(),
        stop,
        |body| {
            std::thread::Builder::new()
                .name("usb-worker".to_string())
                .spawn(body)
        },
    )?;

    Ok(UsbThreads { command, events })
}

/// Start the command thread; `stop` is raised when it exits or fails to start
fn start_command_thread<R, S>(
    run: R,
    stop: Arc<AtomicBool>,
    spawn: S,
) -> std::io::Result<JoinHandle<()>>
where
    R: FnOnce() + Send + 'static,
    S: FnOnce(Box<dyn FnOnce() + Send>) -> std::io::Result<JoinHandle<()>>,
{
    let exited = Arc::clone(&stop);
    let result = spawn(Box::new(move || {
        run();
        exited.store(true, Ordering::Release);
    }));

    if let Err(e) = &result {
        error!("Failed to spawn USB worker thread: {}", e);
        stop.store(true, Ordering::Release);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{UsbHost, create_usb_bridge};
    use protocol::{DeviceId, UsbError};

    #[test]
    fn test_default_settings() {
        let settings = WorkerSettings::default();
        assert!(settings.auto_authorize);
        assert_eq!(settings.transfer_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_failed_command_spawn_stops_event_pump() {
        let stop = Arc::new(AtomicBool::new(false));
        let result = start_command_thread(|| {}, Arc::clone(&stop), |_| {
            Err(std::io::Error::other("thread limit reached"))
        });

        assert!(result.is_err());
        assert!(stop.load(Ordering::Acquire));
    }

    #[test]
    fn test_command_thread_exit_raises_stop() {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = start_command_thread(|| {}, Arc::clone(&stop), |body| {
            std::thread::Builder::new().spawn(body)
        })
        .unwrap();

        handle.join().unwrap();
        assert!(stop.load(Ordering::Acquire));
    }

    // Needs libusb; skipped when no context can be created
    #[tokio::test]
    async fn test_worker_serves_bridge_until_shutdown() {
        let Ok(context) = Context::new() else {
            eprintln!("libusb unavailable, skipping");
            return;
        };
        let (bridge, worker) = create_usb_bridge();
        let threads = spawn_usb_worker(worker, context, WorkerSettings::default()).unwrap();

        assert_eq!(bridge.open(DeviceId(u32::MAX)).await, Err(UsbError::NotFound));
        bridge.close(DeviceId(u32::MAX));

        bridge.shutdown().await.unwrap();
        tokio::task::spawn_blocking(move || threads.join())
            .await
            .unwrap();
    }
}
