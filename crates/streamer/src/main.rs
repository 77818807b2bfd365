//! deck-stream
//!
//! Streams the bulk-in traffic of a Loupedeck-style USB console to stdout.
//! Logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use common::{UsbBridge, create_usb_bridge, setup_logging};
use protocol::TransferResult;
use std::fmt::Write as _;
use streamer::config::{self, StreamSettings, StreamerConfig};
use streamer::usb::spawn_usb_worker;
use streamer::{AdapterProfile, DeviceRegistry, StreamPipeline};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "deck-stream")]
#[command(author, version, about = "Stream frames from a USB control surface")]
#[command(long_about = "
Waits for a supported USB console, brings it up with the upgrade handshake
and prints every bulk-in transfer as hex until interrupted.

EXAMPLES:
    # Stream from the first attached console
    deck-stream

    # List matching devices as JSON
    deck-stream --list-devices --json

    # Authorize one device explicitly, then stream
    deck-stream --discover

CONFIGURATION:
    Configuration files are looked up in the following order:
    1. Path specified with --config
    2. ~/.config/deck-stream/config.toml
    3. /etc/deck-stream/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List matching USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the device list as JSON
    #[arg(long, requires = "list_devices")]
    json: bool,

    /// Authorize one more device of the vendor before streaming
    #[arg(long, conflicts_with_all = ["list_devices", "forget"])]
    discover: bool,

    /// Revoke every authorized device of the vendor and exit
    #[arg(long, conflicts_with = "list_devices")]
    forget: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = StreamerConfig::default();
        let path = StreamerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        StreamerConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("deck-stream v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let vendor_id = config.usb.vendor_id()?;

    // libusb blocks, so it lives on dedicated threads behind the bridge
    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let (usb_bridge, worker) = create_usb_bridge();
    let usb_threads = spawn_usb_worker(worker, context, config.usb.worker_settings())
        .context("Failed to spawn USB threads")?;

    let registry = DeviceRegistry::new(usb_bridge.clone(), vendor_id);
    let result = run(&args, &config, registry).await;

    info!("Shutting down USB subsystem...");
    if let Err(e) = usb_bridge.shutdown().await {
        error!("Error shutting down USB worker: {:#}", e);
    }
    if let Err(e) = tokio::task::spawn_blocking(move || usb_threads.join()).await {
        error!("Failed to join USB threads: {}", e);
    }

    result
}

async fn run(
    args: &Args,
    config: &StreamerConfig,
    registry: DeviceRegistry<UsbBridge>,
) -> Result<()> {
    if args.list_devices {
        return list_devices_mode(&registry, args.json).await;
    }

    if args.forget {
        registry
            .forget_all()
            .await
            .context("Failed to forget devices")?;
        println!("Forgot all devices of vendor {:04x}", registry.vendor_id());
        return Ok(());
    }

    if args.discover {
        let device = registry
            .request_new()
            .await
            .context("No device was authorized")?;
        println!("Authorized {}", device);
    }

    stream_mode(registry, &config.stream).await
}

/// List matching devices and exit
async fn list_devices_mode(registry: &DeviceRegistry<UsbBridge>, json: bool) -> Result<()> {
    let devices = registry.list().await;

    if json {
        let output =
            serde_json::to_string_pretty(&devices).context("Failed to serialize device list")?;
        println!("{}", output);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices of vendor {:04x} found.", registry.vendor_id());
    } else {
        println!("Found {} device(s):\n", devices.len());
        for device in devices {
            println!(
                "  [{}] {:04x}:{:04x} - {}",
                device.id.0,
                device.vendor_id,
                device.product_id,
                device.product.as_deref().unwrap_or("Unknown Product")
            );
            println!(
                "      Bus {:03} Device {:03}",
                device.bus_number, device.device_address
            );
        }
    }

    Ok(())
}

/// Print frames until Ctrl+C or a terminal pipeline error
async fn stream_mode(registry: DeviceRegistry<UsbBridge>, settings: &StreamSettings) -> Result<()> {
    let pipeline = StreamPipeline::new(registry, AdapterProfile::LOUPEDECK);
    let mut frames = pipeline.subscribe(settings.channel_capacity);

    info!("Waiting for a device, press Ctrl+C to stop");

    loop {
        tokio::select! {
            item = frames.recv() => match item {
                Some(Ok(frame)) => {
                    if settings.skip_empty_frames && frame.is_empty() {
                        continue;
                    }
                    println!("{}", format_frame(&frame));
                }
                Some(Err(e)) => return Err(e).context("Streaming stopped"),
                None => return Ok(()),
            },
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
        }
    }
}

fn format_frame(frame: &TransferResult) -> String {
    let mut line = format!("{:?} {:>4}:", frame.status, frame.payload.len());
    for byte in &frame.payload {
        let _ = write!(line, " {:02x}", byte);
    }
    line
}
