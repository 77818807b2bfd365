//! Streamer configuration management

use crate::usb::WorkerSettings;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StreamerConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Vendor to stream from, as a hex string ("0x2ec2")
    #[serde(default = "UsbSettings::default_vendor_id")]
    pub vendor_id: String,
    /// Treat every attached device as already authorized
    #[serde(default = "UsbSettings::default_auto_authorize")]
    pub auto_authorize: bool,
    /// Timeout of one bulk transfer in milliseconds
    #[serde(default = "UsbSettings::default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
    /// Bus polling interval when libusb lacks hot-plug support
    #[serde(default = "UsbSettings::default_poll_interval")]
    pub hotplug_poll_interval_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            auto_authorize: Self::default_auto_authorize(),
            transfer_timeout_ms: Self::default_transfer_timeout(),
            hotplug_poll_interval_ms: Self::default_poll_interval(),
        }
    }
}

impl UsbSettings {
    fn default_vendor_id() -> String {
        "0x2ec2".to_string()
    }

    fn default_auto_authorize() -> bool {
        true
    }

    fn default_transfer_timeout() -> u64 {
        1000
    }

    fn default_poll_interval() -> u64 {
        1000
    }

    /// Parsed vendor id; call after validation
    pub fn vendor_id(&self) -> Result<u16> {
        StreamerConfig::parse_hex_id(&self.vendor_id, "vendor_id")
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            auto_authorize: self.auto_authorize,
            transfer_timeout: Duration::from_millis(self.transfer_timeout_ms),
            hotplug_poll_interval: Duration::from_millis(self.hotplug_poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Frames buffered between the pipeline and the printer
    #[serde(default = "StreamSettings::default_channel_capacity")]
    pub channel_capacity: usize,
    /// Don't print transfers that carried no data
    #[serde(default = "StreamSettings::default_skip_empty")]
    pub skip_empty_frames: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            channel_capacity: Self::default_channel_capacity(),
            skip_empty_frames: Self::default_skip_empty(),
        }
    }
}

impl StreamSettings {
    fn default_channel_capacity() -> usize {
        64
    }

    fn default_skip_empty() -> bool {
        true
    }
}

impl StreamerConfig {
    /// Load from `path`, or from the first default location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/deck-stream/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: StreamerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("deck-stream").join("config.toml")
        } else {
            PathBuf::from(".config/deck-stream/config.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        Self::parse_hex_id(&self.usb.vendor_id, "vendor_id")?;

        if self.usb.transfer_timeout_ms == 0 {
            return Err(anyhow!("transfer_timeout_ms must be greater than 0"));
        }
        if self.usb.hotplug_poll_interval_ms == 0 {
            return Err(anyhow!("hotplug_poll_interval_ms must be greater than 0"));
        }
        if self.stream.channel_capacity == 0 {
            return Err(anyhow!("channel_capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Parse a "0x"-prefixed hex id of 1-4 digits
    fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x2ec2')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
    }
}

/// Load a config file from a path that may start with `~`
pub fn load_config(path: &str) -> Result<StreamerConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    StreamerConfig::load(Some(path_buf))
}
