//! Accessory configuration management

use crate::backpressure::BackpressureStrategy;
use crate::platform::ACTION_USB_PERMISSION;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessoryConfig {
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Accessory channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Read chunk size in bytes
    #[serde(default = "ChannelSettings::default_buffer_size")]
    pub buffer_size: usize,
    /// Strategy applied to the stream returned by `open`
    #[serde(default)]
    pub backpressure: BackpressureStrategy,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            buffer_size: Self::default_buffer_size(),
            backpressure: BackpressureStrategy::default(),
        }
    }
}

impl ChannelSettings {
    fn default_buffer_size() -> usize {
        16 * 1024
    }
}

/// Event bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Per-stream broadcast capacity before slow subscribers lag
    #[serde(default = "BusSettings::default_event_capacity")]
    pub event_capacity: usize,
    /// Action name carried by permission tokens
    #[serde(default = "BusSettings::default_permission_action")]
    pub permission_action: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            event_capacity: Self::default_event_capacity(),
            permission_action: Self::default_permission_action(),
        }
    }
}

impl BusSettings {
    fn default_event_capacity() -> usize {
        64
    }

    fn default_permission_action() -> String {
        ACTION_USB_PERMISSION.to_string()
    }
}

/// libusb host platform settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    /// Device filters (VID:PID patterns); empty allows everything
    #[serde(default)]
    pub filters: Vec<String>,
    /// Bulk read timeout; an expired read counts as an empty read
    #[serde(default = "HostSettings::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "HostSettings::default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            read_timeout_ms: Self::default_read_timeout_ms(),
            write_timeout_ms: Self::default_write_timeout_ms(),
        }
    }
}

impl HostSettings {
    fn default_read_timeout_ms() -> u64 {
        100
    }

    fn default_write_timeout_ms() -> u64 {
        1000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl AccessoryConfig {
    /// Load configuration from file
    ///
    /// Without an explicit path the default location is tried, then
    /// `/etc/usb-accessory/accessory.toml`.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-accessory/accessory.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: AccessoryConfig = toml::from_str(&content)
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

    /// Save configuration to the specified path
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
            config_dir.join("usb-accessory").join("accessory.toml")
        } else {
            PathBuf::from(".config/usb-accessory/accessory.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.channel.buffer_size == 0 {
            return Err(anyhow!("channel.buffer_size must be greater than zero"));
        }

        self.channel
            .backpressure
            .validate()
            .map_err(|e| anyhow!("channel.backpressure: {}", e))?;

        if self.bus.event_capacity == 0 {
            return Err(anyhow!("bus.event_capacity must be greater than zero"));
        }

        if self.bus.permission_action.is_empty() {
            return Err(anyhow!("bus.permission_action must not be empty"));
        }

        for filter in &self.host.filters {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<AccessoryConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    AccessoryConfig::load(Some(path_buf))
}
