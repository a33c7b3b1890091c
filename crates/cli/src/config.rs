//! Application configuration management

use crate::usb::FtdiInterface;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stream::StreamConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Which device to open and how to talk to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// USB vendor ID, e.g. "0x0403"
    #[serde(default = "DeviceSettings::default_vendor_id")]
    pub vendor_id: String,
    /// USB product ID, e.g. "0x6014"
    #[serde(default = "DeviceSettings::default_product_id")]
    pub product_id: String,
    /// FTDI channel (A or B)
    #[serde(default)]
    pub interface: FtdiInterface,
    /// Read timeout in milliseconds; also the stall detection period
    #[serde(default = "DeviceSettings::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
            interface: FtdiInterface::default(),
            read_timeout_ms: Self::default_read_timeout_ms(),
        }
    }
}

impl DeviceSettings {
    fn default_vendor_id() -> String {
        "0x0403".to_string()
    }

    fn default_product_id() -> String {
        "0x6014".to_string() // FT232H
    }

    fn default_read_timeout_ms() -> u64 {
        5000
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn vendor_id(&self) -> Result<u16> {
        parse_hex_id(&self.vendor_id, "VID")
    }

    pub fn product_id(&self) -> Result<u16> {
        parse_hex_id(&self.product_id, "PID")
    }
}

/// Where payload goes and when to stop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Output file; unset or "-" writes to stdout
    #[serde(default)]
    pub path: Option<String>,
    /// Stop after this many payload bytes
    #[serde(default)]
    pub byte_limit: Option<u64>,
    /// Stop after this many seconds
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

impl OutputSettings {
    /// Output file with `~` expanded, `None` for stdout
    pub fn resolved_path(&self) -> Option<PathBuf> {
        match self.path.as_deref() {
            None | Some("-") => None,
            Some(path) => Some(PathBuf::from(shellexpand::tilde(path).as_ref())),
        }
    }

    pub fn duration_limit(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
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

impl AppConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/fifo-stream/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
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

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("fifo-stream").join("config.toml")
        } else {
            PathBuf::from(".config/fifo-stream/config.toml")
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

        self.device.vendor_id()?;
        self.device.product_id()?;

        if self.device.read_timeout_ms == 0 {
            return Err(anyhow!("read_timeout_ms must be greater than 0"));
        }

        self.stream
            .validate()
            .map_err(|e| anyhow!("Invalid [stream] section: {}", e))?;

        Ok(())
    }
}

/// Parse a hex USB ID such as "0x0403"
pub fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x0403')",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.device.vendor_id().unwrap(), 0x0403);
        assert_eq!(config.device.product_id().unwrap(), 0x6014);
        assert_eq!(config.device.interface, FtdiInterface::A);
        assert_eq!(config.device.read_timeout(), Duration::from_secs(5));
        assert_eq!(config.stream.num_transfers, 256);
        assert!(config.output.resolved_path().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("0x0403", "VID").unwrap(), 0x0403);
        assert_eq!(parse_hex_id("0X6010", "PID").unwrap(), 0x6010);
        assert!(parse_hex_id("0403", "VID").is_err());
        assert!(parse_hex_id("0x", "VID").is_err());
        assert!(parse_hex_id("0x12345", "VID").is_err());
        assert!(parse_hex_id("0xGHIJ", "VID").is_err());
    }

    #[test]
    fn test_stdout_path() {
        let output = OutputSettings {
            path: Some("-".to_string()),
            ..OutputSettings::default()
        };
        assert!(output.resolved_path().is_none());

        let output = OutputSettings {
            path: Some("/tmp/capture.bin".to_string()),
            ..OutputSettings::default()
        };
        assert_eq!(
            output.resolved_path(),
            Some(PathBuf::from("/tmp/capture.bin"))
        );
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.logging.level, parsed.logging.level);
        assert_eq!(config.stream, parsed.stream);
        assert_eq!(config.device.product_id, parsed.device.product_id);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.device.interface = FtdiInterface::B;
        config.output.byte_limit = Some(4096);
        config.save(&path).unwrap();

        let loaded = AppConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device.interface, FtdiInterface::B);
        assert_eq!(loaded.output.byte_limit, Some(4096));
        assert_eq!(loaded.stream, config.stream);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[device]\nproduct_id = \"0x6010\"\n\n[stream]\nnum_transfers = 32\n",
        )
        .unwrap();

        let config = AppConfig::load(Some(path)).unwrap();
        assert_eq!(config.device.product_id().unwrap(), 0x6010);
        assert_eq!(config.device.vendor_id().unwrap(), 0x0403);
        assert_eq!(config.stream.num_transfers, 32);
        assert_eq!(config.stream.packets_per_transfer, 8);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[device]\nvendor_id = \"0403\"\n").unwrap();

        assert!(AppConfig::load(Some(path)).is_err());
        assert!(AppConfig::load(Some(dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.device.read_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.stream.num_transfers = 0;
        assert!(config.validate().is_err());
    }
}
