//! Sniffer Daemon Configuration module
//!
//! This module handles configuration management for the sniffer daemon.
//! Configuration files may be TOML, JSON or YAML, chosen by extension.

use crate::channel::{is_valid_channel, DEFAULT_HOP_INTERVAL};
use crate::station::DEFAULT_BUCKETS;
use crate::transport::ReportIntervals;
use crate::{Result, SnifferError, DEFAULT_CTRL_IFACE, MAX_FRAME_SIZE};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// General daemon settings
    pub general: GeneralConfig,
    /// Capture interfaces
    pub capture: CaptureConfig,
    /// Channel hopping
    pub channels: ChannelConfig,
    /// Tracking table
    pub table: TableConfig,
    /// Upstream reporting
    pub transport: TransportConfig,
    /// Local control interface
    pub control: ControlConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// General daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Daemon name
    pub name: String,
    /// PID file path
    pub pid_file: Option<PathBuf>,
}

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// One capture worker per interface
    pub interfaces: Vec<String>,
    /// Receive buffer size per frame
    pub snaplen: usize,
}

/// Channel hopping configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Enable channel hopping
    pub hopping: bool,
    /// Channels visited in order
    pub channels: Vec<u8>,
    /// Dwell time per channel (ms)
    pub hop_interval: u64,
}

/// Tracking table configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Requested bucket count, rounded up to a power of two
    pub buckets: usize,
}

/// Upstream reporting configuration. Intervals are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Collector `host:port`; reporting is off when unset
    pub server: Option<String>,
    pub magic_code: u32,
    pub device_id: u32,
    pub phy_id: u32,
    /// Free-form data carried in the start request
    pub start_data: String,
    pub mac_interval: u64,
    pub sta_mac_interval: u64,
    pub ap_mac_interval: u64,
    pub vid_interval: u64,
    pub heartbeat_interval: u64,
    pub period_interval: u64,
}

/// Control interface configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    /// Unix datagram socket path
    pub socket_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Include timestamps
    pub timestamps: bool,
    /// Include module targets
    pub targets: bool,
}

/// Configuration validation result
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Whether configuration is valid
    pub valid: bool,
    /// Validation errors
    pub errors: Vec<String>,
    /// Validation warnings
    pub warnings: Vec<String>,
}

/// Configuration manager
#[derive(Debug)]
pub struct ConfigManager {
    /// Current configuration
    config: DaemonConfig,
    /// Configuration file path
    config_path: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "snifferd".to_string(),
            pid_file: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interfaces: vec!["wlan0".to_string()],
            snaplen: MAX_FRAME_SIZE,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            hopping: true,
            channels: (1..=13).collect(),
            hop_interval: DEFAULT_HOP_INTERVAL.as_millis() as u64,
        }
    }
}

impl ChannelConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.hop_interval)
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        let intervals = ReportIntervals::default();
        Self {
            server: None,
            magic_code: 0,
            device_id: 0,
            phy_id: 0,
            start_data: String::new(),
            mac_interval: intervals.mac.as_secs(),
            sta_mac_interval: intervals.sta_mac.as_secs(),
            ap_mac_interval: intervals.ap_mac.as_secs(),
            vid_interval: intervals.vid.as_secs(),
            heartbeat_interval: intervals.heartbeat.as_secs(),
            period_interval: intervals.period.as_secs(),
        }
    }
}

impl TransportConfig {
    pub fn intervals(&self) -> ReportIntervals {
        ReportIntervals {
            mac: Duration::from_secs(self.mac_interval),
            sta_mac: Duration::from_secs(self.sta_mac_interval),
            ap_mac: Duration::from_secs(self.ap_mac_interval),
            vid: Duration::from_secs(self.vid_interval),
            heartbeat: Duration::from_secs(self.heartbeat_interval),
            period: Duration::from_secs(self.period_interval),
        }
    }

    fn zero_intervals(&self) -> Vec<&'static str> {
        [
            ("mac_interval", self.mac_interval),
            ("sta_mac_interval", self.sta_mac_interval),
            ("ap_mac_interval", self.ap_mac_interval),
            ("vid_interval", self.vid_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("period_interval", self.period_interval),
        ]
        .into_iter()
        .filter(|(_, secs)| *secs == 0)
        .map(|(name, _)| name)
        .collect()
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: PathBuf::from(DEFAULT_CTRL_IFACE),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            timestamps: true,
            targets: false,
        }
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepted log levels
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl ConfigManager {
    /// Create new configuration manager
    pub fn new() -> Self {
        Self {
            config: DaemonConfig::default(),
            config_path: None,
        }
    }

    /// Create configuration manager with config
    pub fn with_config(config: DaemonConfig) -> Self {
        Self {
            config,
            config_path: None,
        }
    }

    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| SnifferError::Config(format!("Failed to read config file: {}", e)))?;

        let config: DaemonConfig = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| SnifferError::Config(format!("Failed to parse JSON config: {}", e)))?,
            Some("toml") => toml::from_str(&content)
                .map_err(|e| SnifferError::Config(format!("Failed to parse TOML config: {}", e)))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| SnifferError::Config(format!("Failed to parse YAML config: {}", e)))?,
            _ => return Err(SnifferError::Config("Unsupported config file format".to_string())),
        };

        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => self.to_json()?,
            Some("toml") => self.to_toml()?,
            Some("yaml") | Some("yml") => self.to_yaml()?,
            _ => return Err(SnifferError::Config("Unsupported config file format".to_string())),
        };

        fs::write(path, content)
            .map_err(|e| SnifferError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Get current configuration
    pub fn get_config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Mutable access for command-line overrides
    pub fn config_mut(&mut self) -> &mut DaemonConfig {
        &mut self.config
    }

    pub fn into_config(self) -> DaemonConfig {
        self.config
    }

    /// Replace the configuration if the new one validates
    pub fn update_config(&mut self, new_config: DaemonConfig) -> Result<()> {
        let validation = self.validate_config(&new_config);
        if !validation.valid {
            return Err(SnifferError::Config(format!(
                "Configuration validation failed: {}",
                validation.errors.join(", ")
            )));
        }

        self.config = new_config;
        Ok(())
    }

    /// Validate configuration
    pub fn validate_config(&self, config: &DaemonConfig) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if config.general.name.is_empty() {
            errors.push("Daemon name cannot be empty".to_string());
        }

        // Capture
        if config.capture.interfaces.is_empty() {
            errors.push("At least one capture interface is required".to_string());
        }
        if config.capture.interfaces.iter().any(|i| i.is_empty()) {
            errors.push("Interface names cannot be empty".to_string());
        }
        if config.capture.snaplen < 64 {
            errors.push(format!("Snaplen {} is below 64 bytes", config.capture.snaplen));
        }

        // Channels
        if config.channels.hopping {
            if config.channels.channels.is_empty() {
                errors.push("Channel hopping needs at least one channel".to_string());
            }
            if config.channels.hop_interval == 0 {
                errors.push("Hop interval cannot be 0".to_string());
            }
            if config.capture.interfaces.len() > 1 {
                warnings.push("Every capture interface hops through the same channel list".to_string());
            }
        }
        for channel in config.channels.channels.iter().filter(|c| !is_valid_channel(**c)) {
            errors.push(format!("Invalid channel {}", channel));
        }

        // Table
        if config.table.buckets == 0 {
            errors.push("Bucket count cannot be 0".to_string());
        } else if !config.table.buckets.is_power_of_two() {
            warnings.push(format!(
                "Bucket count {} will be rounded up to {}",
                config.table.buckets,
                config.table.buckets.next_power_of_two()
            ));
        }

        // Transport
        if let Some(server) = &config.transport.server {
            if server.is_empty() {
                errors.push("Collector address cannot be empty".to_string());
            }
            for name in config.transport.zero_intervals() {
                errors.push(format!("Transport {} cannot be 0", name));
            }
        }
        if config.transport.start_data.len() > crate::transport::START_DATA_LEN {
            warnings.push("Start data will be truncated to 20 bytes".to_string());
        }

        // Control
        if config.control.enabled && config.control.socket_path.as_os_str().is_empty() {
            errors.push("Control socket path cannot be empty".to_string());
        }

        // Logging
        if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
            errors.push(format!(
                "Invalid log level '{}', must be one of: {}",
                config.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Reload configuration from file
    pub fn reload(&mut self) -> Result<()> {
        let path = self
            .config_path
            .clone()
            .ok_or_else(|| SnifferError::Config("No config file path set".to_string()))?;
        let new_manager = Self::load_from_file(path)?;
        self.update_config(new_manager.config)
    }

    /// Get configuration as JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.config)
            .map_err(|e| SnifferError::Config(format!("Failed to serialize config to JSON: {}", e)))
    }

    /// Get configuration as TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.config)
            .map_err(|e| SnifferError::Config(format!("Failed to serialize config to TOML: {}", e)))
    }

    /// Get configuration as YAML string
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.config)
            .map_err(|e| SnifferError::Config(format!("Failed to serialize config to YAML: {}", e)))
    }
}
