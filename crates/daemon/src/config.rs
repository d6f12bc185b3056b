//! Daemon configuration management

use anyhow::{Context, Result, anyhow};
use driver::{DeviceMatch, IdTable, MAX_MINORS, RegistryConfig, TransferSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub driver: DriverSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "DaemonSettings::default_log_level")]
    pub log_level: String,
    /// Directory holding the channel sockets
    #[serde(default = "DaemonSettings::default_node_dir")]
    pub node_dir: PathBuf,
    #[serde(default = "DaemonSettings::default_name_prefix")]
    pub name_prefix: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            node_dir: Self::default_node_dir(),
            name_prefix: Self::default_name_prefix(),
        }
    }
}

impl DaemonSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_node_dir() -> PathBuf {
        PathBuf::from("/run/usb-zebu")
    }

    fn default_name_prefix() -> String {
        driver::registry::DEFAULT_NAME_PREFIX.to_string()
    }

    /// Node directory with `~` expanded
    pub fn node_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.node_dir.to_string_lossy()).as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Extra VID:PID entries, "0xVVVV:0xPPPP" or "0xVVVV:*"
    #[serde(default)]
    pub ids: Vec<String>,
    /// Also accept mass-storage/SCSI/bulk-only interfaces
    #[serde(default = "UsbSettings::default_match_mass_storage")]
    pub match_mass_storage: bool,
    /// Hardware-level bound on one bulk transfer
    #[serde(default = "UsbSettings::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            match_mass_storage: Self::default_match_mass_storage(),
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
        }
    }
}

impl UsbSettings {
    fn default_match_mass_storage() -> bool {
        true
    }

    fn default_transfer_timeout_ms() -> u64 {
        5000
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSettings {
    #[serde(default = "DriverSettings::default_max_devices")]
    pub max_devices: usize,
    #[serde(default = "DriverSettings::default_max_transfer_size")]
    pub max_transfer_size: usize,
    /// 0 waits forever
    #[serde(default)]
    pub write_timeout_ms: u64,
    #[serde(default = "DriverSettings::default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            max_devices: Self::default_max_devices(),
            max_transfer_size: Self::default_max_transfer_size(),
            write_timeout_ms: 0,
            cancel_grace_ms: Self::default_cancel_grace_ms(),
        }
    }
}

impl DriverSettings {
    fn default_max_devices() -> usize {
        MAX_MINORS
    }

    fn default_max_transfer_size() -> usize {
        driver::transfer::DEFAULT_MAX_TRANSFER_SIZE
    }

    fn default_cancel_grace_ms() -> u64 {
        driver::transfer::DEFAULT_CANCEL_GRACE.as_millis() as u64
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            max_transfer_size: self.max_transfer_size,
            write_timeout: match self.write_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            cancel_grace: Duration::from_millis(self.cancel_grace_ms),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings::default(),
            usb: UsbSettings::default(),
            driver: DriverSettings::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-zebu/daemon.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DaemonConfig = toml::from_str(&content)
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

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-zebu").join("daemon.toml")
        } else {
            PathBuf::from(".config/usb-zebu/daemon.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.daemon.name_prefix.is_empty() || self.daemon.name_prefix.contains('/') {
            return Err(anyhow!(
                "Invalid name prefix '{}', must be non-empty and contain no '/'",
                self.daemon.name_prefix
            ));
        }

        for id in &self.usb.ids {
            Self::validate_filter(id)?;
        }

        if !(1..=MAX_MINORS).contains(&self.driver.max_devices) {
            return Err(anyhow!(
                "Invalid max_devices {}, must be between 1 and {}",
                self.driver.max_devices,
                MAX_MINORS
            ));
        }

        if self.driver.max_transfer_size == 0 {
            return Err(anyhow!("max_transfer_size must be greater than zero"));
        }

        // libusb treats a zero timeout as infinite
        if self.usb.transfer_timeout_ms == 0 {
            return Err(anyhow!("transfer_timeout_ms must be greater than zero"));
        }

        if self.driver.cancel_grace_ms == 0 {
            return Err(anyhow!("cancel_grace_ms must be greater than zero"));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    pub fn validate_filter(filter: &str) -> Result<()> {
        DeviceMatch::parse_filter(filter)
            .map(|_| ())
            .map_err(|e| anyhow!("{}", e))
    }

    /// Id table: built-in entries plus configured ids
    pub fn id_table(&self) -> Result<IdTable> {
        let mut table = IdTable::with_defaults();
        if !self.usb.match_mass_storage {
            table = table
                .entries()
                .iter()
                .filter(|entry| matches!(entry, DeviceMatch::Device { .. }))
                .copied()
                .collect();
        }
        for id in &self.usb.ids {
            table.push(DeviceMatch::parse_filter(id).map_err(|e| anyhow!("{}", e))?);
        }
        Ok(table)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_devices: self.driver.max_devices,
            name_prefix: self.daemon.name_prefix.clone(),
            transfer: self.driver.transfer_settings(),
        }
    }
}
