use crate::domain::capability::{self, CapabilityRequirement};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_control".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Device profile (required capability set, in declaration order)
    #[serde(default = "default_profile")]
    pub profile: Vec<CapabilityRequirement>,

    // Operation timeouts
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default = "default_operation_retries")]
    pub operation_retries: u32,

    // Link lifecycle
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    #[serde(default = "default_preferred_mtu")]
    pub preferred_mtu: u16,

    // Scanning
    #[serde(default = "default_false")]
    pub debug_show_all_devices: bool,

    // Remembered devices
    #[serde(default)]
    pub known_device_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            profile: default_profile(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            operation_retries: default_operation_retries(),
            connect_timeout_ms: default_connect_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            connect_retries: default_connect_retries(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            preferred_mtu: default_preferred_mtu(),
            debug_show_all_devices: false,
            known_device_addresses: Vec::new(),
            last_connected_address: None,
        }
    }
}

fn default_profile() -> Vec<CapabilityRequirement> {
    capability::control_profile()
}
fn default_read_timeout_ms() -> u64 {
    5000
}
fn default_write_timeout_ms() -> u64 {
    5000
}
fn default_subscribe_timeout_ms() -> u64 {
    10_000
}
fn default_operation_retries() -> u32 {
    1
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_discovery_timeout_ms() -> u64 {
    10_000
}
fn default_disconnect_timeout_ms() -> u64 {
    5000
}
fn default_connect_retries() -> u32 {
    2
}
fn default_connect_retry_delay_ms() -> u64 {
    100
}
fn default_preferred_mtu() -> u16 {
    247
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from the user config directory, falling back to defaults
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load_from(settings_path))
    }

    /// Load settings from an explicit path; a missing or unreadable file
    /// yields defaults that will be written back on `save`
    pub fn load_from(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {:#}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleControl");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn add_known_address(&mut self, address: &str) -> anyhow::Result<()> {
        if !self
            .settings
            .known_device_addresses
            .iter()
            .any(|a| a == address)
        {
            self.settings.known_device_addresses.push(address.to_string());
            self.save()?;
        }
        Ok(())
    }

    pub fn set_last_connected(&mut self, address: &str) -> anyhow::Result<()> {
        self.settings.last_connected_address = Some(address.to_string());
        self.add_known_address(address)?;
        self.save()
    }
}
