use crate::domain::models::MacAddress;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Proteus primary service
pub const PROTEUS_SERVICE_UUID: &str = "6e400001-c352-11e5-953d-0002a5d5c51b";
/// Proteus TX characteristic (central writes here)
pub const PROTEUS_WRITE_CHAR_UUID: &str = "6e400002-c352-11e5-953d-0002a5d5c51b";
/// Proteus RX characteristic (peripheral notifies here)
pub const PROTEUS_NOTIFY_CHAR_UUID: &str = "6e400003-c352-11e5-953d-0002a5d5c51b";

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
    "proteus_ble".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub known_addresses: Vec<MacAddress>,
    #[serde(default)]
    pub last_connected_address: Option<MacAddress>,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE identifiers
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub ble_write_char_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub ble_notify_char_uuid: String,

    // Scan Settings
    #[serde(default = "default_true")]
    pub apply_uuid_filter: bool,
    #[serde(default = "default_false")]
    pub apply_rssi_filter: bool,
    #[serde(default = "default_in_range_dbm")]
    pub in_range_threshold_dbm: i16,
    #[serde(default = "default_out_of_range_dbm")]
    pub out_of_range_threshold_dbm: i16,
    #[serde(default = "default_out_of_range_timeout_ms")]
    pub out_of_range_timeout_ms: u64,
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,

    // Security Settings
    #[serde(default = "default_security_policy")]
    pub security_policy: String, // "Open", "JustWorks", "StaticPasskey"
    #[serde(default = "default_false")]
    pub pairing_enabled: bool,
    #[serde(default = "default_false")]
    pub unpair_on_disconnect: bool,
    #[serde(default = "default_static_pin")]
    pub static_pin: String,
    #[serde(default = "default_pin_length")]
    pub pin_length: usize,

    // Connection Settings
    #[serde(default = "default_subscribe_attempts")]
    pub subscribe_attempts: u32,
    #[serde(default = "default_subscribe_retry_delay_ms")]
    pub subscribe_retry_delay_ms: u64,
    #[serde(default = "default_unpair_grace_ms")]
    pub unpair_grace_ms: u64,
    #[serde(default = "default_disconnect_settle_ms")]
    pub disconnect_settle_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            known_addresses: Vec::new(),
            last_connected_address: None,
            log_settings: LogSettings::default(),

            ble_service_uuid: default_service_uuid(),
            ble_write_char_uuid: default_write_uuid(),
            ble_notify_char_uuid: default_notify_uuid(),

            apply_uuid_filter: true,
            apply_rssi_filter: false,
            in_range_threshold_dbm: default_in_range_dbm(),
            out_of_range_threshold_dbm: default_out_of_range_dbm(),
            out_of_range_timeout_ms: default_out_of_range_timeout_ms(),
            sampling_interval_ms: default_sampling_interval_ms(),

            security_policy: default_security_policy(),
            pairing_enabled: false,
            unpair_on_disconnect: false,
            static_pin: default_static_pin(),
            pin_length: default_pin_length(),

            subscribe_attempts: default_subscribe_attempts(),
            subscribe_retry_delay_ms: default_subscribe_retry_delay_ms(),
            unpair_grace_ms: default_unpair_grace_ms(),
            disconnect_settle_ms: default_disconnect_settle_ms(),
        }
    }
}

fn default_service_uuid() -> String {
    PROTEUS_SERVICE_UUID.to_string()
}
fn default_write_uuid() -> String {
    PROTEUS_WRITE_CHAR_UUID.to_string()
}
fn default_notify_uuid() -> String {
    PROTEUS_NOTIFY_CHAR_UUID.to_string()
}
fn default_in_range_dbm() -> i16 {
    -70
}
fn default_out_of_range_dbm() -> i16 {
    -83
}
fn default_out_of_range_timeout_ms() -> u64 {
    2000
}
fn default_sampling_interval_ms() -> u64 {
    100
}
fn default_security_policy() -> String {
    "StaticPasskey".to_string()
}
fn default_static_pin() -> String {
    "123123".to_string()
}
fn default_pin_length() -> usize {
    6
}
fn default_subscribe_attempts() -> u32 {
    3
}
fn default_subscribe_retry_delay_ms() -> u64 {
    500
}
fn default_unpair_grace_ms() -> u64 {
    1000
}
fn default_disconnect_settle_ms() -> u64 {
    1000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from `path`, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let settings_path = path.into();
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ProteusBle");
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
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Remember `address` as known and last connected.
    pub fn add_known_address(&mut self, address: MacAddress) -> anyhow::Result<()> {
        if !self.settings.known_addresses.contains(&address) {
            self.settings.known_addresses.push(address);
        }
        self.settings.last_connected_address = Some(address);
        self.save()
    }
}
