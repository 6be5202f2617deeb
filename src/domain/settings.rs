use crate::domain::models::ScanMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
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
            file_logging_enabled: default_true(),
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
    "ble_orchestrator".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Defaults applied to sessions the application starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default)]
    pub scan_mode: ScanMode,
    #[serde(default = "default_false")]
    pub wait_for_device: bool,
    #[serde(default = "default_preferred_mtu")]
    pub preferred_mtu: u16,
    /// Device ids connected to before, most recent last
    #[serde(default)]
    pub known_devices: Vec<String>,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            scan_mode: ScanMode::default(),
            wait_for_device: default_false(),
            preferred_mtu: default_preferred_mtu(),
            known_devices: Vec::new(),
        }
    }
}

fn default_preferred_mtu() -> u16 {
    247
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub ble: BleSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_path(Self::get_settings_path()?)
    }

    /// Load from `path`, falling back to defaults when it is missing or
    /// unreadable.
    pub fn with_path(settings_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let settings_path = settings_path.into();
        if let Some(parent) = settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                if settings_path.exists() {
                    warn!("Ignoring unreadable settings {:?}: {}", settings_path, e);
                }
                Settings::default()
            }
        };

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleOrchestrator");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        info!("Settings saved to {:?}", self.settings_path);
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Move `device_id` to the end of the known-device list and persist.
    pub fn remember_device(&mut self, device_id: &str) -> anyhow::Result<()> {
        let known = &mut self.settings.ble.known_devices;
        if known.last().map(String::as_str) == Some(device_id) {
            return Ok(());
        }
        known.retain(|id| id != device_id);
        known.push(device_id.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::with_path(dir.path().join("nested/settings.json")).unwrap();
        assert_eq!(service.get().ble, BleSettings::default());
        assert_eq!(service.get().log_settings.file_name_prefix, "ble_orchestrator");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::with_path(&path).unwrap();
        service.get_mut().ble.scan_mode = ScanMode::LowLatency;
        service.remember_device("AA:BB:CC:DD:EE:FF").unwrap();
        service.remember_device("11:22:33:44:55:66").unwrap();
        service.remember_device("AA:BB:CC:DD:EE:FF").unwrap();

        let reloaded = SettingsService::with_path(&path).unwrap();
        assert_eq!(reloaded.get().ble.scan_mode, ScanMode::LowLatency);
        assert_eq!(
            reloaded.get().ble.known_devices,
            vec!["11:22:33:44:55:66".to_string(), "AA:BB:CC:DD:EE:FF".to_string()]
        );
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "ble": { "wait_for_device": true } }"#).unwrap();

        let service = SettingsService::with_path(&path).unwrap();
        assert!(service.get().ble.wait_for_device);
        assert_eq!(service.get().ble.preferred_mtu, 247);
        assert_eq!(service.get().log_settings.level, "info");
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        let service = SettingsService::with_path(&path).unwrap();
        assert!(service.get().ble.known_devices.is_empty());
    }
}
