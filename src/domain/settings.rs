use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use tokio::sync::{mpsc, oneshot};

pub const TEMP_INDEX_KEY: &str = "sessionTempIdx";
pub const TIME_INDEX_KEY: &str = "sessionTimeIdx";

/// Integer key-value persistence for the selected presets
pub trait PreferenceStore {
    fn get_int(&self, key: &str) -> Option<i64>;
    fn set_int(&mut self, key: &str, value: i64) -> anyhow::Result<()>;
}

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
    "carta_companion".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Persisted preset selection (0 = never chosen)
    #[serde(rename = "sessionTempIdx", default)]
    pub session_temp_idx: i64,
    #[serde(rename = "sessionTimeIdx", default)]
    pub session_time_idx: i64,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Advanced BLE Settings
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_read_uuid")]
    pub ble_read_char_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub ble_write_char_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub ble_notify_char_uuid: String,

    // Timers
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_max_sync_attempts")]
    pub max_sync_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            session_temp_idx: 0,
            session_time_idx: 0,
            log_settings: LogSettings::default(),
            device_name: default_device_name(),
            ble_service_uuid: default_service_uuid(),
            ble_read_char_uuid: default_read_uuid(),
            ble_write_char_uuid: default_write_uuid(),
            ble_notify_char_uuid: default_notify_uuid(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            max_sync_attempts: default_max_sync_attempts(),
        }
    }
}

fn default_device_name() -> String {
    protocol::DEVICE_NAME.to_string()
}
fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_read_uuid() -> String {
    protocol::READ_CHAR_UUID.to_string()
}
fn default_write_uuid() -> String {
    protocol::WRITE_CHAR_UUID.to_string()
}
fn default_notify_uuid() -> String {
    protocol::NOTIFY_CHAR_UUID.to_string()
}
fn default_reconcile_interval_ms() -> u64 {
    250
}
fn default_sync_interval_ms() -> u64 {
    1000
}
fn default_max_sync_attempts() -> u32 {
    10
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
    writer: Option<SettingsWriter>,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::open(settings_path))
    }

    /// Load from an explicit path, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn open(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({}): {}", settings_path.display(), e);
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
            writer: None,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("CartaCompanion");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    /// Hand the current settings to the background writer and return
    /// immediately
    fn save_in_background(&mut self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => SettingsWriter::spawn(self.settings_path.clone())?,
        };
        let queued = writer.save(json);
        self.writer = Some(writer);
        queued
    }

    /// Block until every queued background write is on disk. Must not be
    /// called from an async task.
    pub fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush();
        }
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

impl PreferenceStore for SettingsService {
    fn get_int(&self, key: &str) -> Option<i64> {
        match key {
            TEMP_INDEX_KEY => Some(self.settings.session_temp_idx),
            TIME_INDEX_KEY => Some(self.settings.session_time_idx),
            _ => None,
        }
    }

    fn set_int(&mut self, key: &str, value: i64) -> anyhow::Result<()> {
        match key {
            TEMP_INDEX_KEY => self.settings.session_temp_idx = value,
            TIME_INDEX_KEY => self.settings.session_time_idx = value,
            _ => anyhow::bail!("Unknown preference key: {}", key),
        }
        self.save_in_background()
    }
}

fn write_settings(path: &Path, json: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, json)?;
    Ok(())
}

enum WriteJob {
    Save(String),
    Flush(oneshot::Sender<()>),
}

/// Settings file writer on its own thread. Queued snapshots coalesce, so
/// only the newest one is written. Dropping it waits for pending writes.
struct SettingsWriter {
    jobs: Option<mpsc::UnboundedSender<WriteJob>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SettingsWriter {
    fn spawn(path: PathBuf) -> anyhow::Result<Self> {
        let (jobs, mut rx) = mpsc::unbounded_channel();
        let handle = thread::Builder::new()
            .name("settings-writer".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    let mut json = match job {
                        WriteJob::Save(json) => json,
                        WriteJob::Flush(ack) => {
                            let _ = ack.send(());
                            continue;
                        }
                    };
                    let mut ack = None;
                    while let Ok(next) = rx.try_recv() {
                        match next {
                            WriteJob::Save(newer) => json = newer,
                            WriteJob::Flush(flush) => {
                                ack = Some(flush);
                                break;
                            }
                        }
                    }
                    match write_settings(&path, &json) {
                        Ok(()) => tracing::debug!("Settings saved to {}", path.display()),
                        Err(e) => tracing::error!("Failed to save settings: {}", e),
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
            })?;

        Ok(Self {
            jobs: Some(jobs),
            handle: Some(handle),
        })
    }

    fn save(&self, json: String) -> anyhow::Result<()> {
        self.jobs
            .as_ref()
            .and_then(|jobs| jobs.send(WriteJob::Save(json)).ok())
            .ok_or_else(|| anyhow::anyhow!("Settings writer has stopped"))
    }

    fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .jobs
            .as_ref()
            .is_some_and(|jobs| jobs.send(WriteJob::Flush(tx)).is_ok());
        if sent {
            let _ = rx.blocking_recv();
        }
    }
}

impl Drop for SettingsWriter {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Settings writer panicked");
            }
        }
    }
}

/// In-memory store for tests and the simulator
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<String, i64>,
}

impl PreferenceStore for MemoryStore {
    fn get_int(&self, key: &str) -> Option<i64> {
        self.values.get(key).copied()
    }

    fn set_int(&mut self, key: &str, value: i64) -> anyhow::Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::open(dir.path().join("settings.json"));
        assert_eq!(service.get().device_name, "CARTA");
        assert_eq!(service.get().reconcile_interval_ms, 250);
        assert_eq!(service.get_int(TEMP_INDEX_KEY), Some(0));
    }

    #[test]
    fn test_indices_persist_under_camel_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::open(path.clone());
        service.set_int(TEMP_INDEX_KEY, 4).unwrap();
        service.set_int(TIME_INDEX_KEY, 2).unwrap();
        service.flush();

        let raw = fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["sessionTempIdx"], 4);
        assert_eq!(json["sessionTimeIdx"], 2);

        let reopened = SettingsService::open(path);
        assert_eq!(reopened.get_int(TEMP_INDEX_KEY), Some(4));
        assert_eq!(reopened.get_int(TIME_INDEX_KEY), Some(2));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "sessionTempIdx": 3, "max_sync_attempts": 2 }"#).unwrap();

        let service = SettingsService::open(path);
        assert_eq!(service.get().session_temp_idx, 3);
        assert_eq!(service.get().max_sync_attempts, 2);
        assert_eq!(service.get().sync_interval_ms, 1000);
        assert_eq!(service.get().log_settings.level, "info");
    }

    #[test]
    fn test_rapid_writes_keep_the_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::open(path.clone());
        for index in 1..=9 {
            service.set_int(TEMP_INDEX_KEY, index).unwrap();
        }
        service.flush();
        assert_eq!(SettingsService::open(path).get_int(TEMP_INDEX_KEY), Some(9));
    }

    #[test]
    fn test_pending_write_lands_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::open(path.clone());
        service.set_int(TIME_INDEX_KEY, 5).unwrap();
        drop(service);

        assert_eq!(SettingsService::open(path).get_int(TIME_INDEX_KEY), Some(5));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = SettingsService::open(dir.path().join("settings.json"));
        assert!(service.set_int("brightness", 1).is_err());
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::default();
        assert_eq!(store.get_int(TEMP_INDEX_KEY), None);
        store.set_int(TEMP_INDEX_KEY, 7).unwrap();
        assert_eq!(store.get_int(TEMP_INDEX_KEY), Some(7));
    }
}
