//! Persistence
//!
//! Settings and device state survive restarts as pretty printed JSON. Each
//! write goes to a temporary file that is then renamed over the old one, so
//! a crash leaves either the old or the new file, never half of one.

use fos_vpn::device::DeviceState;
use fos_vpn::settings::Settings;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

pub const SETTINGS_FILE: &str = "settings.json";
pub const DEVICE_FILE: &str = "device.json";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Failed to serialize: {0}")]
    Serialize(String),
}

/// Storage for state that outlives the process
pub trait Persistence: Send + 'static {
    /// `Ok(None)` when nothing has been saved yet
    fn load_settings(&self) -> Result<Option<Settings>, PersistenceError>;
    fn save_settings(&mut self, settings: &Settings) -> Result<(), PersistenceError>;
    fn load_device(&self) -> Result<Option<DeviceState>, PersistenceError>;
    fn save_device(&mut self, device: &DeviceState) -> Result<(), PersistenceError>;
}

/// JSON files in one directory
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, PersistenceError> {
        let path = self.dir.join(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| PersistenceError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| PersistenceError::Serialize(e.to_string()))?;

        std::fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        std::fs::write(&tmp, json).map_err(|e| io_error(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))?;

        debug!("Wrote {}", path.display());
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

impl Persistence for JsonFilePersistence {
    fn load_settings(&self) -> Result<Option<Settings>, PersistenceError> {
        self.load(SETTINGS_FILE)
    }

    fn save_settings(&mut self, settings: &Settings) -> Result<(), PersistenceError> {
        self.save(SETTINGS_FILE, settings)
    }

    fn load_device(&self) -> Result<Option<DeviceState>, PersistenceError> {
        self.load(DEVICE_FILE)
    }

    fn save_device(&mut self, device: &DeviceState) -> Result<(), PersistenceError> {
        self.save(DEVICE_FILE, device)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    settings: Option<Settings>,
    device: Option<DeviceState>,
    fail_saves: bool,
    settings_writes: usize,
}

/// In-memory storage for tests and ephemeral daemons
///
/// Clones share state, so a test can keep one clone to inspect what the
/// daemon wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: Settings) -> Self {
        let persistence = Self::new();
        persistence.lock().settings = Some(settings);
        persistence
    }

    /// Make every following save fail
    pub fn fail_saves(&self, fail: bool) {
        self.lock().fail_saves = fail;
    }

    pub fn stored_settings(&self) -> Option<Settings> {
        self.lock().settings.clone()
    }

    pub fn stored_device(&self) -> Option<DeviceState> {
        self.lock().device.clone()
    }

    pub fn settings_writes(&self) -> usize {
        self.lock().settings_writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(state: &MemoryState) -> Result<(), PersistenceError> {
        if state.fail_saves {
            return Err(PersistenceError::Io {
                path: "memory".into(),
                reason: "writes disabled".into(),
            });
        }
        Ok(())
    }
}

impl Persistence for MemoryPersistence {
    fn load_settings(&self) -> Result<Option<Settings>, PersistenceError> {
        Ok(self.lock().settings.clone())
    }

    fn save_settings(&mut self, settings: &Settings) -> Result<(), PersistenceError> {
        let mut state = self.lock();
        Self::check(&state)?;
        state.settings = Some(settings.clone());
        state.settings_writes += 1;
        Ok(())
    }

    fn load_device(&self) -> Result<Option<DeviceState>, PersistenceError> {
        Ok(self.lock().device.clone())
    }

    fn save_device(&mut self, device: &DeviceState) -> Result<(), PersistenceError> {
        let mut state = self.lock();
        Self::check(&state)?;
        state.device = Some(device.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_json_files_survive_reload() {
        let dir = tempdir().unwrap();
        let mut persistence = JsonFilePersistence::new(dir.path().join("state"));
        assert_eq!(persistence.load_settings().unwrap(), None);

        let mut settings = Settings::default();
        settings.allow_lan = true;
        persistence.save_settings(&settings).unwrap();
        persistence.save_device(&DeviceState::Revoked).unwrap();

        let reopened = JsonFilePersistence::new(dir.path().join("state"));
        assert_eq!(reopened.load_settings().unwrap(), Some(settings));
        assert_eq!(reopened.load_device().unwrap(), Some(DeviceState::Revoked));
        assert!(!dir.path().join("state").join("settings.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "{ nope").unwrap();

        let persistence = JsonFilePersistence::new(dir.path());
        assert!(matches!(
            persistence.load_settings(),
            Err(PersistenceError::Parse { .. })
        ));
    }

    #[test]
    fn test_memory_failures_keep_old_value() {
        let mut persistence = MemoryPersistence::with_settings(Settings::default());
        let observer = persistence.clone();
        persistence.fail_saves(true);

        let mut changed = Settings::default();
        changed.auto_connect = true;
        assert!(persistence.save_settings(&changed).is_err());
        assert_eq!(observer.stored_settings(), Some(Settings::default()));
        assert_eq!(observer.settings_writes(), 0);
    }
}
