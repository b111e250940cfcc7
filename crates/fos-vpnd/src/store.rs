//! Settings Store
//!
//! Owns the authoritative [`Settings`]. Every update runs on a copy:
//! mutate, validate, persist, and only then replace the live value. A failure
//! at any step leaves the live settings untouched.

use crate::persistence::Persistence;
use fos_vpn::device::DeviceState;
use fos_vpn::settings::{Settings, SettingsError, SettingsUpdate};
use tracing::{debug, info, warn};

pub struct SettingsStore<P> {
    settings: Settings,
    persistence: P,
}

impl<P: Persistence> SettingsStore<P> {
    /// Load persisted settings. Unreadable or invalid settings fall back to
    /// the defaults.
    pub fn load(persistence: P) -> Self {
        let settings = match persistence.load_settings() {
            Ok(Some(settings)) => match settings.validate() {
                Ok(()) => {
                    info!("Loaded settings");
                    settings
                }
                Err(e) => {
                    warn!("Stored settings are invalid ({}), using defaults", e);
                    Settings::default()
                }
            },
            Ok(None) => {
                info!("No stored settings, using defaults");
                Settings::default()
            }
            Err(e) => {
                warn!("Failed to load settings ({}), using defaults", e);
                Settings::default()
            }
        };
        Self {
            settings,
            persistence,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Apply one update and return the committed settings
    pub fn apply(&mut self, update: SettingsUpdate) -> Result<Settings, SettingsError> {
        let mut candidate = self.settings.clone();
        update.apply_to(&mut candidate)?;
        candidate.validate()?;

        if candidate == self.settings {
            debug!("Settings update changed nothing");
            return Ok(candidate);
        }

        self.persistence
            .save_settings(&candidate)
            .map_err(|e| SettingsError::Persist(e.to_string()))?;
        self.settings = candidate.clone();
        info!("Settings updated");
        Ok(candidate)
    }

    pub fn load_device(&self) -> DeviceState {
        match self.persistence.load_device() {
            Ok(device) => device.unwrap_or_default(),
            Err(e) => {
                warn!("Failed to load device state ({}), logged out", e);
                DeviceState::LoggedOut
            }
        }
    }

    pub fn save_device(&mut self, device: &DeviceState) {
        if let Err(e) = self.persistence.save_device(device) {
            warn!("Failed to persist device state: {}", e);
        }
    }
}
