//! Daemon events
//!
//! One event is emitted per state change and pushed to every subscriber.
//! Events are never persisted.

use crate::access_method::AccessMethodSetting;
use crate::device::{DeviceEvent, DeviceState, RemoveDeviceEvent};
use crate::relay_list::RelayList;
use crate::settings::Settings;
use crate::states::TunnelState;
use serde::{Deserialize, Serialize};

/// Version of the running daemon and what is available upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppVersionInfo {
    pub current_version: String,
    pub supported: bool,
    pub latest_stable: String,
    #[serde(default)]
    pub latest_beta: Option<String>,
    #[serde(default)]
    pub suggested_upgrade: Option<String>,
}

impl AppVersionInfo {
    /// Info for a build that knows of nothing newer than itself
    pub fn current(version: impl Into<String>) -> Self {
        let version = version.into();
        Self {
            current_version: version.clone(),
            supported: true,
            latest_stable: version,
            latest_beta: None,
            suggested_upgrade: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DaemonEvent {
    TunnelState(TunnelState),
    Settings(Settings),
    RelayList(RelayList),
    VersionInfo(AppVersionInfo),
    Device(DeviceEvent),
    RemoveDevice(RemoveDeviceEvent),
    NewAccessMethod(AccessMethodSetting),
}

impl DaemonEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DaemonEvent::TunnelState(_) => "tunnel_state",
            DaemonEvent::Settings(_) => "settings",
            DaemonEvent::RelayList(_) => "relay_list",
            DaemonEvent::VersionInfo(_) => "version_info",
            DaemonEvent::Device(_) => "device",
            DaemonEvent::RemoveDevice(_) => "remove_device",
            DaemonEvent::NewAccessMethod(_) => "new_access_method",
        }
    }
}

/// Everything a new subscriber needs before the first event arrives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSnapshot {
    pub tunnel_state: TunnelState,
    pub settings: Settings,
    pub relay_list: RelayList,
    pub version_info: Option<AppVersionInfo>,
    pub device_state: DeviceState,
}
