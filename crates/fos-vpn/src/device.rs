//! Account and device state
//!
//! Only the data shapes live here; creating, rotating and removing devices
//! is done by a device service outside this crate.

use crate::keys::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub type AccountNumber = String;
pub type DeviceId = String;

/// WireGuard identity assigned to this device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardData {
    pub private_key: PrivateKey,
    /// Tunnel interface addresses handed out by the service
    pub addresses: Vec<IpAddr>,
    /// Unix timestamp (seconds) of key creation
    pub created: u64,
}

impl WireguardData {
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub wireguard: WireguardData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAndDevice {
    pub account_number: AccountNumber,
    pub device: Device,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceState {
    LoggedIn(AccountAndDevice),
    #[default]
    LoggedOut,
    Revoked,
}

impl DeviceState {
    pub fn logged_in(&self) -> Option<&AccountAndDevice> {
        match self {
            DeviceState::LoggedIn(account) => Some(account),
            DeviceState::LoggedOut | DeviceState::Revoked => None,
        }
    }

    pub fn wireguard(&self) -> Option<&WireguardData> {
        self.logged_in().map(|account| &account.device.wireguard)
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventCause {
    LoggedIn,
    LoggedOut,
    Revoked,
    Updated,
    RotatedKey,
}

impl DeviceEventCause {
    /// Causes after which the WireGuard key in use is no longer valid
    pub fn changes_key(&self) -> bool {
        !matches!(self, DeviceEventCause::Updated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub cause: DeviceEventCause,
    pub new_state: DeviceState,
}

/// Public view of a device registered on an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub pubkey: PublicKey,
    pub created: u64,
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            pubkey: device.wireguard.public_key(),
            created: device.wireguard.created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDeviceEvent {
    pub account_number: AccountNumber,
    pub new_device_list: Vec<DeviceInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logged_in() -> DeviceState {
        DeviceState::LoggedIn(AccountAndDevice {
            account_number: "1234123412341234".into(),
            device: Device {
                id: "dev-1".into(),
                name: "happy seal".into(),
                wireguard: WireguardData {
                    private_key: PrivateKey::generate(),
                    addresses: vec!["10.64.0.2".parse().unwrap()],
                    created: 1_700_000_000,
                },
            },
        })
    }

    #[test]
    fn test_wireguard_only_when_logged_in() {
        assert!(logged_in().wireguard().is_some());
        assert!(DeviceState::LoggedOut.wireguard().is_none());
        assert!(DeviceState::Revoked.wireguard().is_none());
    }

    #[test]
    fn test_device_state_json_keeps_key() {
        let state = logged_in();
        let json = serde_json::to_string(&state).unwrap();
        let restored: DeviceState = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, state);
        assert!(json.contains("\"type\":\"logged_in\""));
    }
}
