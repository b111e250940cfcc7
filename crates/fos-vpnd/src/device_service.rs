//! Account and device registry
//!
//! The daemon asks a [`DeviceService`] to create, rotate and remove devices
//! and turns every result into a `DeviceEvent` or `RemoveDeviceEvent`.
//! [`LocalDeviceService`] keeps the registry in memory and hands out fresh
//! WireGuard keys itself.

use fos_vpn::device::{AccountAndDevice, AccountNumber, Device, DeviceId, DeviceInfo, WireguardData};
use fos_vpn::keys::PrivateKey;
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

/// Devices allowed per account
pub const MAX_DEVICES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceServiceError {
    #[error("Invalid account number")]
    InvalidAccount,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("Too many devices (max {0})")]
    TooManyDevices(usize),
}

pub trait DeviceService: Send + 'static {
    /// Register a new device on `account`
    fn login(&mut self, account: &AccountNumber) -> Result<AccountAndDevice, DeviceServiceError>;

    /// Replace the WireGuard key of the current device
    fn rotate_key(&mut self, current: &AccountAndDevice) -> Result<WireguardData, DeviceServiceError>;

    /// Remove the current device from its account
    fn logout(&mut self, current: &AccountAndDevice) -> Result<(), DeviceServiceError>;

    fn list_devices(&self, account: &AccountNumber) -> Result<Vec<DeviceInfo>, DeviceServiceError>;

    /// Remove a device and return what is left on the account
    fn remove_device(
        &mut self,
        account: &AccountNumber,
        device: &DeviceId,
    ) -> Result<Vec<DeviceInfo>, DeviceServiceError>;
}

const ADJECTIVES: &[&str] = &[
    "quiet", "brave", "witty", "calm", "eager", "gentle", "lucky", "proud", "swift", "tidy",
];
const ANIMALS: &[&str] = &[
    "otter", "lynx", "heron", "badger", "moose", "falcon", "puffin", "marten", "beaver", "seal",
];

/// In-memory device registry
#[derive(Debug, Default)]
pub struct LocalDeviceService {
    accounts: HashMap<AccountNumber, Vec<Device>>,
}

impl LocalDeviceService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a device that was persisted before a restart
    pub fn with_device(mut self, account: &AccountAndDevice) -> Self {
        self.accounts
            .entry(account.account_number.clone())
            .or_default()
            .push(account.device.clone());
        self
    }

    fn devices_mut(&mut self, account: &AccountNumber) -> Result<&mut Vec<Device>, DeviceServiceError> {
        self.accounts
            .get_mut(account)
            .ok_or(DeviceServiceError::InvalidAccount)
    }
}

/// Account numbers are 16 digits; spaces are allowed for readability
fn normalize_account(account: &str) -> Result<AccountNumber, DeviceServiceError> {
    let digits: String = account.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() == 16 && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(digits)
    } else {
        Err(DeviceServiceError::InvalidAccount)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn new_wireguard_data() -> WireguardData {
    let mut rng = rand::thread_rng();
    WireguardData {
        private_key: PrivateKey::generate(),
        addresses: vec![IpAddr::V4(Ipv4Addr::new(
            10,
            rng.gen_range(64..128),
            rng.gen_range(0..=255),
            rng.gen_range(2..255),
        ))],
        created: now_secs(),
    }
}

fn device_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("new");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("device");
    format!("{adjective} {animal}")
}

impl DeviceService for LocalDeviceService {
    fn login(&mut self, account: &AccountNumber) -> Result<AccountAndDevice, DeviceServiceError> {
        let account_number = normalize_account(account)?;
        let devices = self.accounts.entry(account_number.clone()).or_default();
        if devices.len() >= MAX_DEVICES {
            return Err(DeviceServiceError::TooManyDevices(MAX_DEVICES));
        }

        let device = Device {
            id: Uuid::new_v4().to_string(),
            name: device_name(),
            wireguard: new_wireguard_data(),
        };
        devices.push(device.clone());
        info!("Created device \"{}\"", device.name);
        Ok(AccountAndDevice {
            account_number,
            device,
        })
    }

    fn rotate_key(&mut self, current: &AccountAndDevice) -> Result<WireguardData, DeviceServiceError> {
        let device = self
            .devices_mut(&current.account_number)?
            .iter_mut()
            .find(|device| device.id == current.device.id)
            .ok_or_else(|| DeviceServiceError::UnknownDevice(current.device.id.clone()))?;

        device.wireguard = new_wireguard_data();
        info!("Rotated WireGuard key of \"{}\"", device.name);
        Ok(device.wireguard.clone())
    }

    fn logout(&mut self, current: &AccountAndDevice) -> Result<(), DeviceServiceError> {
        self.remove_device(&current.account_number, &current.device.id)
            .map(|_| ())
    }

    fn list_devices(&self, account: &AccountNumber) -> Result<Vec<DeviceInfo>, DeviceServiceError> {
        let account_number = normalize_account(account)?;
        Ok(self
            .accounts
            .get(&account_number)
            .map(|devices| devices.iter().map(DeviceInfo::from).collect())
            .unwrap_or_default())
    }

    fn remove_device(
        &mut self,
        account: &AccountNumber,
        device: &DeviceId,
    ) -> Result<Vec<DeviceInfo>, DeviceServiceError> {
        let account_number = normalize_account(account)?;
        let devices = self.devices_mut(&account_number)?;
        let before = devices.len();
        devices.retain(|d| &d.id != device);
        if devices.len() == before {
            return Err(DeviceServiceError::UnknownDevice(device.clone()));
        }
        debug!("Removed device {}", device);
        Ok(devices.iter().map(DeviceInfo::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT: &str = "1234 5678 1234 5678";

    #[test]
    fn test_login_creates_device_with_key() {
        let mut service = LocalDeviceService::new();
        let account = service.login(&ACCOUNT.to_string()).unwrap();

        assert_eq!(account.account_number, "1234567812345678");
        let devices = service.list_devices(&account.account_number).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].pubkey, account.device.wireguard.public_key());
    }

    #[test]
    fn test_invalid_account_rejected() {
        let mut service = LocalDeviceService::new();
        assert_eq!(
            service.login(&"12ab".to_string()),
            Err(DeviceServiceError::InvalidAccount)
        );
    }

    #[test]
    fn test_rotate_replaces_key() {
        let mut service = LocalDeviceService::new();
        let account = service.login(&ACCOUNT.to_string()).unwrap();

        let rotated = service.rotate_key(&account).unwrap();
        assert_ne!(rotated.public_key(), account.device.wireguard.public_key());
        let devices = service.list_devices(&account.account_number).unwrap();
        assert_eq!(devices[0].pubkey, rotated.public_key());
    }

    #[test]
    fn test_device_limit() {
        let mut service = LocalDeviceService::new();
        for _ in 0..MAX_DEVICES {
            service.login(&ACCOUNT.to_string()).unwrap();
        }
        assert_eq!(
            service.login(&ACCOUNT.to_string()),
            Err(DeviceServiceError::TooManyDevices(MAX_DEVICES))
        );
    }

    #[test]
    fn test_remove_device() {
        let mut service = LocalDeviceService::new();
        let first = service.login(&ACCOUNT.to_string()).unwrap();
        let second = service.login(&ACCOUNT.to_string()).unwrap();

        let left = service
            .remove_device(&first.account_number, &first.device.id)
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, second.device.id);

        assert_eq!(
            service.remove_device(&first.account_number, &first.device.id),
            Err(DeviceServiceError::UnknownDevice(first.device.id.clone()))
        );
    }
}
