//! API access methods
//!
//! Ordered strategies for reaching the control-plane API. The daemon owns
//! the canonical list; clients add, remove, update and reorder entries by id.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessMethodId(Uuid);

impl AccessMethodId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AccessMethodId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccessMethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltInAccessMethod {
    Direct,
    Bridges,
    EncryptedDnsProxy,
}

impl BuiltInAccessMethod {
    /// Fixed id, identical across installs and restarts
    pub fn id(&self) -> AccessMethodId {
        let n = match self {
            BuiltInAccessMethod::Direct => 1,
            BuiltInAccessMethod::Bridges => 2,
            BuiltInAccessMethod::EncryptedDnsProxy => 3,
        };
        AccessMethodId(Uuid::from_u128(n))
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuiltInAccessMethod::Direct => "Direct",
            BuiltInAccessMethod::Bridges => "Mullvad Bridges",
            BuiltInAccessMethod::EncryptedDnsProxy => "Encrypted DNS proxy",
        }
    }
}

/// SOCKS5 credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocksAuth {
    pub username: String,
    pub password: String,
}

/// A user-configured proxy, also usable as a custom bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CustomProxy {
    /// Local SOCKS5 server forwarding to `remote_endpoint`
    Socks5Local {
        remote_endpoint: SocketAddr,
        local_port: u16,
    },
    Socks5Remote {
        endpoint: SocketAddr,
        #[serde(default)]
        auth: Option<SocksAuth>,
    },
    Shadowsocks {
        endpoint: SocketAddr,
        password: String,
        cipher: String,
    },
}

impl CustomProxy {
    /// Address traffic is sent to first
    pub fn peer(&self) -> SocketAddr {
        match self {
            CustomProxy::Socks5Local {
                remote_endpoint, ..
            } => *remote_endpoint,
            CustomProxy::Socks5Remote { endpoint, .. } | CustomProxy::Shadowsocks { endpoint, .. } => {
                *endpoint
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccessMethod {
    BuiltIn { method: BuiltInAccessMethod },
    Custom { proxy: CustomProxy },
}

impl AccessMethod {
    pub fn is_builtin(&self) -> bool {
        matches!(self, AccessMethod::BuiltIn { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMethodSetting {
    pub id: AccessMethodId,
    pub name: String,
    pub enabled: bool,
    pub access_method: AccessMethod,
}

impl AccessMethodSetting {
    pub fn new(name: impl Into<String>, enabled: bool, access_method: AccessMethod) -> Self {
        Self {
            id: AccessMethodId::new(),
            name: name.into(),
            enabled,
            access_method,
        }
    }

    fn builtin(method: BuiltInAccessMethod) -> Self {
        Self {
            id: method.id(),
            ..Self::new(method.name(), true, AccessMethod::BuiltIn { method })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMethodSettings {
    pub access_method_settings: Vec<AccessMethodSetting>,
}

impl Default for AccessMethodSettings {
    fn default() -> Self {
        Self {
            access_method_settings: vec![
                AccessMethodSetting::builtin(BuiltInAccessMethod::Direct),
                AccessMethodSetting::builtin(BuiltInAccessMethod::Bridges),
                AccessMethodSetting::builtin(BuiltInAccessMethod::EncryptedDnsProxy),
            ],
        }
    }
}

impl AccessMethodSettings {
    pub fn iter(&self) -> impl Iterator<Item = &AccessMethodSetting> {
        self.access_method_settings.iter()
    }

    pub fn find(&self, id: &AccessMethodId) -> Option<&AccessMethodSetting> {
        self.iter().find(|setting| setting.id == *id)
    }

    pub fn append(&mut self, setting: AccessMethodSetting) {
        self.access_method_settings.push(setting);
    }

    /// Remove a custom method. Built-in methods can only be disabled.
    pub fn remove(&mut self, id: &AccessMethodId) -> Result<AccessMethodSetting, AccessMethodError> {
        let index = self
            .access_method_settings
            .iter()
            .position(|setting| setting.id == *id)
            .ok_or(AccessMethodError::NotFound(*id))?;
        if self.access_method_settings[index].access_method.is_builtin() {
            return Err(AccessMethodError::BuiltInRemoval(*id));
        }
        Ok(self.access_method_settings.remove(index))
    }

    /// Replace the entry with the same id
    pub fn update(&mut self, setting: AccessMethodSetting) -> Result<(), AccessMethodError> {
        let slot = self
            .access_method_settings
            .iter_mut()
            .find(|existing| existing.id == setting.id)
            .ok_or(AccessMethodError::NotFound(setting.id))?;
        if slot.access_method.is_builtin() && slot.access_method != setting.access_method {
            return Err(AccessMethodError::BuiltInModification(setting.id));
        }
        *slot = setting;
        Ok(())
    }

    /// Reorder to match `order`, which must be a permutation of the current ids
    pub fn reorder(&mut self, order: &[AccessMethodId]) -> Result<(), AccessMethodError> {
        if order.len() != self.access_method_settings.len() {
            return Err(AccessMethodError::InvalidOrder);
        }
        let mut reordered = Vec::with_capacity(order.len());
        for id in order {
            let setting = self
                .find(id)
                .ok_or(AccessMethodError::NotFound(*id))?
                .clone();
            reordered.push(setting);
        }
        let unique: HashSet<_> = order.iter().collect();
        if unique.len() != order.len() {
            return Err(AccessMethodError::InvalidOrder);
        }
        self.access_method_settings = reordered;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AccessMethodError> {
        let mut ids = HashSet::new();
        for setting in self.iter() {
            if !ids.insert(setting.id) {
                return Err(AccessMethodError::DuplicateId(setting.id));
            }
        }
        for builtin in [
            BuiltInAccessMethod::Direct,
            BuiltInAccessMethod::Bridges,
            BuiltInAccessMethod::EncryptedDnsProxy,
        ] {
            let present = self.iter().any(|setting| {
                setting.access_method == AccessMethod::BuiltIn { method: builtin }
            });
            if !present {
                return Err(AccessMethodError::MissingBuiltIn(builtin));
            }
        }
        if !self.iter().any(|setting| setting.enabled) {
            return Err(AccessMethodError::NoneEnabled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessMethodError {
    #[error("No access method with id {0}")]
    NotFound(AccessMethodId),

    #[error("Built-in access method {0} can not be removed")]
    BuiltInRemoval(AccessMethodId),

    #[error("Built-in access method {0} can only be renamed or toggled")]
    BuiltInModification(AccessMethodId),

    #[error("Built-in access method {0:?} is missing")]
    MissingBuiltIn(BuiltInAccessMethod),

    #[error("Access method order must list every method exactly once")]
    InvalidOrder,

    #[error("Duplicate access method id {0}")]
    DuplicateId(AccessMethodId),

    #[error("At least one access method must be enabled")]
    NoneEnabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socks(port: u16) -> AccessMethodSetting {
        AccessMethodSetting::new(
            format!("socks-{port}"),
            true,
            AccessMethod::Custom {
                proxy: CustomProxy::Socks5Remote {
                    endpoint: SocketAddr::from(([192, 0, 2, 1], port)),
                    auth: None,
                },
            },
        )
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = AccessMethodSettings::default();
        assert_eq!(settings.iter().count(), 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_builtin_ids_are_stable() {
        let settings = AccessMethodSettings::default();
        assert_eq!(settings, AccessMethodSettings::default());
        assert_eq!(
            settings.find(&BuiltInAccessMethod::Bridges.id()).map(|s| s.name.as_str()),
            Some("Mullvad Bridges")
        );
    }

    #[test]
    fn test_builtin_can_not_be_removed() {
        let mut settings = AccessMethodSettings::default();
        let direct = settings.access_method_settings[0].id;

        assert_eq!(settings.remove(&direct), Err(AccessMethodError::BuiltInRemoval(direct)));
    }

    #[test]
    fn test_add_and_remove_custom() {
        let mut settings = AccessMethodSettings::default();
        let custom = socks(1080);
        let id = custom.id;
        settings.append(custom);

        assert!(settings.find(&id).is_some());
        assert!(settings.remove(&id).is_ok());
        assert!(settings.find(&id).is_none());
    }

    #[test]
    fn test_reorder_requires_permutation() {
        let mut settings = AccessMethodSettings::default();
        let mut ids: Vec<_> = settings.iter().map(|s| s.id).collect();
        ids.reverse();

        settings.reorder(&ids).unwrap();
        assert_eq!(settings.access_method_settings[0].name, "Encrypted DNS proxy");

        let duplicated = vec![ids[0], ids[0], ids[1]];
        assert_eq!(settings.reorder(&duplicated), Err(AccessMethodError::InvalidOrder));
        assert_eq!(settings.reorder(&ids[..2]), Err(AccessMethodError::InvalidOrder));
    }

    #[test]
    fn test_all_disabled_rejected() {
        let mut settings = AccessMethodSettings::default();
        for setting in &mut settings.access_method_settings {
            setting.enabled = false;
        }
        assert_eq!(settings.validate(), Err(AccessMethodError::NoneEnabled));
    }
}
