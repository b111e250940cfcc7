//! User Settings
//!
//! The persisted configuration root and the partial updates clients may
//! apply to it. An update is applied to a copy, the copy is validated as a
//! whole, and only then does it replace the current settings.

use crate::access_method::{
    AccessMethodError, AccessMethodId, AccessMethodSetting, AccessMethodSettings, CustomProxy,
};
use crate::constraints::{
    Constraint, LocationConstraint, Ownership, Providers, RelaySettings,
};
use crate::custom_list::{CustomList, CustomListError, CustomListId, CustomListsSettings};
use crate::relay_list::RelayOverride;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::ops::RangeInclusive;

/// Version written by this build
pub const CURRENT_SETTINGS_VERSION: u32 = 1;

/// Accepted WireGuard MTU
pub const WIREGUARD_MTU_RANGE: RangeInclusive<u16> = 1280..=1420;

/// Accepted OpenVPN mssfix
pub const OPENVPN_MSSFIX_RANGE: RangeInclusive<u16> = 1000..=1450;

/// Accepted key rotation interval (hours)
pub const ROTATION_INTERVAL_RANGE: RangeInclusive<u32> = 24..=720;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeType {
    #[default]
    Normal,
    Custom,
}

/// Which bridge relays are acceptable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConstraints {
    pub location: Constraint<LocationConstraint>,
    pub providers: Providers,
    pub ownership: Constraint<Ownership>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub bridge_type: BridgeType,
    pub normal: BridgeConstraints,
    #[serde(default)]
    pub custom: Option<CustomProxy>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectedObfuscation {
    #[default]
    Auto,
    Off,
    Udp2Tcp,
    Shadowsocks,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Udp2TcpObfuscationSettings {
    pub port: Constraint<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowsocksSettings {
    pub port: Constraint<u16>,
}

/// Obfuscation selection. A selected Udp2Tcp or Shadowsocks must carry its
/// sub-settings; Auto and Off need none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationSettings {
    pub selected_obfuscation: SelectedObfuscation,
    #[serde(default)]
    pub udp2tcp: Option<Udp2TcpObfuscationSettings>,
    #[serde(default)]
    pub shadowsocks: Option<ShadowsocksSettings>,
}

impl ObfuscationSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let missing = match self.selected_obfuscation {
            SelectedObfuscation::Udp2Tcp => self.udp2tcp.is_none(),
            SelectedObfuscation::Shadowsocks => self.shadowsocks.is_none(),
            SelectedObfuscation::Auto | SelectedObfuscation::Off => false,
        };
        if missing {
            return Err(SettingsError::MissingObfuscationSettings(
                self.selected_obfuscation,
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenVpnTunnelOptions {
    pub mssfix: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantumResistantState {
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaitaSettings {
    pub enabled: bool,
    /// Put a DAITA capable entry in front of a non-DAITA exit when needed
    pub use_multihop_if_necessary: bool,
}

impl Default for DaitaSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            use_multihop_if_necessary: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardTunnelOptions {
    pub mtu: Option<u16>,
    pub quantum_resistant: QuantumResistantState,
    pub daita: DaitaSettings,
    pub rotation_interval_hours: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericTunnelOptions {
    pub enable_ipv6: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsState {
    #[default]
    Default,
    Custom,
}

/// Content blockers offered by the default resolver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultDnsOptions {
    pub block_ads: bool,
    pub block_trackers: bool,
    pub block_malware: bool,
    pub block_adult_content: bool,
    pub block_gambling: bool,
    pub block_social_media: bool,
}

impl DefaultDnsOptions {
    pub fn any_blocker_enabled(&self) -> bool {
        self.block_ads
            || self.block_trackers
            || self.block_malware
            || self.block_adult_content
            || self.block_gambling
            || self.block_social_media
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomDnsOptions {
    pub addresses: Vec<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsOptions {
    pub state: DnsState,
    pub default_options: DefaultDnsOptions,
    pub custom_options: CustomDnsOptions,
}

impl DnsOptions {
    /// Custom resolvers that can never be used
    pub fn invalid_custom_servers(&self) -> Vec<IpAddr> {
        self.custom_options
            .addresses
            .iter()
            .filter(|addr| addr.is_unspecified() || addr.is_multicast())
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOptions {
    pub openvpn: OpenVpnTunnelOptions,
    pub wireguard: WireguardTunnelOptions,
    pub generic: GenericTunnelOptions,
    pub dns_options: DnsOptions,
}

/// Applications excluded from the tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitTunnelSettings {
    pub enable_exclusions: bool,
    pub apps: BTreeSet<String>,
}

/// Persisted daemon settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub relay_settings: RelaySettings,
    pub bridge_settings: BridgeSettings,
    pub bridge_state: BridgeState,
    pub obfuscation_settings: ObfuscationSettings,
    pub custom_lists: CustomListsSettings,
    pub api_access_methods: AccessMethodSettings,
    pub allow_lan: bool,
    pub block_when_disconnected: bool,
    pub auto_connect: bool,
    pub tunnel_options: TunnelOptions,
    pub split_tunnel: SplitTunnelSettings,
    pub relay_overrides: Vec<RelayOverride>,
    pub show_beta_releases: bool,
    pub settings_version: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay_settings: RelaySettings::default(),
            bridge_settings: BridgeSettings::default(),
            bridge_state: BridgeState::default(),
            obfuscation_settings: ObfuscationSettings::default(),
            custom_lists: CustomListsSettings::default(),
            api_access_methods: AccessMethodSettings::default(),
            allow_lan: false,
            block_when_disconnected: false,
            auto_connect: false,
            tunnel_options: TunnelOptions::default(),
            split_tunnel: SplitTunnelSettings::default(),
            relay_overrides: Vec::new(),
            show_beta_releases: false,
            settings_version: CURRENT_SETTINGS_VERSION,
        }
    }
}

impl Settings {
    /// Validate the settings as a whole
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.settings_version > CURRENT_SETTINGS_VERSION {
            return Err(SettingsError::UnsupportedVersion(self.settings_version));
        }

        self.custom_lists.validate()?;
        self.api_access_methods.validate()?;
        self.obfuscation_settings.validate()?;

        for list_id in self.custom_list_references() {
            if !self.custom_lists.contains(list_id) {
                return Err(SettingsError::UnknownCustomList(*list_id));
            }
        }

        if let RelaySettings::Custom(endpoint) = &self.relay_settings {
            if endpoint.host.trim().is_empty() {
                return Err(SettingsError::EmptyCustomHost);
            }
        }

        if self.bridge_settings.bridge_type == BridgeType::Custom
            && self.bridge_settings.custom.is_none()
        {
            return Err(SettingsError::MissingCustomBridge);
        }

        let options = &self.tunnel_options;
        if let Some(mtu) = options.wireguard.mtu {
            if !WIREGUARD_MTU_RANGE.contains(&mtu) {
                return Err(SettingsError::InvalidMtu(mtu));
            }
        }
        if let Some(mssfix) = options.openvpn.mssfix {
            if !OPENVPN_MSSFIX_RANGE.contains(&mssfix) {
                return Err(SettingsError::InvalidMssfix(mssfix));
            }
        }
        if let Some(hours) = options.wireguard.rotation_interval_hours {
            if !ROTATION_INTERVAL_RANGE.contains(&hours) {
                return Err(SettingsError::InvalidRotationInterval(hours));
            }
        }
        if let Some(addr) = options.dns_options.invalid_custom_servers().first() {
            return Err(SettingsError::InvalidDnsServer(*addr));
        }

        Ok(())
    }

    /// Every custom list id referenced from relay or bridge constraints
    pub fn custom_list_references(&self) -> Vec<&CustomListId> {
        let mut references = self.relay_settings.custom_list_references();
        if let Constraint::Only(location) = &self.bridge_settings.normal.location {
            references.extend(location.custom_list_id());
        }
        references
    }

    /// Does moving from `old` to `new` invalidate an active tunnel?
    pub fn requires_reconnect(old: &Settings, new: &Settings) -> bool {
        old.relay_settings != new.relay_settings
            || old.bridge_settings != new.bridge_settings
            || old.bridge_state != new.bridge_state
            || old.obfuscation_settings != new.obfuscation_settings
            || old.tunnel_options != new.tunnel_options
            || old.custom_lists != new.custom_lists
            || old.relay_overrides != new.relay_overrides
    }
}

/// A single client-requested change to [`Settings`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettingsUpdate {
    SetRelaySettings { relay_settings: RelaySettings },
    SetBridgeSettings { bridge_settings: BridgeSettings },
    SetBridgeState { bridge_state: BridgeState },
    SetObfuscationSettings { obfuscation_settings: ObfuscationSettings },
    SetAllowLan { allow_lan: bool },
    SetBlockWhenDisconnected { block_when_disconnected: bool },
    SetAutoConnect { auto_connect: bool },
    SetOpenvpnMssfix { mssfix: Option<u16> },
    SetWireguardMtu { mtu: Option<u16> },
    SetQuantumResistantTunnel { quantum_resistant: QuantumResistantState },
    SetDaitaSettings { daita: DaitaSettings },
    SetEnableIpv6 { enable_ipv6: bool },
    SetDnsOptions { dns_options: DnsOptions },
    SetWireguardRotationInterval { hours: Option<u32> },
    SetShowBetaReleases { show_beta_releases: bool },
    SetRelayOverride { relay_override: RelayOverride },
    ClearAllRelayOverrides,
    CreateCustomList { list: CustomList },
    UpdateCustomList { list: CustomList },
    DeleteCustomList { id: CustomListId },
    ClearCustomLists,
    AddAccessMethod { setting: AccessMethodSetting },
    RemoveAccessMethod { id: AccessMethodId },
    UpdateAccessMethod { setting: AccessMethodSetting },
    SetAccessMethodOrder { order: Vec<AccessMethodId> },
    SetSplitTunnelState { enabled: bool },
    AddSplitTunnelApp { app: String },
    RemoveSplitTunnelApp { app: String },
    ClearSplitTunnelApps,
    ResetSettings,
}

impl SettingsUpdate {
    /// Mutate `settings` in place. Whole-settings validation is left to the caller.
    pub fn apply_to(self, settings: &mut Settings) -> Result<(), SettingsError> {
        match self {
            SettingsUpdate::SetRelaySettings { relay_settings } => {
                settings.relay_settings = relay_settings;
            }
            SettingsUpdate::SetBridgeSettings { bridge_settings } => {
                settings.bridge_settings = bridge_settings;
            }
            SettingsUpdate::SetBridgeState { bridge_state } => {
                settings.bridge_state = bridge_state;
            }
            SettingsUpdate::SetObfuscationSettings {
                obfuscation_settings,
            } => {
                settings.obfuscation_settings = obfuscation_settings;
            }
            SettingsUpdate::SetAllowLan { allow_lan } => settings.allow_lan = allow_lan,
            SettingsUpdate::SetBlockWhenDisconnected {
                block_when_disconnected,
            } => {
                settings.block_when_disconnected = block_when_disconnected;
            }
            SettingsUpdate::SetAutoConnect { auto_connect } => {
                settings.auto_connect = auto_connect;
            }
            SettingsUpdate::SetOpenvpnMssfix { mssfix } => {
                settings.tunnel_options.openvpn.mssfix = mssfix;
            }
            SettingsUpdate::SetWireguardMtu { mtu } => {
                settings.tunnel_options.wireguard.mtu = mtu;
            }
            SettingsUpdate::SetQuantumResistantTunnel { quantum_resistant } => {
                settings.tunnel_options.wireguard.quantum_resistant = quantum_resistant;
            }
            SettingsUpdate::SetDaitaSettings { daita } => {
                settings.tunnel_options.wireguard.daita = daita;
            }
            SettingsUpdate::SetEnableIpv6 { enable_ipv6 } => {
                settings.tunnel_options.generic.enable_ipv6 = enable_ipv6;
            }
            SettingsUpdate::SetDnsOptions { dns_options } => {
                settings.tunnel_options.dns_options = dns_options;
            }
            SettingsUpdate::SetWireguardRotationInterval { hours } => {
                settings.tunnel_options.wireguard.rotation_interval_hours = hours;
            }
            SettingsUpdate::SetShowBetaReleases { show_beta_releases } => {
                settings.show_beta_releases = show_beta_releases;
            }
            SettingsUpdate::SetRelayOverride { relay_override } => {
                settings
                    .relay_overrides
                    .retain(|existing| existing.hostname != relay_override.hostname);
                if !relay_override.is_empty() {
                    settings.relay_overrides.push(relay_override);
                }
            }
            SettingsUpdate::ClearAllRelayOverrides => settings.relay_overrides.clear(),
            SettingsUpdate::CreateCustomList { list } => {
                settings.custom_lists.custom_lists.push(list);
            }
            SettingsUpdate::UpdateCustomList { list } => {
                let existing = settings
                    .custom_lists
                    .find_mut(&list.id)
                    .ok_or(SettingsError::UnknownCustomList(list.id))?;
                *existing = list;
            }
            SettingsUpdate::DeleteCustomList { id } => {
                settings
                    .custom_lists
                    .remove(&id)
                    .ok_or(SettingsError::UnknownCustomList(id))?;
            }
            SettingsUpdate::ClearCustomLists => settings.custom_lists.custom_lists.clear(),
            SettingsUpdate::AddAccessMethod { setting } => {
                settings.api_access_methods.append(setting);
            }
            SettingsUpdate::RemoveAccessMethod { id } => {
                settings.api_access_methods.remove(&id)?;
            }
            SettingsUpdate::UpdateAccessMethod { setting } => {
                settings.api_access_methods.update(setting)?;
            }
            SettingsUpdate::SetAccessMethodOrder { order } => {
                settings.api_access_methods.reorder(&order)?;
            }
            SettingsUpdate::SetSplitTunnelState { enabled } => {
                settings.split_tunnel.enable_exclusions = enabled;
            }
            SettingsUpdate::AddSplitTunnelApp { app } => {
                settings.split_tunnel.apps.insert(app);
            }
            SettingsUpdate::RemoveSplitTunnelApp { app } => {
                settings.split_tunnel.apps.remove(&app);
            }
            SettingsUpdate::ClearSplitTunnelApps => settings.split_tunnel.apps.clear(),
            SettingsUpdate::ResetSettings => *settings = Settings::default(),
        }
        Ok(())
    }
}

/// Rejected settings
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("Obfuscation {0:?} selected without its settings")]
    MissingObfuscationSettings(SelectedObfuscation),

    #[error("Custom bridge selected but no custom proxy configured")]
    MissingCustomBridge,

    #[error("Unknown custom list: {0}")]
    UnknownCustomList(CustomListId),

    #[error("Invalid custom list: {0}")]
    CustomList(#[from] CustomListError),

    #[error("Invalid access methods: {0}")]
    AccessMethod(#[from] AccessMethodError),

    #[error("WireGuard MTU {0} outside 1280..=1420")]
    InvalidMtu(u16),

    #[error("OpenVPN mssfix {0} outside 1000..=1450")]
    InvalidMssfix(u16),

    #[error("Key rotation interval {0}h outside 24..=720")]
    InvalidRotationInterval(u32),

    #[error("Invalid custom DNS server {0}")]
    InvalidDnsServer(IpAddr),

    #[error("Custom tunnel endpoint has no host")]
    EmptyCustomHost,

    #[error("Settings version {0} is newer than supported")]
    UnsupportedVersion(u32),

    #[error("Failed to persist settings: {0}")]
    Persist(String),
}
