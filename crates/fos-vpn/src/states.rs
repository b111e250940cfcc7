//! Tunnel States
//!
//! What the daemon reports about the tunnel. Exactly one variant of
//! [`TunnelState`] is current at any time; every change is broadcast.

use crate::constraints::{TransportProtocol, TunnelType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelState {
    Disconnected {
        #[serde(default)]
        last_known_location: Option<GeoIpLocation>,
        locked_down: bool,
    },
    Connecting {
        #[serde(default)]
        relay_info: Option<TunnelStateRelayInfo>,
        feature_indicators: FeatureIndicators,
    },
    Connected {
        relay_info: TunnelStateRelayInfo,
        feature_indicators: FeatureIndicators,
    },
    Disconnecting {
        after_disconnect: ActionAfterDisconnect,
    },
    Error {
        error_state: ErrorState,
    },
}

impl TunnelState {
    pub fn disconnected(locked_down: bool) -> Self {
        TunnelState::Disconnected {
            last_known_location: None,
            locked_down,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, TunnelState::Connecting { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, TunnelState::Disconnected { .. })
    }

    pub fn is_in_error_state(&self) -> bool {
        matches!(self, TunnelState::Error { .. })
    }

    /// Connecting or Connected
    pub fn is_active(&self) -> bool {
        self.is_connecting() || self.is_connected()
    }

    pub fn name(&self) -> &'static str {
        match self {
            TunnelState::Disconnected { .. } => "disconnected",
            TunnelState::Connecting { .. } => "connecting",
            TunnelState::Connected { .. } => "connected",
            TunnelState::Disconnecting { .. } => "disconnecting",
            TunnelState::Error { .. } => "error",
        }
    }

    pub fn relay_info(&self) -> Option<&TunnelStateRelayInfo> {
        match self {
            TunnelState::Connecting { relay_info, .. } => relay_info.as_ref(),
            TunnelState::Connected { relay_info, .. } => Some(relay_info),
            _ => None,
        }
    }
}

impl Default for TunnelState {
    fn default() -> Self {
        TunnelState::disconnected(false)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Disconnecting { after_disconnect } => {
                write!(f, "disconnecting ({after_disconnect:?})")
            }
            TunnelState::Error { error_state } => write!(f, "error ({})", error_state.cause),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionAfterDisconnect {
    Nothing,
    Block,
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelStateRelayInfo {
    pub tunnel_endpoint: TunnelEndpoint,
    #[serde(default)]
    pub location: Option<GeoIpLocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObfuscationType {
    Udp2Tcp,
    Shadowsocks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationEndpoint {
    pub endpoint: SocketAddr,
    pub protocol: TransportProtocol,
    pub obfuscation_type: ObfuscationType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    Shadowsocks,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub endpoint: SocketAddr,
    pub protocol: TransportProtocol,
    pub proxy_type: ProxyType,
}

/// Where tunnel traffic actually goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub address: SocketAddr,
    pub protocol: TransportProtocol,
    pub tunnel_type: TunnelType,
    /// Multihop entry relay
    #[serde(default)]
    pub entry_endpoint: Option<SocketAddr>,
    #[serde(default)]
    pub obfuscation: Option<ObfuscationEndpoint>,
    #[serde(default)]
    pub proxy: Option<ProxyEndpoint>,
    #[serde(default)]
    pub daita: bool,
}

impl TunnelEndpoint {
    /// The address packets leave this machine towards
    pub fn first_hop(&self) -> (SocketAddr, TransportProtocol) {
        if let Some(proxy) = &self.proxy {
            (proxy.endpoint, proxy.protocol)
        } else if let Some(obfuscation) = &self.obfuscation {
            (obfuscation.endpoint, obfuscation.protocol)
        } else if let Some(entry) = self.entry_endpoint {
            (entry, self.protocol)
        } else {
            (self.address, self.protocol)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoIpLocation {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub country: String,
    pub city: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub hostname: Option<String>,
    pub entry_hostname: Option<String>,
    pub bridge_hostname: Option<String>,
    pub obfuscator_hostname: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureIndicator {
    QuantumResistance,
    Multihop,
    BridgeMode,
    SplitTunneling,
    LockdownMode,
    Udp2Tcp,
    Shadowsocks,
    LanSharing,
    DnsContentBlockers,
    CustomDns,
    ServerIpOverride,
    CustomMtu,
    CustomMssFix,
    Daita,
}

/// Active features shown next to the tunnel state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureIndicators(BTreeSet<FeatureIndicator>);

impl FeatureIndicators {
    pub fn insert(&mut self, feature: FeatureIndicator) {
        self.0.insert(feature);
    }

    pub fn contains(&self, feature: FeatureIndicator) -> bool {
        self.0.contains(&feature)
    }

    pub fn iter(&self) -> impl Iterator<Item = FeatureIndicator> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<FeatureIndicator> for FeatureIndicators {
    fn from_iter<I: IntoIterator<Item = FeatureIndicator>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorState {
    pub cause: ErrorStateCause,
    /// Set when even the blocking policy could not be applied
    #[serde(default)]
    pub blocking_error: Option<FirewallPolicyError>,
}

impl ErrorState {
    pub fn new(cause: ErrorStateCause) -> Self {
        Self {
            cause,
            blocking_error: None,
        }
    }

    /// Traffic is blocked while in this error state
    pub fn is_blocking(&self) -> bool {
        self.blocking_error.is_none()
    }
}

/// Flat classification of [`ErrorStateCause`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    AuthFailed,
    Ipv6Unavailable,
    SetFirewallPolicyError,
    SetDnsError,
    StartTunnelError,
    CreateTunnelDevice,
    TunnelParameterError,
    IsOffline,
    NotPrepared,
    OtherAlwaysOnApp,
    OtherLegacyAlwaysOnVpn,
    InvalidDnsServers,
    SplitTunnelError,
    NeedFullDiskPermissions,
}

/// Why the tunnel is in the error state. Variants carry a payload exactly
/// when the cause has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorStateCause {
    AuthFailed { reason: AuthFailedError },
    Ipv6Unavailable,
    SetFirewallPolicyError { error: FirewallPolicyError },
    SetDnsError,
    StartTunnelError,
    CreateTunnelDevice { os_error: Option<i32> },
    TunnelParameterError { error: ParameterGenerationError },
    IsOffline,
    NotPrepared,
    OtherAlwaysOnApp { app_name: String },
    OtherLegacyAlwaysOnVpn,
    InvalidDnsServers { addresses: Vec<IpAddr> },
    SplitTunnelError,
    NeedFullDiskPermissions,
}

impl ErrorStateCause {
    pub fn kind(&self) -> ErrorCause {
        match self {
            ErrorStateCause::AuthFailed { .. } => ErrorCause::AuthFailed,
            ErrorStateCause::Ipv6Unavailable => ErrorCause::Ipv6Unavailable,
            ErrorStateCause::SetFirewallPolicyError { .. } => ErrorCause::SetFirewallPolicyError,
            ErrorStateCause::SetDnsError => ErrorCause::SetDnsError,
            ErrorStateCause::StartTunnelError => ErrorCause::StartTunnelError,
            ErrorStateCause::CreateTunnelDevice { .. } => ErrorCause::CreateTunnelDevice,
            ErrorStateCause::TunnelParameterError { .. } => ErrorCause::TunnelParameterError,
            ErrorStateCause::IsOffline => ErrorCause::IsOffline,
            ErrorStateCause::NotPrepared => ErrorCause::NotPrepared,
            ErrorStateCause::OtherAlwaysOnApp { .. } => ErrorCause::OtherAlwaysOnApp,
            ErrorStateCause::OtherLegacyAlwaysOnVpn => ErrorCause::OtherLegacyAlwaysOnVpn,
            ErrorStateCause::InvalidDnsServers { .. } => ErrorCause::InvalidDnsServers,
            ErrorStateCause::SplitTunnelError => ErrorCause::SplitTunnelError,
            ErrorStateCause::NeedFullDiskPermissions => ErrorCause::NeedFullDiskPermissions,
        }
    }

    /// Causes that need user action and are never retried automatically
    pub fn is_policy(&self) -> bool {
        matches!(
            self.kind(),
            ErrorCause::AuthFailed
                | ErrorCause::SetFirewallPolicyError
                | ErrorCause::NotPrepared
                | ErrorCause::OtherAlwaysOnApp
                | ErrorCause::OtherLegacyAlwaysOnVpn
                | ErrorCause::NeedFullDiskPermissions
        )
    }
}

impl fmt::Display for ErrorStateCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStateCause::AuthFailed { reason } => write!(f, "authentication failed: {reason}"),
            ErrorStateCause::SetFirewallPolicyError { error } => {
                write!(f, "failed to apply firewall policy: {error}")
            }
            ErrorStateCause::TunnelParameterError { error } => {
                write!(f, "failed to generate tunnel parameters: {error}")
            }
            ErrorStateCause::OtherAlwaysOnApp { app_name } => {
                write!(f, "another always-on VPN is active: {app_name}")
            }
            ErrorStateCause::InvalidDnsServers { addresses } => {
                write!(f, "invalid DNS servers: {addresses:?}")
            }
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailedError {
    #[error("invalid account")]
    InvalidAccount,
    #[error("account has no time left")]
    ExpiredAccount,
    #[error("too many connections")]
    TooManyConnections,
    #[error("unknown reason")]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FirewallPolicyError {
    #[error("generic firewall failure")]
    Generic,

    /// Another process holds the firewall lock
    #[error("firewall locked by {lock_name:?} (pid {lock_pid:?})")]
    Locked {
        lock_pid: Option<u32>,
        lock_name: Option<String>,
    },
}

/// Failure to turn settings into a connection plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ParameterGenerationError {
    #[error("no relay matches the constraints")]
    NoMatchingRelay,
    #[error("no bridge relay matches the constraints")]
    NoMatchingBridgeRelay,
    #[error("no WireGuard key available")]
    NoWireguardKey,
    #[error("failed to resolve custom tunnel host")]
    CustomTunnelHostResolutionError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_kind_and_policy() {
        let locked = ErrorStateCause::SetFirewallPolicyError {
            error: FirewallPolicyError::Locked {
                lock_pid: Some(42),
                lock_name: Some("other-vpn".into()),
            },
        };
        assert_eq!(locked.kind(), ErrorCause::SetFirewallPolicyError);
        assert!(locked.is_policy());

        let no_relay = ErrorStateCause::TunnelParameterError {
            error: ParameterGenerationError::NoMatchingRelay,
        };
        assert_eq!(no_relay.kind(), ErrorCause::TunnelParameterError);
        assert!(!no_relay.is_policy());
        assert!(!ErrorStateCause::StartTunnelError.is_policy());
    }

    #[test]
    fn test_error_state_serde_shape() {
        let state = TunnelState::Error {
            error_state: ErrorState::new(ErrorStateCause::TunnelParameterError {
                error: ParameterGenerationError::NoMatchingRelay,
            }),
        };
        let json = serde_json::to_value(&state).unwrap();

        assert_eq!(json["state"], "error");
        assert_eq!(json["error_state"]["cause"]["type"], "tunnel_parameter_error");
        assert_eq!(json["error_state"]["cause"]["error"], "no_matching_relay");
    }

    #[test]
    fn test_first_hop_prefers_obfuscator() {
        let exit: SocketAddr = "185.213.154.66:51820".parse().unwrap();
        let obfuscator: SocketAddr = "185.213.154.66:443".parse().unwrap();
        let endpoint = TunnelEndpoint {
            address: exit,
            protocol: TransportProtocol::Udp,
            tunnel_type: TunnelType::Wireguard,
            entry_endpoint: None,
            obfuscation: Some(ObfuscationEndpoint {
                endpoint: obfuscator,
                protocol: TransportProtocol::Tcp,
                obfuscation_type: ObfuscationType::Udp2Tcp,
            }),
            proxy: None,
            daita: false,
        };

        assert_eq!(endpoint.first_hop(), (obfuscator, TransportProtocol::Tcp));
    }

    #[test]
    fn test_only_one_variant_name() {
        assert_eq!(TunnelState::default().name(), "disconnected");
        assert!(TunnelState::default().is_disconnected());
        assert!(!TunnelState::default().is_active());
    }
}
