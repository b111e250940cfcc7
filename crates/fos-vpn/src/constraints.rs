//! Relay Constraints
//!
//! Immutable value types describing which relays a user accepts and how a
//! location constraint is narrowed down:
//!
//! ```text
//! Country("se") ⊇ City("se", "got") ⊇ Hostname("se", "got", "se-got-wg-001")
//! ```
//!
//! A constraint referencing a custom list is expanded to the union of the
//! list's geographic constraints before any relay is looked at.

use crate::custom_list::{CustomListId, CustomListsSettings};
use crate::keys::PublicKey;
use crate::relay_list::Location;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Either "anything goes" or exactly one value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint<T> {
    #[default]
    Any,
    Only(T),
}

impl<T> Constraint<T> {
    pub fn is_any(&self) -> bool {
        matches!(self, Constraint::Any)
    }

    pub fn as_ref(&self) -> Constraint<&T> {
        match self {
            Constraint::Any => Constraint::Any,
            Constraint::Only(value) => Constraint::Only(value),
        }
    }

    pub fn option(self) -> Option<T> {
        match self {
            Constraint::Any => None,
            Constraint::Only(value) => Some(value),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Constraint<U> {
        match self {
            Constraint::Any => Constraint::Any,
            Constraint::Only(value) => Constraint::Only(f(value)),
        }
    }

    /// Use `other` when this constraint is `Any`
    pub fn or(self, other: Constraint<T>) -> Constraint<T> {
        match self {
            Constraint::Any => other,
            only => only,
        }
    }
}

impl<T: PartialEq> Constraint<T> {
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Constraint::Any => true,
            Constraint::Only(expected) => expected == value,
        }
    }
}

impl<T> From<Option<T>> for Constraint<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Constraint::Any, Constraint::Only)
    }
}

impl<T: fmt::Display> fmt::Display for Constraint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Any => f.write_str("any"),
            Constraint::Only(value) => value.fmt(f),
        }
    }
}

/// Country code, e.g. "se"
pub type CountryCode = String;
/// City code, e.g. "got"
pub type CityCode = String;
/// Relay hostname, e.g. "se-got-wg-001"
pub type Hostname = String;

/// Hierarchical geographic filter.
///
/// The variants encode "hostname implies city implies country", so a
/// constraint naming a hostname without its city can not be built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeographicLocationConstraint {
    Country {
        country: CountryCode,
    },
    City {
        country: CountryCode,
        city: CityCode,
    },
    Hostname {
        country: CountryCode,
        city: CityCode,
        hostname: Hostname,
    },
}

impl GeographicLocationConstraint {
    pub fn country(country: impl Into<String>) -> Self {
        Self::Country {
            country: country.into(),
        }
    }

    pub fn city(country: impl Into<String>, city: impl Into<String>) -> Self {
        Self::City {
            country: country.into(),
            city: city.into(),
        }
    }

    pub fn hostname(
        country: impl Into<String>,
        city: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self::Hostname {
            country: country.into(),
            city: city.into(),
            hostname: hostname.into(),
        }
    }

    pub fn country_code(&self) -> &str {
        match self {
            Self::Country { country }
            | Self::City { country, .. }
            | Self::Hostname { country, .. } => country,
        }
    }

    pub fn city_code(&self) -> Option<&str> {
        match self {
            Self::Country { .. } => None,
            Self::City { city, .. } | Self::Hostname { city, .. } => Some(city),
        }
    }

    pub fn hostname_str(&self) -> Option<&str> {
        match self {
            Self::Hostname { hostname, .. } => Some(hostname),
            _ => None,
        }
    }

    /// 1 for a country, 2 for a city, 3 for a single relay
    pub fn depth(&self) -> u8 {
        match self {
            Self::Country { .. } => 1,
            Self::City { .. } => 2,
            Self::Hostname { .. } => 3,
        }
    }

    /// Does a relay at `location` named `hostname` satisfy this constraint?
    pub fn matches(&self, location: &Location, hostname: &str) -> bool {
        match self {
            Self::Country { country } => location.country_code == *country,
            Self::City { country, city } => {
                location.country_code == *country && location.city_code == *city
            }
            Self::Hostname {
                country,
                city,
                hostname: wanted,
            } => {
                location.country_code == *country
                    && location.city_code == *city
                    && hostname == wanted
            }
        }
    }

    /// True if every relay matched by `self` is also matched by `other`
    pub fn is_within(&self, other: &Self) -> bool {
        if self.country_code() != other.country_code() {
            return false;
        }
        match (other.city_code(), self.city_code()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(theirs), Some(ours)) if theirs != ours => false,
            (Some(_), Some(_)) => match (other.hostname_str(), self.hostname_str()) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(theirs), Some(ours)) => theirs == ours,
            },
        }
    }

    /// Strictly narrower than `other`
    pub fn is_more_specific_than(&self, other: &Self) -> bool {
        self != other && self.is_within(other)
    }
}

/// `a < b` means `a` is strictly more specific than `b`. Constraints on
/// disjoint locations are incomparable.
impl PartialOrd for GeographicLocationConstraint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            Some(Ordering::Equal)
        } else if self.is_within(other) {
            Some(Ordering::Less)
        } else if other.is_within(self) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

impl fmt::Display for GeographicLocationConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Country { country } => write!(f, "{country}"),
            Self::City { country, city } => write!(f, "{country}-{city}"),
            Self::Hostname { hostname, .. } => write!(f, "{hostname}"),
        }
    }
}

/// Where the user wants to exit (or enter) the network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocationConstraint {
    Location {
        location: GeographicLocationConstraint,
    },
    CustomList {
        list_id: CustomListId,
    },
}

impl LocationConstraint {
    /// Expand into plain geographic constraints.
    pub fn resolve(
        &self,
        custom_lists: &CustomListsSettings,
    ) -> Result<ResolvedLocationConstraint, ConstraintError> {
        match self {
            Self::Location { location } => {
                Ok(ResolvedLocationConstraint(vec![location.clone()]))
            }
            Self::CustomList { list_id } => custom_lists
                .find(list_id)
                .map(|list| ResolvedLocationConstraint(list.locations.clone()))
                .ok_or(ConstraintError::UnknownCustomList(*list_id)),
        }
    }

    pub fn custom_list_id(&self) -> Option<&CustomListId> {
        match self {
            Self::CustomList { list_id } => Some(list_id),
            Self::Location { .. } => None,
        }
    }
}

impl From<GeographicLocationConstraint> for LocationConstraint {
    fn from(location: GeographicLocationConstraint) -> Self {
        Self::Location { location }
    }
}

/// Union of geographic constraints a relay must satisfy at least one of
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocationConstraint(Vec<GeographicLocationConstraint>);

impl ResolvedLocationConstraint {
    pub fn matches(&self, location: &Location, hostname: &str) -> bool {
        self.0.iter().any(|c| c.matches(location, hostname))
    }

    pub fn locations(&self) -> &[GeographicLocationConstraint] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Resolve an optional location; `Any` resolves to `None` (no filter).
pub fn resolve_location(
    location: &Constraint<LocationConstraint>,
    custom_lists: &CustomListsSettings,
) -> Result<Option<ResolvedLocationConstraint>, ConstraintError> {
    match location {
        Constraint::Any => Ok(None),
        Constraint::Only(location) => location.resolve(custom_lists).map(Some),
    }
}

/// Hosting providers to accept. An empty set accepts all providers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Providers(BTreeSet<String>);

impl Providers {
    pub fn new(providers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(providers.into_iter().map(Into::into).collect())
    }

    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_any(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, provider: &str) -> bool {
        self.0.is_empty() || self.0.contains(provider)
    }
}

/// Who operates the relay hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Owned,
    Rented,
}

impl Ownership {
    pub fn matches(&self, owned: bool) -> bool {
        match self {
            Ownership::Owned => owned,
            Ownership::Rented => !owned,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelType {
    Wireguard,
    OpenVpn,
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelType::Wireguard => f.write_str("WireGuard"),
            TunnelType::OpenVpn => f.write_str("OpenVPN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Udp => f.write_str("UDP"),
            TransportProtocol::Tcp => f.write_str("TCP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportPort {
    pub protocol: TransportProtocol,
    pub port: Constraint<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardConstraints {
    pub port: Constraint<u16>,
    pub ip_version: Constraint<IpVersion>,
    pub use_multihop: bool,
    pub entry_location: Constraint<LocationConstraint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenVpnConstraints {
    pub port: Constraint<TransportPort>,
}

/// Constraints for picking a relay from the relay list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConstraints {
    pub location: Constraint<LocationConstraint>,
    pub providers: Providers,
    pub ownership: Constraint<Ownership>,
    pub tunnel_protocol: Constraint<TunnelType>,
    pub wireguard_constraints: WireguardConstraints,
    pub openvpn_constraints: OpenVpnConstraints,
}

impl Default for RelayConstraints {
    fn default() -> Self {
        Self {
            location: Constraint::Any,
            providers: Providers::any(),
            ownership: Constraint::Any,
            tunnel_protocol: Constraint::Only(TunnelType::Wireguard),
            wireguard_constraints: WireguardConstraints::default(),
            openvpn_constraints: OpenVpnConstraints::default(),
        }
    }
}

/// Tunnel parameters for a user-supplied server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionConfig {
    Wireguard {
        peer_public_key: PublicKey,
        port: u16,
        tunnel_addresses: Vec<IpAddr>,
    },
    OpenVpn {
        port: u16,
        protocol: TransportProtocol,
        username: String,
        password: String,
    },
}

impl ConnectionConfig {
    pub fn port(&self) -> u16 {
        match self {
            ConnectionConfig::Wireguard { port, .. } | ConnectionConfig::OpenVpn { port, .. } => {
                *port
            }
        }
    }

    pub fn protocol(&self) -> TransportProtocol {
        match self {
            ConnectionConfig::Wireguard { .. } => TransportProtocol::Udp,
            ConnectionConfig::OpenVpn { protocol, .. } => *protocol,
        }
    }

    pub fn tunnel_type(&self) -> TunnelType {
        match self {
            ConnectionConfig::Wireguard { .. } => TunnelType::Wireguard,
            ConnectionConfig::OpenVpn { .. } => TunnelType::OpenVpn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTunnelEndpoint {
    pub host: String,
    pub config: ConnectionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelaySettings {
    Normal(RelayConstraints),
    Custom(CustomTunnelEndpoint),
}

impl Default for RelaySettings {
    fn default() -> Self {
        RelaySettings::Normal(RelayConstraints::default())
    }
}

impl RelaySettings {
    /// Every custom list referenced by these settings
    pub fn custom_list_references(&self) -> Vec<&CustomListId> {
        match self {
            RelaySettings::Custom(_) => Vec::new(),
            RelaySettings::Normal(constraints) => [
                &constraints.location,
                &constraints.wireguard_constraints.entry_location,
            ]
            .into_iter()
            .filter_map(|c| match c {
                Constraint::Only(location) => location.custom_list_id(),
                Constraint::Any => None,
            })
            .collect(),
        }
    }
}

/// Constraint resolution failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstraintError {
    #[error("Unknown custom list: {0}")]
    UnknownCustomList(CustomListId),
}
