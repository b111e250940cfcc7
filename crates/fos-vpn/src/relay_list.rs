//! Relay Inventory
//!
//! The relay list is supplied from outside (fetched periodically) and is
//! treated as read-only data. Relays are keyed by
//! `(country_code, city_code, hostname)`.
//!
//! # File format
//!
//! ```json
//! {
//!   "countries": [{ "name": "Sweden", "code": "se", "cities": [{
//!     "name": "Gothenburg", "code": "got", "latitude": 57.7, "longitude": 11.9,
//!     "relays": [{ "hostname": "se-got-wg-001", "ipv4_addr_in": "185.213.154.66",
//!                  "provider": "31173", "weight": 100, "active": true, "owned": true,
//!                  "endpoint_data": { "type": "wireguard", "public_key": "..." } }]
//!   }]}],
//!   "wireguard": { "port_ranges": [{ "first": 51820, "last": 51820 }] }
//! }
//! ```

use crate::constraints::{TransportProtocol, TunnelType};
use crate::keys::PublicKey;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Full geographic position of a relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    pub country_code: String,
    pub city: String,
    pub city_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayList {
    /// Opaque version tag of the list, if the source provides one
    #[serde(default)]
    pub etag: Option<String>,
    pub countries: Vec<RelayListCountry>,
    #[serde(default)]
    pub openvpn: OpenVpnEndpointData,
    #[serde(default)]
    pub wireguard: WireguardEndpointData,
    #[serde(default)]
    pub bridge: BridgeEndpointData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayListCountry {
    pub name: String,
    pub code: String,
    pub cities: Vec<RelayListCity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayListCity {
    pub name: String,
    pub code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub relays: Vec<Relay>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    pub hostname: String,
    pub ipv4_addr_in: Ipv4Addr,
    #[serde(default)]
    pub ipv6_addr_in: Option<Ipv6Addr>,
    pub provider: String,
    /// Relative selection weight; 0 is only picked when nothing else fits
    pub weight: u64,
    pub active: bool,
    pub owned: bool,
    /// Set when a relay override replaced one of the addresses
    #[serde(default)]
    pub overridden_ip: bool,
    pub endpoint_data: RelayEndpointData,
}

impl Relay {
    pub fn endpoint_type(&self) -> RelayEndpointType {
        match self.endpoint_data {
            RelayEndpointData::Openvpn => RelayEndpointType::Openvpn,
            RelayEndpointData::Bridge => RelayEndpointType::Bridge,
            RelayEndpointData::Wireguard(_) => RelayEndpointType::Wireguard,
        }
    }

    pub fn wireguard(&self) -> Option<&WireguardRelayEndpointData> {
        match &self.endpoint_data {
            RelayEndpointData::Wireguard(data) => Some(data),
            _ => None,
        }
    }

    /// DAITA capable WireGuard relay
    pub fn supports_daita(&self) -> bool {
        self.wireguard().is_some_and(|data| data.daita)
    }

    pub fn supports_tunnel(&self, tunnel_type: TunnelType) -> bool {
        matches!(
            (tunnel_type, self.endpoint_type()),
            (TunnelType::Wireguard, RelayEndpointType::Wireguard)
                | (TunnelType::OpenVpn, RelayEndpointType::Openvpn)
        )
    }

    pub fn address(&self, ipv6: bool) -> Option<IpAddr> {
        if ipv6 {
            self.ipv6_addr_in.map(IpAddr::V6)
        } else {
            Some(IpAddr::V4(self.ipv4_addr_in))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayEndpointType {
    Openvpn,
    Bridge,
    Wireguard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEndpointData {
    Openvpn,
    Bridge,
    Wireguard(WireguardRelayEndpointData),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardRelayEndpointData {
    pub public_key: PublicKey,
    #[serde(default)]
    pub daita: bool,
    /// Extra addresses accepting shadowsocks on any port
    #[serde(default)]
    pub shadowsocks_extra_addr_in: Vec<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            first: port,
            last: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.first..=self.last).contains(&port)
    }

    /// Number of ports in the range (0 if inverted)
    pub fn len(&self) -> u32 {
        if self.last < self.first {
            0
        } else {
            u32::from(self.last - self.first) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardEndpointData {
    pub port_ranges: Vec<PortRange>,
    pub ipv4_gateway: Ipv4Addr,
    pub ipv6_gateway: Ipv6Addr,
    #[serde(default)]
    pub udp2tcp_ports: Vec<u16>,
    #[serde(default)]
    pub shadowsocks_port_ranges: Vec<PortRange>,
}

impl Default for WireguardEndpointData {
    fn default() -> Self {
        Self {
            port_ranges: vec![PortRange::single(51820)],
            ipv4_gateway: Ipv4Addr::new(10, 64, 0, 1),
            ipv6_gateway: Ipv6Addr::new(0xfc00, 0xbbbb, 0xbbbb, 0xbb01, 0, 0, 0, 1),
            udp2tcp_ports: Vec::new(),
            shadowsocks_port_ranges: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenVpnEndpoint {
    pub port: u16,
    pub protocol: TransportProtocol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenVpnEndpointData {
    pub ports: Vec<OpenVpnEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowsocksEndpointData {
    pub port: u16,
    pub cipher: String,
    pub password: String,
    pub protocol: TransportProtocol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEndpointData {
    pub shadowsocks: Vec<ShadowsocksEndpointData>,
}

/// A relay together with where it lives
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedRelay<'a> {
    pub location: Location,
    pub relay: &'a Relay,
}

/// Replacement ingress addresses for a single relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayOverride {
    pub hostname: String,
    #[serde(default)]
    pub ipv4_addr_in: Option<Ipv4Addr>,
    #[serde(default)]
    pub ipv6_addr_in: Option<Ipv6Addr>,
}

impl RelayOverride {
    pub fn empty(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ipv4_addr_in: None,
            ipv6_addr_in: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4_addr_in.is_none() && self.ipv6_addr_in.is_none()
    }

    fn apply_to(&self, relay: &mut Relay) {
        if let Some(ipv4) = self.ipv4_addr_in {
            relay.ipv4_addr_in = ipv4;
            relay.overridden_ip = true;
        }
        if let Some(ipv6) = self.ipv6_addr_in {
            relay.ipv6_addr_in = Some(ipv6);
            relay.overridden_ip = true;
        }
    }
}

impl RelayList {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, RelayListError> {
        serde_json::from_str(content).map_err(|e| RelayListError::ParseError(e.to_string()))
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, RelayListError> {
        serde_json::to_string_pretty(self).map_err(|e| RelayListError::ParseError(e.to_string()))
    }

    /// All relays, in list order
    pub fn relays(&self) -> impl Iterator<Item = LocatedRelay<'_>> {
        self.countries.iter().flat_map(|country| {
            country.cities.iter().flat_map(move |city| {
                city.relays.iter().map(move |relay| LocatedRelay {
                    location: Location {
                        country: country.name.clone(),
                        country_code: country.code.clone(),
                        city: city.name.clone(),
                        city_code: city.code.clone(),
                        latitude: city.latitude,
                        longitude: city.longitude,
                    },
                    relay,
                })
            })
        })
    }

    pub fn relay_count(&self) -> usize {
        self.countries
            .iter()
            .flat_map(|country| &country.cities)
            .map(|city| city.relays.len())
            .sum()
    }

    /// Look up a relay by hostname
    pub fn find(&self, hostname: &str) -> Option<LocatedRelay<'_>> {
        self.relays().find(|located| located.relay.hostname == hostname)
    }

    /// Apply user supplied address overrides. Borrows when there is nothing to apply.
    pub fn with_overrides(&self, overrides: &[RelayOverride]) -> Cow<'_, RelayList> {
        if overrides.iter().all(RelayOverride::is_empty) {
            return Cow::Borrowed(self);
        }

        let mut list = self.clone();
        for relay in list
            .countries
            .iter_mut()
            .flat_map(|country| &mut country.cities)
            .flat_map(|city| &mut city.relays)
        {
            if let Some(relay_override) = overrides.iter().find(|o| o.hostname == relay.hostname) {
                relay_override.apply_to(relay);
            }
        }
        Cow::Owned(list)
    }
}

/// Relay list loading errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayListError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn wg_relay(hostname: &str) -> Relay {
        Relay {
            hostname: hostname.to_string(),
            ipv4_addr_in: Ipv4Addr::new(185, 213, 154, 66),
            ipv6_addr_in: None,
            provider: "31173".to_string(),
            weight: 100,
            active: true,
            owned: true,
            overridden_ip: false,
            endpoint_data: RelayEndpointData::Wireguard(WireguardRelayEndpointData {
                public_key: KeyPair::generate().public,
                daita: false,
                shadowsocks_extra_addr_in: Vec::new(),
            }),
        }
    }

    fn sample() -> RelayList {
        RelayList {
            countries: vec![RelayListCountry {
                name: "Sweden".into(),
                code: "se".into(),
                cities: vec![RelayListCity {
                    name: "Gothenburg".into(),
                    code: "got".into(),
                    latitude: 57.7,
                    longitude: 11.9,
                    relays: vec![wg_relay("se-got-wg-001"), wg_relay("se-got-wg-002")],
                }],
            }],
            ..RelayList::default()
        }
    }

    #[test]
    fn test_relays_carry_location() {
        let list = sample();
        let located: Vec<_> = list.relays().collect();

        assert_eq!(list.relay_count(), 2);
        assert_eq!(located[0].location.country_code, "se");
        assert_eq!(located[1].location.city_code, "got");
        assert_eq!(located[1].relay.hostname, "se-got-wg-002");
    }

    #[test]
    fn test_overrides_replace_address() {
        let list = sample();
        let overridden = list.with_overrides(&[RelayOverride {
            hostname: "se-got-wg-002".into(),
            ipv4_addr_in: Some(Ipv4Addr::new(10, 0, 0, 9)),
            ipv6_addr_in: None,
        }]);

        let relay = overridden.find("se-got-wg-002").unwrap().relay;
        assert_eq!(relay.ipv4_addr_in, Ipv4Addr::new(10, 0, 0, 9));
        assert!(relay.overridden_ip);
        assert!(!overridden.find("se-got-wg-001").unwrap().relay.overridden_ip);
    }

    #[test]
    fn test_empty_overrides_borrow() {
        let list = sample();
        assert!(matches!(
            list.with_overrides(&[RelayOverride::empty("se-got-wg-001")]),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn test_json_file_format() {
        let json = list_json();
        let list = RelayList::from_json(&json).unwrap();

        assert_eq!(list.relay_count(), 2);
        assert_eq!(list.wireguard.port_ranges, vec![PortRange::single(51820)]);
        assert_eq!(list.find("se-got-ovpn-001").unwrap().relay.endpoint_type(), RelayEndpointType::Openvpn);
    }

    fn list_json() -> String {
        let key = KeyPair::generate().public.to_base64();
        format!(
            r#"{{
              "countries": [{{ "name": "Sweden", "code": "se", "cities": [{{
                "name": "Gothenburg", "code": "got", "latitude": 57.7, "longitude": 11.9,
                "relays": [
                  {{ "hostname": "se-got-wg-001", "ipv4_addr_in": "185.213.154.66",
                     "provider": "31173", "weight": 100, "active": true, "owned": true,
                     "endpoint_data": {{ "type": "wireguard", "public_key": "{key}" }} }},
                  {{ "hostname": "se-got-ovpn-001", "ipv4_addr_in": "185.213.154.67",
                     "provider": "31173", "weight": 100, "active": true, "owned": true,
                     "endpoint_data": {{ "type": "openvpn" }} }}
                ]
              }}]}}]
            }}"#
        )
    }

    #[test]
    fn test_port_range() {
        let range = PortRange { first: 4000, last: 4002 };
        assert_eq!(range.len(), 3);
        assert!(range.contains(4001));
        assert!(!range.contains(4003));
        assert!(PortRange { first: 5, last: 1 }.is_empty());
    }
}
