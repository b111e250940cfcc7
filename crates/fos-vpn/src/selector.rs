//! Relay Selector
//!
//! Turns settings plus a relay list into a fully specified connection plan.
//! Selection is a pure function of its inputs and the random source, so a
//! seeded RNG gives reproducible plans.
//!
//! # Algorithm
//!
//! Relays are filtered in a fixed order:
//!
//! 1. `active`
//! 2. location (country / city / hostname, custom lists expanded)
//! 3. providers (empty set means any)
//! 4. ownership
//! 5. endpoint type matching the tunnel type
//!
//! One survivor is then drawn with probability proportional to its weight.
//! A relay with weight 0 is only drawn when every survivor has weight 0.

use crate::constraints::{
    Constraint, CustomTunnelEndpoint, IpVersion, LocationConstraint, Ownership, Providers,
    RelayConstraints, RelaySettings, ResolvedLocationConstraint, TransportPort,
    TransportProtocol, TunnelType, resolve_location,
};
use crate::custom_list::CustomListsSettings;
use crate::device::WireguardData;
use crate::access_method::CustomProxy;
use crate::firewall::AllowedEndpoint;
use crate::keys::{PrivateKey, PublicKey};
use crate::relay_list::{
    LocatedRelay, Location, OpenVpnEndpoint, PortRange, RelayEndpointType, RelayList,
    RelayOverride,
};
use crate::settings::{
    BridgeConstraints, BridgeState, BridgeType, DaitaSettings, DnsState,
    QuantumResistantState, SelectedObfuscation, Settings,
};
use crate::states::{
    FeatureIndicator, FeatureIndicators, GeoIpLocation, ObfuscationEndpoint, ObfuscationType,
    ParameterGenerationError, ProxyEndpoint, ProxyType, TunnelEndpoint, TunnelStateRelayInfo,
};
use rand::Rng;
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

/// Automatic obfuscation and bridge fallbacks repeat with this period
const FALLBACK_CYCLE: u32 = 4;

/// Obfuscation to put in front of the first WireGuard hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObfuscationQuery {
    Off,
    Udp2Tcp { port: Constraint<u16> },
    Shadowsocks { port: Constraint<u16> },
}

/// Bridge to put in front of an OpenVPN relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeQuery {
    Normal(BridgeConstraints),
    Custom(CustomProxy),
}

/// Everything needed for one selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorQuery {
    pub relay_settings: RelaySettings,
    pub obfuscation: ObfuscationQuery,
    /// Obfuscation was picked automatically and may be dropped if the relay
    /// list can not provide it
    pub obfuscation_is_fallback: bool,
    pub bridge: Option<BridgeQuery>,
    pub daita: DaitaSettings,
    pub quantum_resistant: bool,
    pub wireguard: Option<WireguardData>,
}

impl SelectorQuery {
    /// Build the query for connection attempt number `attempt` (0-based).
    ///
    /// Automatic obfuscation goes none, none, Udp2Tcp, Shadowsocks and then
    /// repeats. An automatic bridge is used on the same attempts that
    /// obfuscate, and only for OpenVPN over TCP.
    pub fn from_settings(
        settings: &Settings,
        attempt: u32,
        wireguard: Option<&WireguardData>,
    ) -> Self {
        let phase = attempt % FALLBACK_CYCLE;
        let obfuscation_settings = &settings.obfuscation_settings;

        let obfuscation = match obfuscation_settings.selected_obfuscation {
            SelectedObfuscation::Off => ObfuscationQuery::Off,
            SelectedObfuscation::Udp2Tcp => ObfuscationQuery::Udp2Tcp {
                port: obfuscation_settings
                    .udp2tcp
                    .as_ref()
                    .map(|s| s.port.clone())
                    .unwrap_or_default(),
            },
            SelectedObfuscation::Shadowsocks => ObfuscationQuery::Shadowsocks {
                port: obfuscation_settings
                    .shadowsocks
                    .as_ref()
                    .map(|s| s.port.clone())
                    .unwrap_or_default(),
            },
            SelectedObfuscation::Auto => match phase {
                2 => ObfuscationQuery::Udp2Tcp {
                    port: Constraint::Any,
                },
                3 => ObfuscationQuery::Shadowsocks {
                    port: Constraint::Any,
                },
                _ => ObfuscationQuery::Off,
            },
        };
        let obfuscation_is_fallback =
            obfuscation_settings.selected_obfuscation == SelectedObfuscation::Auto;

        let mut relay_settings = settings.relay_settings.clone();
        let bridge_query = match settings.bridge_settings.bridge_type {
            BridgeType::Normal => Some(BridgeQuery::Normal(
                settings.bridge_settings.normal.clone(),
            )),
            BridgeType::Custom => settings
                .bridge_settings
                .custom
                .clone()
                .map(BridgeQuery::Custom),
        };
        let bridge = match settings.bridge_state {
            BridgeState::Off => None,
            BridgeState::On => bridge_query,
            BridgeState::Auto if phase >= 2 => match &mut relay_settings {
                RelaySettings::Normal(constraints) => {
                    force_tcp(constraints).then_some(bridge_query).flatten()
                }
                RelaySettings::Custom(_) => None,
            },
            BridgeState::Auto => None,
        };

        Self {
            relay_settings,
            obfuscation,
            obfuscation_is_fallback,
            bridge,
            daita: settings.tunnel_options.wireguard.daita,
            quantum_resistant: settings.tunnel_options.wireguard.quantum_resistant
                == QuantumResistantState::On,
            wireguard: wireguard.cloned(),
        }
    }
}

/// Restrict OpenVPN to TCP unless the user pinned UDP. Returns whether TCP is usable.
fn force_tcp(constraints: &mut RelayConstraints) -> bool {
    match &constraints.openvpn_constraints.port {
        Constraint::Any => {
            constraints.openvpn_constraints.port = Constraint::Only(TransportPort {
                protocol: TransportProtocol::Tcp,
                port: Constraint::Any,
            });
            true
        }
        Constraint::Only(port) => port.protocol == TransportProtocol::Tcp,
    }
}

/// A relay picked for one hop
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedRelay {
    pub hostname: String,
    pub location: Location,
    pub endpoint: SocketAddr,
    pub public_key: Option<PublicKey>,
    pub overridden_ip: bool,
    pub daita: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireguardPlan {
    pub exit: SelectedRelay,
    pub entry: Option<SelectedRelay>,
    pub obfuscation: Option<ObfuscationEndpoint>,
    pub daita: bool,
    pub quantum_resistant: bool,
    pub private_key: PrivateKey,
    pub tunnel_addresses: Vec<IpAddr>,
}

impl WireguardPlan {
    pub fn first_hop(&self) -> &SelectedRelay {
        self.entry.as_ref().unwrap_or(&self.exit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgePlan {
    Shadowsocks {
        hostname: String,
        location: Location,
        endpoint: SocketAddr,
        cipher: String,
        password: String,
    },
    Custom(CustomProxy),
}

impl BridgePlan {
    pub fn proxy_endpoint(&self) -> ProxyEndpoint {
        match self {
            BridgePlan::Shadowsocks { endpoint, .. } => ProxyEndpoint {
                endpoint: *endpoint,
                protocol: TransportProtocol::Tcp,
                proxy_type: ProxyType::Shadowsocks,
            },
            BridgePlan::Custom(proxy) => ProxyEndpoint {
                endpoint: proxy.peer(),
                protocol: TransportProtocol::Tcp,
                proxy_type: ProxyType::Custom,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenVpnPlan {
    pub exit: SelectedRelay,
    pub protocol: TransportProtocol,
    pub bridge: Option<BridgePlan>,
}

/// A user supplied server. `address` is `None` until the host is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomPlan {
    pub endpoint: CustomTunnelEndpoint,
    pub address: Option<SocketAddr>,
}

/// Fully specified parameters for one connection attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionPlan {
    Wireguard(WireguardPlan),
    OpenVpn(OpenVpnPlan),
    Custom(CustomPlan),
}

impl ConnectionPlan {
    pub fn tunnel_type(&self) -> TunnelType {
        match self {
            ConnectionPlan::Wireguard(_) => TunnelType::Wireguard,
            ConnectionPlan::OpenVpn(_) => TunnelType::OpenVpn,
            ConnectionPlan::Custom(custom) => custom.endpoint.config.tunnel_type(),
        }
    }

    pub fn exit_hostname(&self) -> Option<&str> {
        match self {
            ConnectionPlan::Wireguard(plan) => Some(&plan.exit.hostname),
            ConnectionPlan::OpenVpn(plan) => Some(&plan.exit.hostname),
            ConnectionPlan::Custom(_) => None,
        }
    }

    /// `None` for a custom endpoint whose host is not resolved yet
    pub fn tunnel_endpoint(&self) -> Option<TunnelEndpoint> {
        match self {
            ConnectionPlan::Wireguard(plan) => Some(TunnelEndpoint {
                address: plan.exit.endpoint,
                protocol: TransportProtocol::Udp,
                tunnel_type: TunnelType::Wireguard,
                entry_endpoint: plan.entry.as_ref().map(|entry| entry.endpoint),
                obfuscation: plan.obfuscation,
                proxy: None,
                daita: plan.daita,
            }),
            ConnectionPlan::OpenVpn(plan) => Some(TunnelEndpoint {
                address: plan.exit.endpoint,
                protocol: plan.protocol,
                tunnel_type: TunnelType::OpenVpn,
                entry_endpoint: None,
                obfuscation: None,
                proxy: plan.bridge.as_ref().map(BridgePlan::proxy_endpoint),
                daita: false,
            }),
            ConnectionPlan::Custom(custom) => custom.address.map(|address| TunnelEndpoint {
                address,
                protocol: custom.endpoint.config.protocol(),
                tunnel_type: custom.endpoint.config.tunnel_type(),
                entry_endpoint: None,
                obfuscation: None,
                proxy: None,
                daita: false,
            }),
        }
    }

    /// Endpoint the firewall must let through while connecting
    pub fn allowed_endpoint(&self) -> Option<AllowedEndpoint> {
        self.tunnel_endpoint().map(|endpoint| {
            let (address, protocol) = endpoint.first_hop();
            AllowedEndpoint { address, protocol }
        })
    }

    pub fn location(&self) -> Option<GeoIpLocation> {
        let (exit, entry, bridge_hostname, obfuscator_hostname) = match self {
            ConnectionPlan::Wireguard(plan) => (
                &plan.exit,
                plan.entry.as_ref(),
                None,
                plan.obfuscation
                    .map(|_| plan.first_hop().hostname.clone()),
            ),
            ConnectionPlan::OpenVpn(plan) => (
                &plan.exit,
                None,
                plan.bridge.as_ref().and_then(|bridge| match bridge {
                    BridgePlan::Shadowsocks { hostname, .. } => Some(hostname.clone()),
                    BridgePlan::Custom(_) => None,
                }),
                None,
            ),
            ConnectionPlan::Custom(_) => return None,
        };

        let (ipv4, ipv6) = match exit.endpoint.ip() {
            IpAddr::V4(v4) => (Some(v4), None),
            IpAddr::V6(v6) => (None, Some(v6)),
        };
        Some(GeoIpLocation {
            ipv4,
            ipv6,
            country: exit.location.country.clone(),
            city: Some(exit.location.city.clone()),
            latitude: exit.location.latitude,
            longitude: exit.location.longitude,
            hostname: Some(exit.hostname.clone()),
            entry_hostname: entry.map(|entry| entry.hostname.clone()),
            bridge_hostname,
            obfuscator_hostname,
        })
    }

    pub fn relay_info(&self) -> Option<TunnelStateRelayInfo> {
        self.tunnel_endpoint().map(|tunnel_endpoint| TunnelStateRelayInfo {
            tunnel_endpoint,
            location: self.location(),
        })
    }

    /// Features in effect when connecting with this plan under `settings`
    pub fn feature_indicators(&self, settings: &Settings) -> FeatureIndicators {
        let mut features = FeatureIndicators::default();
        let options = &settings.tunnel_options;

        if settings.allow_lan {
            features.insert(FeatureIndicator::LanSharing);
        }
        if settings.block_when_disconnected {
            features.insert(FeatureIndicator::LockdownMode);
        }
        if settings.split_tunnel.enable_exclusions && !settings.split_tunnel.apps.is_empty() {
            features.insert(FeatureIndicator::SplitTunneling);
        }
        match options.dns_options.state {
            DnsState::Default if options.dns_options.default_options.any_blocker_enabled() => {
                features.insert(FeatureIndicator::DnsContentBlockers);
            }
            DnsState::Custom if !options.dns_options.custom_options.addresses.is_empty() => {
                features.insert(FeatureIndicator::CustomDns);
            }
            _ => {}
        }

        match self {
            ConnectionPlan::Wireguard(plan) => {
                if plan.quantum_resistant {
                    features.insert(FeatureIndicator::QuantumResistance);
                }
                if plan.entry.is_some() {
                    features.insert(FeatureIndicator::Multihop);
                }
                if plan.daita {
                    features.insert(FeatureIndicator::Daita);
                }
                match plan.obfuscation.map(|o| o.obfuscation_type) {
                    Some(ObfuscationType::Udp2Tcp) => features.insert(FeatureIndicator::Udp2Tcp),
                    Some(ObfuscationType::Shadowsocks) => {
                        features.insert(FeatureIndicator::Shadowsocks)
                    }
                    None => {}
                }
                if plan.exit.overridden_ip
                    || plan.entry.as_ref().is_some_and(|entry| entry.overridden_ip)
                {
                    features.insert(FeatureIndicator::ServerIpOverride);
                }
                if options.wireguard.mtu.is_some() {
                    features.insert(FeatureIndicator::CustomMtu);
                }
            }
            ConnectionPlan::OpenVpn(plan) => {
                if plan.bridge.is_some() {
                    features.insert(FeatureIndicator::BridgeMode);
                }
                if plan.exit.overridden_ip {
                    features.insert(FeatureIndicator::ServerIpOverride);
                }
                if options.openvpn.mssfix.is_some() {
                    features.insert(FeatureIndicator::CustomMssFix);
                }
            }
            ConnectionPlan::Custom(_) => {}
        }
        features
    }
}

/// Filter applied to every relay, in order
#[derive(Debug, Clone, Copy)]
struct RelayFilter<'q> {
    location: Option<&'q ResolvedLocationConstraint>,
    providers: &'q Providers,
    ownership: &'q Constraint<Ownership>,
    endpoint_type: RelayEndpointType,
    require_daita: bool,
    require_ipv6: bool,
}

impl RelayFilter<'_> {
    fn matches(&self, located: &LocatedRelay<'_>) -> bool {
        let relay = located.relay;
        relay.active
            && self
                .location
                .is_none_or(|location| location.matches(&located.location, &relay.hostname))
            && self.providers.matches(&relay.provider)
            && match self.ownership {
                Constraint::Any => true,
                Constraint::Only(ownership) => ownership.matches(relay.owned),
            }
            && relay.endpoint_type() == self.endpoint_type
            && (!self.require_daita || relay.supports_daita())
            && (!self.require_ipv6 || relay.ipv6_addr_in.is_some())
    }
}

/// Draw from `first`, then from `second` without the relay already taken.
/// Only relays that leave `second` non-empty are eligible in the first draw.
fn pick_distinct<'a, R: Rng + ?Sized>(
    first: &[LocatedRelay<'a>],
    second: &[LocatedRelay<'a>],
    rng: &mut R,
) -> Option<(LocatedRelay<'a>, LocatedRelay<'a>)> {
    let weight = |located: &LocatedRelay<'_>| located.relay.weight;
    let eligible: Vec<_> = first
        .iter()
        .filter(|a| second.iter().any(|b| b.relay.hostname != a.relay.hostname))
        .cloned()
        .collect();
    let a = pick_weighted(&eligible, weight, rng)?.clone();
    let rest: Vec<_> = second
        .iter()
        .filter(|b| b.relay.hostname != a.relay.hostname)
        .cloned()
        .collect();
    let b = pick_weighted(&rest, weight, rng)?.clone();
    Some((a, b))
}

/// Draw one item with probability proportional to `weight`.
///
/// Zero-weight items are skipped unless every item has weight 0, in which
/// case the draw is uniform.
pub fn pick_weighted<'t, T, R: Rng + ?Sized>(
    items: &'t [T],
    weight: impl Fn(&T) -> u64,
    rng: &mut R,
) -> Option<&'t T> {
    if items.is_empty() {
        return None;
    }
    let total = items
        .iter()
        .fold(0u64, |sum, item| sum.saturating_add(weight(item)));
    if total == 0 {
        return items.get(rng.gen_range(0..items.len()));
    }

    let mut target = rng.gen_range(0..total);
    for item in items {
        let item_weight = weight(item);
        if target < item_weight {
            return Some(item);
        }
        target -= item_weight;
    }
    items.last()
}

/// Uniformly random port from a set of ranges
fn random_port_in_ranges<R: Rng + ?Sized>(ranges: &[PortRange], rng: &mut R) -> Option<u16> {
    let total: u32 = ranges.iter().map(PortRange::len).sum();
    if total == 0 {
        return None;
    }
    let mut index = rng.gen_range(0..total);
    for range in ranges {
        if index < range.len() {
            return u16::try_from(u32::from(range.first) + index).ok();
        }
        index -= range.len();
    }
    None
}

/// Picks relays from a relay list
pub struct RelaySelector<'a> {
    relay_list: Cow<'a, RelayList>,
    custom_lists: &'a CustomListsSettings,
}

impl<'a> RelaySelector<'a> {
    pub fn new(
        relay_list: &'a RelayList,
        custom_lists: &'a CustomListsSettings,
        overrides: &[RelayOverride],
    ) -> Self {
        Self {
            relay_list: relay_list.with_overrides(overrides),
            custom_lists,
        }
    }

    /// Select a connection plan for `query`
    pub fn select<R: Rng + ?Sized>(
        &self,
        query: &SelectorQuery,
        rng: &mut R,
    ) -> Result<ConnectionPlan, ParameterGenerationError> {
        let constraints = match &query.relay_settings {
            RelaySettings::Custom(endpoint) => {
                let address = endpoint
                    .host
                    .parse::<IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, endpoint.config.port()));
                return Ok(ConnectionPlan::Custom(CustomPlan {
                    endpoint: endpoint.clone(),
                    address,
                }));
            }
            RelaySettings::Normal(constraints) => constraints,
        };

        let plan = match constraints.tunnel_protocol {
            Constraint::Only(TunnelType::Wireguard) => self
                .select_wireguard(constraints, query, rng)
                .map(ConnectionPlan::Wireguard),
            Constraint::Only(TunnelType::OpenVpn) => self
                .select_openvpn(constraints, query, rng)
                .map(ConnectionPlan::OpenVpn),
            Constraint::Any => match self.select_wireguard(constraints, query, rng) {
                Err(ParameterGenerationError::NoMatchingRelay) => {
                    debug!("No WireGuard relay matches, trying OpenVPN");
                    self.select_openvpn(constraints, query, rng)
                        .map(ConnectionPlan::OpenVpn)
                }
                other => other.map(ConnectionPlan::Wireguard),
            },
        }?;

        debug!(
            "Selected {} relay {}",
            plan.tunnel_type(),
            plan.exit_hostname().unwrap_or("-")
        );
        Ok(plan)
    }

    fn resolve(
        &self,
        location: &Constraint<LocationConstraint>,
        error: ParameterGenerationError,
    ) -> Result<Option<ResolvedLocationConstraint>, ParameterGenerationError> {
        resolve_location(location, self.custom_lists).map_err(|e| {
            warn!("Location constraint can not be resolved: {}", e);
            error
        })
    }

    fn candidates(&self, filter: &RelayFilter<'_>) -> Vec<LocatedRelay<'_>> {
        self.relay_list
            .relays()
            .filter(|located| filter.matches(located))
            .collect()
    }

    fn pick<R: Rng + ?Sized>(
        &self,
        filter: &RelayFilter<'_>,
        rng: &mut R,
    ) -> Option<LocatedRelay<'_>> {
        let candidates = self.candidates(filter);
        pick_weighted(&candidates, |located| located.relay.weight, rng).cloned()
    }

    /// Pick an `(exit, entry)` pair of two different relays.
    ///
    /// The side with fewer candidates is drawn first, and only among relays
    /// that leave the other side at least one candidate, so a pair is found
    /// whenever one exists.
    fn pick_hops<R: Rng + ?Sized>(
        &self,
        exit_filter: &RelayFilter<'_>,
        entry_filter: &RelayFilter<'_>,
        rng: &mut R,
    ) -> Option<(LocatedRelay<'_>, LocatedRelay<'_>)> {
        let exits = self.candidates(exit_filter);
        let entries = self.candidates(entry_filter);
        if entries.len() <= exits.len() {
            let (entry, exit) = pick_distinct(&entries, &exits, rng)?;
            Some((exit, entry))
        } else {
            pick_distinct(&exits, &entries, rng)
        }
    }

    fn select_wireguard<R: Rng + ?Sized>(
        &self,
        constraints: &RelayConstraints,
        query: &SelectorQuery,
        rng: &mut R,
    ) -> Result<WireguardPlan, ParameterGenerationError> {
        use ParameterGenerationError::NoMatchingRelay;

        let wg = &constraints.wireguard_constraints;
        let exit_location = self.resolve(&constraints.location, NoMatchingRelay)?;
        let ipv6 = wg.ip_version == Constraint::Only(IpVersion::V6);
        let base = RelayFilter {
            location: exit_location.as_ref(),
            providers: &constraints.providers,
            ownership: &constraints.ownership,
            endpoint_type: RelayEndpointType::Wireguard,
            require_daita: false,
            require_ipv6: ipv6,
        };
        let daita = query.daita.enabled;

        let (exit, entry) = if wg.use_multihop {
            let entry_location = self.resolve(&wg.entry_location, NoMatchingRelay)?;
            let entry_filter = RelayFilter {
                location: entry_location.as_ref(),
                require_daita: daita,
                ..base
            };
            let (exit, entry) = self
                .pick_hops(&base, &entry_filter, rng)
                .ok_or(NoMatchingRelay)?;
            (exit, Some(entry))
        } else if daita {
            let daita_exit = RelayFilter {
                require_daita: true,
                ..base
            };
            match self.pick(&daita_exit, rng) {
                Some(exit) => (exit, None),
                None if query.daita.use_multihop_if_necessary => {
                    let entry_filter = RelayFilter {
                        location: None,
                        require_daita: true,
                        ..base
                    };
                    let (exit, entry) = self
                        .pick_hops(&base, &entry_filter, rng)
                        .ok_or(NoMatchingRelay)?;
                    debug!("Using DAITA entry {} in front of {}", entry.relay.hostname, exit.relay.hostname);
                    (exit, Some(entry))
                }
                None => return Err(NoMatchingRelay),
            }
        } else {
            (self.pick(&base, rng).ok_or(NoMatchingRelay)?, None)
        };

        let wireguard = query
            .wireguard
            .as_ref()
            .ok_or(ParameterGenerationError::NoWireguardKey)?;

        let ranges = &self.relay_list.wireguard.port_ranges;
        let port = match wg.port {
            Constraint::Only(port) if ranges.iter().any(|range| range.contains(port)) => port,
            Constraint::Only(_) => return Err(NoMatchingRelay),
            Constraint::Any => random_port_in_ranges(ranges, rng).ok_or(NoMatchingRelay)?,
        };

        let first_hop = entry.as_ref().unwrap_or(&exit);
        let obfuscation = self.select_obfuscation(query, first_hop, ipv6, rng)?;
        let plan_daita = daita && first_hop.relay.supports_daita();

        let exit = selected_relay(&exit, port, ipv6).ok_or(NoMatchingRelay)?;
        let entry = match entry {
            Some(entry) => Some(selected_relay(&entry, port, ipv6).ok_or(NoMatchingRelay)?),
            None => None,
        };

        Ok(WireguardPlan {
            exit,
            entry,
            obfuscation,
            daita: plan_daita,
            quantum_resistant: query.quantum_resistant,
            private_key: wireguard.private_key.clone(),
            tunnel_addresses: wireguard.addresses.clone(),
        })
    }

    fn select_obfuscation<R: Rng + ?Sized>(
        &self,
        query: &SelectorQuery,
        hop: &LocatedRelay<'_>,
        ipv6: bool,
        rng: &mut R,
    ) -> Result<Option<ObfuscationEndpoint>, ParameterGenerationError> {
        let Some(relay_addr) = hop.relay.address(ipv6) else {
            return Err(ParameterGenerationError::NoMatchingRelay);
        };
        let wireguard = &self.relay_list.wireguard;

        let endpoint = match &query.obfuscation {
            ObfuscationQuery::Off => return Ok(None),
            ObfuscationQuery::Udp2Tcp { port } => {
                let ports = &wireguard.udp2tcp_ports;
                let port = match port {
                    Constraint::Only(port) => ports.contains(port).then_some(*port),
                    Constraint::Any if ports.is_empty() => None,
                    Constraint::Any => ports.get(rng.gen_range(0..ports.len())).copied(),
                };
                port.map(|port| ObfuscationEndpoint {
                    endpoint: SocketAddr::new(relay_addr, port),
                    protocol: TransportProtocol::Tcp,
                    obfuscation_type: ObfuscationType::Udp2Tcp,
                })
            }
            ObfuscationQuery::Shadowsocks { port } => {
                // Extra addresses accept shadowsocks on every port
                let extra_addr = hop.relay.wireguard().and_then(|data| {
                    data.shadowsocks_extra_addr_in
                        .iter()
                        .find(|addr| addr.is_ipv6() == ipv6)
                        .copied()
                });
                let ranges = &wireguard.shadowsocks_port_ranges;
                let port = match port {
                    Constraint::Only(port)
                        if extra_addr.is_some()
                            || ranges.iter().any(|range| range.contains(*port)) =>
                    {
                        Some(*port)
                    }
                    Constraint::Only(_) => None,
                    Constraint::Any => random_port_in_ranges(ranges, rng),
                };
                port.map(|port| ObfuscationEndpoint {
                    endpoint: SocketAddr::new(extra_addr.unwrap_or(relay_addr), port),
                    protocol: TransportProtocol::Udp,
                    obfuscation_type: ObfuscationType::Shadowsocks,
                })
            }
        };

        match endpoint {
            Some(endpoint) => Ok(Some(endpoint)),
            None if query.obfuscation_is_fallback => {
                debug!("Relay list offers no {:?} endpoint, skipping obfuscation", query.obfuscation);
                Ok(None)
            }
            None => Err(ParameterGenerationError::NoMatchingRelay),
        }
    }

    fn select_openvpn<R: Rng + ?Sized>(
        &self,
        constraints: &RelayConstraints,
        query: &SelectorQuery,
        rng: &mut R,
    ) -> Result<OpenVpnPlan, ParameterGenerationError> {
        use ParameterGenerationError::{NoMatchingBridgeRelay, NoMatchingRelay};

        let location = self.resolve(&constraints.location, NoMatchingRelay)?;
        let filter = RelayFilter {
            location: location.as_ref(),
            providers: &constraints.providers,
            ownership: &constraints.ownership,
            endpoint_type: RelayEndpointType::Openvpn,
            require_daita: false,
            require_ipv6: false,
        };
        let exit = self.pick(&filter, rng).ok_or(NoMatchingRelay)?;

        let mut ports: Vec<&OpenVpnEndpoint> = self
            .relay_list
            .openvpn
            .ports
            .iter()
            .filter(|endpoint| match &constraints.openvpn_constraints.port {
                Constraint::Any => true,
                Constraint::Only(wanted) => {
                    wanted.protocol == endpoint.protocol && wanted.port.matches(&endpoint.port)
                }
            })
            .collect();
        if query.bridge.is_some() {
            ports.retain(|endpoint| endpoint.protocol == TransportProtocol::Tcp);
            if ports.is_empty() {
                return Err(NoMatchingBridgeRelay);
            }
        }
        let endpoint = **ports
            .get(rng.gen_range(0..ports.len().max(1)))
            .ok_or(NoMatchingRelay)?;

        let bridge = match &query.bridge {
            None => None,
            Some(bridge) => Some(self.select_bridge(bridge, rng)?),
        };

        Ok(OpenVpnPlan {
            exit: selected_relay(&exit, endpoint.port, false).ok_or(NoMatchingRelay)?,
            protocol: endpoint.protocol,
            bridge,
        })
    }

    fn select_bridge<R: Rng + ?Sized>(
        &self,
        bridge: &BridgeQuery,
        rng: &mut R,
    ) -> Result<BridgePlan, ParameterGenerationError> {
        use ParameterGenerationError::NoMatchingBridgeRelay;

        let constraints = match bridge {
            BridgeQuery::Custom(proxy) => return Ok(BridgePlan::Custom(proxy.clone())),
            BridgeQuery::Normal(constraints) => constraints,
        };
        let location = self.resolve(&constraints.location, NoMatchingBridgeRelay)?;
        let filter = RelayFilter {
            location: location.as_ref(),
            providers: &constraints.providers,
            ownership: &constraints.ownership,
            endpoint_type: RelayEndpointType::Bridge,
            require_daita: false,
            require_ipv6: false,
        };
        let relay = self.pick(&filter, rng).ok_or(NoMatchingBridgeRelay)?;

        let shadowsocks: Vec<_> = self
            .relay_list
            .bridge
            .shadowsocks
            .iter()
            .filter(|endpoint| endpoint.protocol == TransportProtocol::Tcp)
            .collect();
        let endpoint = shadowsocks
            .get(rng.gen_range(0..shadowsocks.len().max(1)))
            .ok_or(NoMatchingBridgeRelay)?;

        Ok(BridgePlan::Shadowsocks {
            hostname: relay.relay.hostname.clone(),
            location: relay.location,
            endpoint: SocketAddr::new(IpAddr::V4(relay.relay.ipv4_addr_in), endpoint.port),
            cipher: endpoint.cipher.clone(),
            password: endpoint.password.clone(),
        })
    }
}

fn selected_relay(located: &LocatedRelay<'_>, port: u16, ipv6: bool) -> Option<SelectedRelay> {
    let relay = located.relay;
    Some(SelectedRelay {
        hostname: relay.hostname.clone(),
        location: located.location.clone(),
        endpoint: SocketAddr::new(relay.address(ipv6)?, port),
        public_key: relay.wireguard().map(|data| data.public_key),
        overridden_ip: relay.overridden_ip,
        daita: relay.supports_daita(),
    })
}

/// Resolve the host of a custom endpoint. IP literals are returned as is.
pub async fn resolve_custom_endpoint(
    endpoint: &CustomTunnelEndpoint,
) -> Result<SocketAddr, ParameterGenerationError> {
    let port = endpoint.config.port();
    if let Ok(ip) = endpoint.host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((endpoint.host.as_str(), port))
        .await
        .map_err(|e| {
            warn!("Failed to resolve custom host {}: {}", endpoint.host, e);
            ParameterGenerationError::CustomTunnelHostResolutionError
        })?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or(ParameterGenerationError::CustomTunnelHostResolutionError)
}
