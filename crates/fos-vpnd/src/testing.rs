//! Test doubles
//!
//! A scripted tunnel backend and small fixtures used by the unit tests and
//! the integration tests under `tests/`.

use crate::backend::{
    AttemptFailure, AttemptHandle, AttemptId, BackendEvent, BackendEventSender, BackendMessage,
    TunnelBackend, TunnelMetadata,
};
use fos_vpn::constraints::TransportProtocol;
use fos_vpn::device::{AccountAndDevice, Device, DeviceState, WireguardData};
use fos_vpn::keys::PrivateKey;
use fos_vpn::relay_list::{
    BridgeEndpointData, OpenVpnEndpoint, OpenVpnEndpointData, Relay, RelayEndpointData,
    RelayList, RelayListCity, RelayListCountry, WireguardEndpointData,
    WireguardRelayEndpointData,
};
use fos_vpn::selector::ConnectionPlan;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Script {
    starts: Vec<(AttemptId, ConnectionPlan)>,
    aborts: Vec<AttemptId>,
    events: Option<BackendEventSender>,
    down_on_abort: bool,
}

/// Backend that does nothing on its own
///
/// Every `start` is recorded and the test decides what the "tunnel" reports.
/// Clones share the same script, so a test keeps one clone while the state
/// machine or daemon owns another.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                starts: Vec::new(),
                aborts: Vec::new(),
                events: None,
                down_on_abort: true,
            })),
        }
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop reporting `Down` after an abort, so the test sends it itself
    pub fn silent_aborts(&self) {
        self.lock().down_on_abort = false;
    }

    pub fn starts(&self) -> Vec<(AttemptId, ConnectionPlan)> {
        self.lock().starts.clone()
    }

    pub fn started(&self) -> Vec<AttemptId> {
        self.lock().starts.iter().map(|(id, _)| *id).collect()
    }

    pub fn aborted(&self) -> Vec<AttemptId> {
        self.lock().aborts.clone()
    }

    pub fn last_attempt(&self) -> Option<AttemptId> {
        self.lock().starts.last().map(|(id, _)| *id)
    }

    pub fn last_plan(&self) -> Option<ConnectionPlan> {
        self.lock().starts.last().map(|(_, plan)| plan.clone())
    }

    /// Report `event` for `attempt`. False if nothing is listening.
    pub fn send(&self, attempt: AttemptId, event: BackendEvent) -> bool {
        let events = self.lock().events.clone();
        events.is_some_and(|events| events.send(BackendMessage { attempt, event }).is_ok())
    }

    /// Bring the latest attempt up
    pub fn up(&self) -> bool {
        self.send_latest(BackendEvent::Up(TunnelMetadata {
            interface: "scripted0".into(),
            endpoint: None,
        }))
    }

    pub fn down(&self) -> bool {
        self.send_latest(BackendEvent::Down)
    }

    pub fn fail(&self, failure: AttemptFailure) -> bool {
        self.send_latest(BackendEvent::Failed(failure))
    }

    fn send_latest(&self, event: BackendEvent) -> bool {
        match self.last_attempt() {
            Some(attempt) => self.send(attempt, event),
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TunnelBackend for ScriptedBackend {
    fn start(&mut self, id: AttemptId, plan: ConnectionPlan, events: BackendEventSender) -> AttemptHandle {
        let mut script = self.lock();
        script.starts.push((id, plan));
        script.events = Some(events);
        AttemptHandle::new(id)
    }

    fn abort(&mut self, handle: AttemptHandle) {
        let mut script = self.lock();
        script.aborts.push(handle.id());
        if script.down_on_abort {
            if let Some(events) = &script.events {
                let _ = events.send(BackendMessage {
                    attempt: handle.id(),
                    event: BackendEvent::Down,
                });
            }
        }
    }
}

fn relay(hostname: &str, last_octet: u8, endpoint_data: RelayEndpointData) -> Relay {
    Relay {
        hostname: hostname.into(),
        ipv4_addr_in: Ipv4Addr::new(185, 213, 154, last_octet),
        ipv6_addr_in: None,
        provider: "31173".into(),
        weight: 1,
        active: true,
        owned: true,
        overridden_ip: false,
        endpoint_data,
    }
}

/// One WireGuard and one OpenVPN relay in Gothenburg, Sweden
pub fn sample_relay_list() -> RelayList {
    let wireguard = relay(
        "se-got-wg-001",
        66,
        RelayEndpointData::Wireguard(WireguardRelayEndpointData {
            public_key: PrivateKey::from_bytes([0x11; 32]).public_key(),
            daita: false,
            shadowsocks_extra_addr_in: Vec::new(),
        }),
    );
    let openvpn = relay("se-got-ovpn-001", 67, RelayEndpointData::Openvpn);

    RelayList {
        etag: Some("sample".into()),
        countries: vec![RelayListCountry {
            name: "Sweden".into(),
            code: "se".into(),
            cities: vec![RelayListCity {
                name: "Gothenburg".into(),
                code: "got".into(),
                latitude: 57.70887,
                longitude: 11.97456,
                relays: vec![wireguard, openvpn],
            }],
        }],
        openvpn: OpenVpnEndpointData {
            ports: vec![
                OpenVpnEndpoint {
                    port: 1194,
                    protocol: TransportProtocol::Udp,
                },
                OpenVpnEndpoint {
                    port: 443,
                    protocol: TransportProtocol::Tcp,
                },
            ],
        },
        wireguard: WireguardEndpointData::default(),
        bridge: BridgeEndpointData::default(),
    }
}

pub fn logged_in_device() -> DeviceState {
    DeviceState::LoggedIn(AccountAndDevice {
        account_number: "1234123412341234".into(),
        device: Device {
            id: "device-1".into(),
            name: "quiet otter".into(),
            wireguard: WireguardData {
                private_key: PrivateKey::from_bytes([0x22; 32]),
                addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2))],
                created: 0,
            },
        },
    })
}
