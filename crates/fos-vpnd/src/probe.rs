//! Handshake probe backend
//!
//! Userspace backend that proves the first hop answers: it sends a protocol
//! handshake and reports the tunnel up on a well formed reply. No packets
//! are forwarded.
//!
//! | First hop | Probe |
//! |-----------|-------|
//! | WireGuard over UDP | handshake initiation, expects a handshake response |
//! | OpenVPN over UDP | `P_CONTROL_HARD_RESET_CLIENT_V2`, expects the server reset |
//! | anything over TCP | TCP connect |

use crate::backend::{
    AttemptFailure, AttemptHandle, AttemptId, BackendEvent, BackendEventSender, BackendMessage,
    TunnelBackend, TunnelMetadata,
};
use fos_vpn::constraints::{TransportProtocol, TunnelType};
use fos_vpn::keys::KeyPair;
use fos_vpn::selector::{ConnectionPlan, resolve_custom_endpoint};
use fos_vpn::states::{ErrorStateCause, TunnelEndpoint};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

const WG_HANDSHAKE_INIT: u8 = 0x01;
const WG_HANDSHAKE_RESPONSE: u8 = 0x02;
const WG_INIT_LEN: usize = 148;
const WG_MIN_RESPONSE_LEN: usize = 60;

const OPENVPN_HARD_RESET_CLIENT_V2: u8 = 7;
const OPENVPN_HARD_RESET_SERVER_V2: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Handshake timeout")]
    Timeout,

    #[error("Invalid handshake response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub struct ProbeBackend {
    handshake_timeout: Duration,
    events: Option<BackendEventSender>,
}

impl Default for ProbeBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProbeBackend {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self {
            handshake_timeout,
            events: None,
        }
    }
}

impl TunnelBackend for ProbeBackend {
    fn start(&mut self, id: AttemptId, plan: ConnectionPlan, events: BackendEventSender) -> AttemptHandle {
        let timeout = self.handshake_timeout;
        self.events = Some(events.clone());
        let task = tokio::spawn(async move {
            let send = |event| events.send(BackendMessage { attempt: id, event }).is_ok();
            let event = run_probe(&plan, timeout, send).await;
            if !send(event) {
                debug!("Attempt {} finished after the daemon stopped", id);
            }
        });
        AttemptHandle::with_task(id, task.abort_handle())
    }

    fn abort(&mut self, handle: AttemptHandle) {
        debug!("Aborting attempt {}", handle.id());
        handle.cancel();
        // Nothing to tear down, the probe socket closes with the task
        if let Some(events) = &self.events {
            let _ = events.send(BackendMessage {
                attempt: handle.id(),
                event: BackendEvent::Down,
            });
        }
    }
}

/// Run one attempt and return its final event. Intermediate events go
/// through `send`.
async fn run_probe(
    plan: &ConnectionPlan,
    timeout: Duration,
    send: impl Fn(BackendEvent) -> bool,
) -> BackendEvent {
    let endpoint = match plan_endpoint(plan).await {
        Ok(endpoint) => endpoint,
        Err(cause) => return BackendEvent::Failed(AttemptFailure::Fatal(cause)),
    };
    if plan.tunnel_endpoint().is_none() {
        send(BackendEvent::Resolved(endpoint.address));
    }
    let (addr, protocol) = endpoint.first_hop();
    info!("Probing {} over {}", addr, protocol);

    let result = match (endpoint.tunnel_type, protocol) {
        (_, TransportProtocol::Tcp) => tcp_probe(addr, timeout).await,
        (TunnelType::Wireguard, TransportProtocol::Udp) => {
            udp_probe(addr, &build_handshake_init(), timeout, check_wireguard_response).await
        }
        (TunnelType::OpenVpn, TransportProtocol::Udp) => {
            udp_probe(addr, &build_openvpn_reset(), timeout, check_openvpn_response).await
        }
    };

    match result {
        Ok(()) => {
            info!("Handshake with {} completed", addr);
            BackendEvent::Up(TunnelMetadata {
                interface: "probe".into(),
                endpoint: Some(endpoint),
            })
        }
        Err(e) => {
            warn!("Probe of {} failed: {}", addr, e);
            BackendEvent::Failed(AttemptFailure::Transient(ErrorStateCause::StartTunnelError))
        }
    }
}

async fn plan_endpoint(plan: &ConnectionPlan) -> Result<TunnelEndpoint, ErrorStateCause> {
    if let Some(endpoint) = plan.tunnel_endpoint() {
        return Ok(endpoint);
    }
    let ConnectionPlan::Custom(custom) = plan else {
        return Err(ErrorStateCause::StartTunnelError);
    };
    let address = resolve_custom_endpoint(&custom.endpoint)
        .await
        .map_err(|error| ErrorStateCause::TunnelParameterError { error })?;
    Ok(TunnelEndpoint {
        address,
        protocol: custom.endpoint.config.protocol(),
        tunnel_type: custom.endpoint.config.tunnel_type(),
        entry_endpoint: None,
        obfuscation: None,
        proxy: None,
        daita: false,
    })
}

async fn tcp_probe(addr: SocketAddr, timeout: Duration) -> Result<(), ProbeError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(ProbeError::Socket(e.to_string())),
        Err(_) => Err(ProbeError::Timeout),
    }
}

async fn udp_probe(
    addr: SocketAddr,
    request: &[u8],
    timeout: Duration,
    check: fn(&[u8]) -> Result<(), ProbeError>,
) -> Result<(), ProbeError> {
    let bind: SocketAddr = if addr.is_ipv6() {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| ProbeError::Socket(e.to_string()))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| ProbeError::Socket(e.to_string()))?;
    socket
        .send(request)
        .await
        .map_err(|e| ProbeError::Socket(e.to_string()))?;

    let mut response = [0u8; 256];
    match tokio::time::timeout(timeout, socket.recv(&mut response)).await {
        Ok(Ok(n)) => check(&response[..n]),
        Ok(Err(e)) => Err(ProbeError::Socket(e.to_string())),
        Err(_) => Err(ProbeError::Timeout),
    }
}

/// Build a WireGuard handshake initiation
///
/// Format (148 bytes):
/// - Type (1 byte): 0x01 = handshake initiation
/// - Reserved (3 bytes): 0x000000
/// - Sender index (4 bytes)
/// - Ephemeral public key (32 bytes)
/// - Encrypted static key, timestamp, MAC1, MAC2 (108 bytes, zeroed)
pub fn build_handshake_init() -> Vec<u8> {
    let mut msg = Vec::with_capacity(WG_INIT_LEN);
    msg.push(WG_HANDSHAKE_INIT);
    msg.extend_from_slice(&[0x00, 0x00, 0x00]);

    let sender_index: u32 = rand::random();
    msg.extend_from_slice(&sender_index.to_le_bytes());

    let ephemeral = KeyPair::generate();
    msg.extend_from_slice(&ephemeral.public.to_bytes());

    msg.extend_from_slice(&[0u8; 108]); // 48 + 28 + 16 + 16
    msg
}

fn check_wireguard_response(response: &[u8]) -> Result<(), ProbeError> {
    if response.len() < WG_MIN_RESPONSE_LEN {
        return Err(ProbeError::InvalidResponse(format!("{} bytes", response.len())));
    }
    if response[0] != WG_HANDSHAKE_RESPONSE {
        return Err(ProbeError::InvalidResponse(format!("type {:#04x}", response[0])));
    }
    Ok(())
}

/// Build an OpenVPN client hard reset: opcode/key id, session id, empty ack
/// array, packet id 0
pub fn build_openvpn_reset() -> Vec<u8> {
    let mut msg = Vec::with_capacity(14);
    msg.push(OPENVPN_HARD_RESET_CLIENT_V2 << 3);
    let session_id: u64 = rand::random();
    msg.extend_from_slice(&session_id.to_be_bytes());
    msg.push(0);
    msg.extend_from_slice(&0u32.to_be_bytes());
    msg
}

fn check_openvpn_response(response: &[u8]) -> Result<(), ProbeError> {
    match response.first() {
        Some(byte) if byte >> 3 == OPENVPN_HARD_RESET_SERVER_V2 => Ok(()),
        Some(byte) => Err(ProbeError::InvalidResponse(format!("opcode {}", byte >> 3))),
        None => Err(ProbeError::InvalidResponse("empty".into())),
    }
}
