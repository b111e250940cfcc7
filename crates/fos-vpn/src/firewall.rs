//! Firewall Policy
//!
//! Describes which traffic may leave the machine for each tunnel state and
//! hands that description to a [`Firewall`] implementation.
//!
//! # Policies
//!
//! | Tunnel state | Policy |
//! |--------------|--------|
//! | Connecting | only the relay endpoint (plus LAN if allowed) |
//! | Connected | relay endpoint and tunnel |
//! | Disconnecting, Error | block everything |
//! | Disconnected | block if lockdown is on, otherwise no policy |
//!
//! [`SoftFirewall`] is an in-process kill switch: it never touches system
//! routing tables, it just answers whether a destination is allowed. Loopback
//! traffic is always allowed.

use crate::constraints::TransportProtocol;
use crate::states::FirewallPolicyError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// A single endpoint that stays reachable while blocking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedEndpoint {
    pub address: SocketAddr,
    pub protocol: TransportProtocol,
}

impl fmt::Display for AllowedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallPolicy {
    /// Tunnel is being established
    Connecting {
        peer_endpoint: AllowedEndpoint,
        allow_lan: bool,
    },
    /// Tunnel is up
    Connected {
        peer_endpoint: AllowedEndpoint,
        allow_lan: bool,
    },
    /// No tunnel and no leaks
    Blocked { allow_lan: bool },
}

impl FirewallPolicy {
    pub fn allow_lan(&self) -> bool {
        match self {
            FirewallPolicy::Connecting { allow_lan, .. }
            | FirewallPolicy::Connected { allow_lan, .. }
            | FirewallPolicy::Blocked { allow_lan } => *allow_lan,
        }
    }

    /// Is traffic to `destination` permitted under this policy?
    pub fn allows(&self, destination: IpAddr) -> bool {
        if destination.is_loopback() || (self.allow_lan() && is_lan(destination)) {
            return true;
        }
        match self {
            FirewallPolicy::Connecting { peer_endpoint, .. } => {
                peer_endpoint.address.ip() == destination
            }
            FirewallPolicy::Connected { .. } => true,
            FirewallPolicy::Blocked { .. } => false,
        }
    }
}

impl fmt::Display for FirewallPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallPolicy::Connecting { peer_endpoint, .. } => {
                write!(f, "connecting to {peer_endpoint}")
            }
            FirewallPolicy::Connected { peer_endpoint, .. } => {
                write!(f, "connected to {peer_endpoint}")
            }
            FirewallPolicy::Blocked { .. } => f.write_str("blocked"),
        }
    }
}

/// Private, link-local and multicast destinations
pub fn is_lan(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.is_multicast(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            // fe80::/10 link-local, fc00::/7 unique local
            (first & 0xffc0) == 0xfe80 || (first & 0xfe00) == 0xfc00 || v6.is_multicast()
        }
    }
}

/// Enforces firewall policies
pub trait Firewall: Send {
    fn apply_policy(&mut self, policy: FirewallPolicy) -> Result<(), FirewallPolicyError>;

    /// Remove any policy and let all traffic through
    fn reset_policy(&mut self) -> Result<(), FirewallPolicyError>;
}

#[derive(Debug, Default)]
struct SoftFirewallState {
    policy: Option<FirewallPolicy>,
    lock_holder: Option<(u32, String)>,
}

/// In-process firewall
///
/// Clones share state, so one clone can be handed to the tunnel state
/// machine while others check destinations.
///
/// ```rust,ignore
/// let firewall = SoftFirewall::new();
///
/// // Before making a network request:
/// if !firewall.allows(addr.ip()) {
///     return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "blocked"));
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct SoftFirewall {
    state: Arc<RwLock<SoftFirewallState>>,
}

impl SoftFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently enforced policy
    pub fn policy(&self) -> Option<FirewallPolicy> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .policy
            .clone()
    }

    /// Check a destination against the current policy
    pub fn allows(&self, destination: IpAddr) -> bool {
        self.policy()
            .is_none_or(|policy| policy.allows(destination))
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self.policy(), Some(FirewallPolicy::Blocked { .. }))
    }

    /// Mark the firewall as owned by another process. Policy changes fail
    /// until [`SoftFirewall::unlock`] is called.
    pub fn lock_by(&self, pid: u32, name: impl Into<String>) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .lock_holder = Some((pid, name.into()));
    }

    pub fn unlock(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .lock_holder = None;
    }

    fn set(&self, policy: Option<FirewallPolicy>) -> Result<(), FirewallPolicyError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((pid, name)) = &state.lock_holder {
            warn!("Firewall locked by {} (pid {}), policy not applied", name, pid);
            return Err(FirewallPolicyError::Locked {
                lock_pid: Some(*pid),
                lock_name: Some(name.clone()),
            });
        }
        state.policy = policy;
        Ok(())
    }
}

impl Firewall for SoftFirewall {
    fn apply_policy(&mut self, policy: FirewallPolicy) -> Result<(), FirewallPolicyError> {
        debug!("Applying firewall policy: {}", policy);
        self.set(Some(policy))
    }

    fn reset_policy(&mut self) -> Result<(), FirewallPolicyError> {
        debug!("Resetting firewall policy");
        self.set(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> AllowedEndpoint {
        AllowedEndpoint {
            address: "185.213.154.66:51820".parse().unwrap(),
            protocol: TransportProtocol::Udp,
        }
    }

    #[test]
    fn test_no_policy_allows_everything() {
        let firewall = SoftFirewall::new();
        assert!(firewall.allows("8.8.8.8".parse().unwrap()));
        assert!(!firewall.is_blocking());
    }

    #[test]
    fn test_connecting_allows_only_relay() {
        let mut firewall = SoftFirewall::new();
        firewall
            .apply_policy(FirewallPolicy::Connecting {
                peer_endpoint: endpoint(),
                allow_lan: false,
            })
            .unwrap();

        assert!(firewall.allows("185.213.154.66".parse().unwrap()));
        assert!(!firewall.allows("8.8.8.8".parse().unwrap()));
        assert!(!firewall.allows("192.168.1.1".parse().unwrap()));
        assert!(firewall.allows("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_blocked_with_lan() {
        let mut firewall = SoftFirewall::new();
        firewall
            .apply_policy(FirewallPolicy::Blocked { allow_lan: true })
            .unwrap();

        assert!(firewall.is_blocking());
        assert!(firewall.allows("192.168.1.1".parse().unwrap()));
        assert!(firewall.allows("fe80::1".parse().unwrap()));
        assert!(!firewall.allows("1.1.1.1".parse().unwrap()));
    }

    #[test]
    fn test_locked_firewall_rejects_policy() {
        let mut firewall = SoftFirewall::new();
        firewall.lock_by(4242, "other-vpn");

        let result = firewall.apply_policy(FirewallPolicy::Blocked { allow_lan: false });
        assert_eq!(
            result,
            Err(FirewallPolicyError::Locked {
                lock_pid: Some(4242),
                lock_name: Some("other-vpn".into()),
            })
        );
        assert_eq!(firewall.policy(), None);

        firewall.unlock();
        assert!(firewall.reset_policy().is_ok());
    }

    #[test]
    fn test_clones_share_policy() {
        let mut firewall = SoftFirewall::new();
        let observer = firewall.clone();
        firewall
            .apply_policy(FirewallPolicy::Blocked { allow_lan: false })
            .unwrap();

        assert!(observer.is_blocking());
    }
}
