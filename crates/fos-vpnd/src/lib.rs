//! fOS VPN daemon
//!
//! Owns the user's VPN settings, drives the tunnel state machine and serves
//! the management socket.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐  requests   ┌─────────────────────────────────┐
//! │   sessions    │────────────▶│ Daemon (single control loop)    │
//! │ (one per      │◀────────────│  SettingsStore ─ Persistence    │
//! │  client)      │   events    │  TunnelStateMachine ─ Firewall  │
//! └───────────────┘             │  DeviceService, RelayList       │
//!         ▲                     └───────────────┬─────────────────┘
//!         │ watch snapshot                      │ start / abort
//!         └──────────────────────               ▼
//!                                       TunnelBackend (probe)
//! ```

pub mod backend;
pub mod broadcaster;
pub mod config;
pub mod daemon;
pub mod device_service;
pub mod persistence;
pub mod probe;
pub mod relay_fetcher;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tunnel_state_machine;

pub use config::DaemonConfig;
pub use daemon::{Daemon, DaemonError, DaemonHandle, DaemonOptions, DaemonParts};
pub use session::ManagementServer;
