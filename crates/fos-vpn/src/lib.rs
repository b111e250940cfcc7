//! fOS VPN - Tunnel, relay and settings model
//!
//! Value types and pure logic shared by the daemon (`fos-vpnd`) and its
//! management clients (`fos-ipc`).
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌────────────────┐
//! │  Settings  │──▶│ SelectorQuery│──▶│ RelaySelector  │
//! │ (validated)│   │ (per attempt)│   │ (+ RelayList)  │
//! └────────────┘   └──────────────┘   └───────┬────────┘
//!                                             │
//!                                             ▼
//!                                     ┌────────────────┐
//!                                     │ ConnectionPlan │──▶ TunnelState
//!                                     └────────────────┘    FirewallPolicy
//! ```
//!
//! # Modules
//!
//! - **constraints**: `Constraint<T>` and relay/location constraints
//! - **relay_list**: relay inventory and overrides
//! - **selector**: weighted relay selection and retry fallbacks
//! - **settings**: user settings, updates and validation
//! - **states**: tunnel states, error causes, feature indicators
//! - **firewall**: per-state firewall policy and an in-process kill switch
//! - **device** / **events**: account data shapes and daemon events

pub mod access_method;
pub mod constraints;
pub mod custom_list;
pub mod device;
pub mod events;
pub mod firewall;
pub mod keys;
pub mod relay_list;
pub mod selector;
pub mod settings;
pub mod states;

pub use constraints::{Constraint, RelayConstraints, RelaySettings, TransportProtocol, TunnelType};
pub use events::{AppVersionInfo, DaemonEvent, DaemonSnapshot};
pub use firewall::{Firewall, FirewallPolicy, SoftFirewall};
pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use relay_list::RelayList;
pub use selector::{ConnectionPlan, RelaySelector, SelectorQuery};
pub use settings::{Settings, SettingsError, SettingsUpdate};
pub use states::{ErrorState, ErrorStateCause, TunnelState};
