//! Management Protocol
//!
//! Message shapes exchanged between the daemon and its clients.
//!
//! # Message Format
//!
//! All frames are length-prefixed JSON (see [`crate::codec`]).
//!
//! ```text
//! client → daemon   {"id": 7, "request": {"type": "connect"}}
//! daemon → client   {"type": "response", "data": {"id": 7, "result": {"Ok": {...}}}}
//! daemon → client   {"type": "event", "data": {"type": "tunnel_state", "data": {...}}}
//! ```
//!
//! Responses carry the id of the request they answer. Events are only sent
//! on connections that subscribed.

use fos_vpn::access_method::{AccessMethod, AccessMethodId};
use fos_vpn::constraints::GeographicLocationConstraint;
use fos_vpn::custom_list::CustomListId;
use fos_vpn::device::{AccountNumber, DeviceId, DeviceInfo, DeviceState};
use fos_vpn::events::{AppVersionInfo, DaemonEvent, DaemonSnapshot};
use fos_vpn::relay_list::RelayList;
use fos_vpn::settings::{Settings, SettingsError, SettingsUpdate};
use fos_vpn::states::TunnelState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type RequestId = u64;

/// One request from a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub id: RequestId,
    pub request: ManagementRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagementRequest {
    GetTunnelState,
    GetSettings,
    GetRelayList,
    GetVersionInfo,
    GetDevice,
    Connect,
    Disconnect,
    Reconnect,
    SubscribeEvents,
    UpdateSettings {
        update: SettingsUpdate,
    },
    CreateCustomList {
        name: String,
        #[serde(default)]
        locations: Vec<GeographicLocationConstraint>,
    },
    AddAccessMethod {
        name: String,
        enabled: bool,
        access_method: AccessMethod,
    },
    LoginAccount {
        account_number: AccountNumber,
    },
    LogoutAccount,
    RotateWireguardKey,
    ListDevices {
        account_number: AccountNumber,
    },
    RemoveDevice {
        account_number: AccountNumber,
        device_id: DeviceId,
    },
}

impl ManagementRequest {
    /// Every `type` tag the daemon understands
    pub const TYPES: &'static [&'static str] = &[
        "get_tunnel_state",
        "get_settings",
        "get_relay_list",
        "get_version_info",
        "get_device",
        "connect",
        "disconnect",
        "reconnect",
        "subscribe_events",
        "update_settings",
        "create_custom_list",
        "add_access_method",
        "login_account",
        "logout_account",
        "rotate_wireguard_key",
        "list_devices",
        "remove_device",
    ];

    /// Queries that can be answered from a snapshot
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            ManagementRequest::GetTunnelState
                | ManagementRequest::GetSettings
                | ManagementRequest::GetRelayList
                | ManagementRequest::GetVersionInfo
                | ManagementRequest::GetDevice
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ManagementResponse {
    Ok,
    /// Whether a tunnel command changed anything
    StateChanged(bool),
    TunnelState(TunnelState),
    Settings(Settings),
    RelayList(RelayList),
    VersionInfo(AppVersionInfo),
    Device(DeviceState),
    Devices(Vec<DeviceInfo>),
    CustomListCreated(CustomListId),
    AccessMethodAdded(AccessMethodId),
    Subscribed(Box<DaemonSnapshot>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Response {
        /// `None` when the request was too broken to carry an id
        id: Option<RequestId>,
        result: Result<ManagementResponse, ManagementError>,
    },
    Event(DaemonEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedRequest,
    UnknownRequest,
    InvalidSettings,
    UnknownCustomList,
    DeviceService,
    DaemonUnavailable,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::MalformedRequest => "malformed request",
            ErrorCode::UnknownRequest => "unknown request",
            ErrorCode::InvalidSettings => "invalid settings",
            ErrorCode::UnknownCustomList => "unknown custom list",
            ErrorCode::DeviceService => "device service error",
            ErrorCode::DaemonUnavailable => "daemon unavailable",
            ErrorCode::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Structured error returned instead of a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ManagementError {
    pub code: ErrorCode,
    pub message: String,
}

impl ManagementError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<SettingsError> for ManagementError {
    fn from(error: SettingsError) -> Self {
        let code = match &error {
            SettingsError::UnknownCustomList(_) => ErrorCode::UnknownCustomList,
            SettingsError::Persist(_) => ErrorCode::Internal,
            _ => ErrorCode::InvalidSettings,
        };
        Self::new(code, error.to_string())
    }
}

/// A frame that could not be turned into a [`ClientMessage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub id: Option<RequestId>,
    pub error: ManagementError,
}

impl ClientMessage {
    /// Decode a frame body.
    ///
    /// Unknown request types are reported as [`ErrorCode::UnknownRequest`]
    /// with the client's id; anything else that fails to parse is
    /// [`ErrorCode::MalformedRequest`].
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(frame).map_err(|e| DecodeError {
            id: None,
            error: ManagementError::new(ErrorCode::MalformedRequest, format!("invalid JSON: {e}")),
        })?;
        let id = value.get("id").and_then(Value::as_u64);

        let request_type = value
            .get("request")
            .and_then(|request| request.get("type"))
            .and_then(Value::as_str);
        if let Some(request_type) = request_type {
            if !ManagementRequest::TYPES.contains(&request_type) {
                return Err(DecodeError {
                    id,
                    error: ManagementError::new(
                        ErrorCode::UnknownRequest,
                        format!("unknown request type: {request_type}"),
                    ),
                });
            }
        }

        serde_json::from_value(value).map_err(|e| DecodeError {
            id,
            error: ManagementError::new(ErrorCode::MalformedRequest, e.to_string()),
        })
    }
}
