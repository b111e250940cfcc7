//! fOS IPC - Management channel of the VPN daemon
//!
//! Length-prefixed JSON over a Unix socket. The daemon binds an
//! [`IpcEndpoint`]; GUIs and CLIs talk to it through [`IpcClient`].

pub mod client;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod protocol;

pub use client::IpcClient;
pub use endpoint::IpcEndpoint;
pub use error::IpcError;
pub use protocol::{
    ClientMessage, DecodeError, ErrorCode, ManagementError, ManagementRequest, ManagementResponse,
    RequestId, ServerMessage,
};
