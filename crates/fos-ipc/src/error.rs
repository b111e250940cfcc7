//! IPC error types

use crate::protocol::ManagementError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to bind {path}: {reason}")]
    Bind { path: String, reason: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed")]
    Closed,

    #[error("Daemon returned an error: {0}")]
    Management(ManagementError),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl IpcError {
    /// Errors after which the stream is no longer usable
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            IpcError::FrameTooLarge { .. } | IpcError::Management(_) | IpcError::UnexpectedResponse(_)
        )
    }
}
