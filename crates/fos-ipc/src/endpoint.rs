//! Unix socket endpoint
//!
//! The daemon side of the management channel. Binding creates the parent
//! directory, replaces a stale socket file left by a crashed daemon and opens
//! the socket to local clients. The socket file is removed again when the
//! endpoint is dropped.

use crate::error::IpcError;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Permissions of the socket file
pub const SOCKET_MODE: u32 = 0o766;

pub struct IpcEndpoint {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcEndpoint {
    /// Bind a listening socket at `path`. Must be called inside a tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let path = path.as_ref().to_path_buf();
        let bind_error = |reason: String| IpcError::Bind {
            path: path.display().to_string(),
            reason,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| bind_error(format!("Failed to create parent directory: {e}")))?;
            }
        }

        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                return Err(bind_error("Another daemon is listening".into()));
            }
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(&path)
                .map_err(|e| bind_error(format!("Failed to remove existing socket: {e}")))?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| bind_error(e.to_string()))?;

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(|e| bind_error(format!("Failed to set permissions: {e}")))?;

        info!("Management socket listening on {}", path.display());
        Ok(Self { listener, path })
    }

    pub async fn accept(&self) -> Result<UnixStream, IpcError> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IpcEndpoint {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove socket {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_socket_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run").join("fos-vpnd.sock");

        let endpoint = IpcEndpoint::bind(&path).unwrap();
        assert!(path.exists());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, SOCKET_MODE);

        drop(endpoint);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fos-vpnd.sock");
        std::fs::write(&path, b"stale").unwrap();

        let endpoint = IpcEndpoint::bind(&path).unwrap();
        assert_eq!(endpoint.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_live_socket_is_not_stolen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fos-vpnd.sock");
        let _first = IpcEndpoint::bind(&path).unwrap();

        assert!(matches!(IpcEndpoint::bind(&path), Err(IpcError::Bind { .. })));
        assert!(path.exists());
    }
}
