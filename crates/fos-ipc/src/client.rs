//! Management client

use crate::codec::{DEFAULT_MAX_FRAME_SIZE, read_frame, write_frame};
use crate::error::IpcError;
use crate::protocol::{ClientMessage, ManagementRequest, ManagementResponse, RequestId, ServerMessage};
use fos_vpn::events::{DaemonEvent, DaemonSnapshot};
use fos_vpn::settings::{Settings, SettingsUpdate};
use fos_vpn::states::TunnelState;
use std::collections::VecDeque;
use std::path::Path;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

/// Connection to a running daemon
///
/// Events that arrive while waiting for a response are queued and handed out
/// by [`IpcClient::next_event`] in arrival order.
pub struct IpcClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    next_id: RequestId,
    max_frame_size: usize,
    pending_events: VecDeque<DaemonEvent>,
}

impl IpcClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(socket_path.as_ref())
            .await
            .map_err(|e| IpcError::Connection(e.to_string()))?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer,
            next_id: 1,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            pending_events: VecDeque::new(),
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Send a request and wait for its response
    pub async fn request(&mut self, request: ManagementRequest) -> Result<ManagementResponse, IpcError> {
        let id = self.next_id;
        self.next_id += 1;
        write_frame(&mut self.writer, &ClientMessage { id, request }).await?;

        loop {
            match self.read_message().await?.ok_or(IpcError::Closed)? {
                ServerMessage::Event(event) => self.pending_events.push_back(event),
                ServerMessage::Response { id: Some(response_id), result } if response_id == id => {
                    return result.map_err(IpcError::Management);
                }
                ServerMessage::Response { id: other, .. } => {
                    return Err(IpcError::UnexpectedResponse(format!(
                        "expected response to {id}, got {other:?}"
                    )));
                }
            }
        }
    }

    /// Subscribe to daemon events. Returns the state at subscription time;
    /// later changes arrive through [`IpcClient::next_event`].
    pub async fn subscribe(&mut self) -> Result<DaemonSnapshot, IpcError> {
        match self.request(ManagementRequest::SubscribeEvents).await? {
            ManagementResponse::Subscribed(snapshot) => Ok(*snapshot),
            other => Err(unexpected(other)),
        }
    }

    /// Next event, or `None` once the daemon closed the connection
    pub async fn next_event(&mut self) -> Result<Option<DaemonEvent>, IpcError> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(Some(event));
        }
        loop {
            match self.read_message().await? {
                None => return Ok(None),
                Some(ServerMessage::Event(event)) => return Ok(Some(event)),
                Some(ServerMessage::Response { id, .. }) => {
                    debug!("Ignoring response {:?} while waiting for events", id);
                }
            }
        }
    }

    pub async fn get_tunnel_state(&mut self) -> Result<TunnelState, IpcError> {
        match self.request(ManagementRequest::GetTunnelState).await? {
            ManagementResponse::TunnelState(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_settings(&mut self) -> Result<Settings, IpcError> {
        match self.request(ManagementRequest::GetSettings).await? {
            ManagementResponse::Settings(settings) => Ok(settings),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_settings(&mut self, update: SettingsUpdate) -> Result<Settings, IpcError> {
        match self.request(ManagementRequest::UpdateSettings { update }).await? {
            ManagementResponse::Settings(settings) => Ok(settings),
            other => Err(unexpected(other)),
        }
    }

    pub async fn connect_tunnel(&mut self) -> Result<bool, IpcError> {
        self.tunnel_command(ManagementRequest::Connect).await
    }

    pub async fn disconnect_tunnel(&mut self) -> Result<bool, IpcError> {
        self.tunnel_command(ManagementRequest::Disconnect).await
    }

    pub async fn reconnect_tunnel(&mut self) -> Result<bool, IpcError> {
        self.tunnel_command(ManagementRequest::Reconnect).await
    }

    async fn tunnel_command(&mut self, request: ManagementRequest) -> Result<bool, IpcError> {
        match self.request(request).await? {
            ManagementResponse::StateChanged(changed) => Ok(changed),
            other => Err(unexpected(other)),
        }
    }

    async fn read_message(&mut self) -> Result<Option<ServerMessage>, IpcError> {
        match read_frame(&mut self.reader, self.max_frame_size).await? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

fn unexpected(response: ManagementResponse) -> IpcError {
    IpcError::UnexpectedResponse(format!("{response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::IpcEndpoint;
    use crate::protocol::{ErrorCode, ManagementError};
    use tempfile::tempdir;

    /// Answers every request with the disconnected state, preceded by an event
    async fn serve_one(endpoint: IpcEndpoint) {
        let stream = endpoint.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        while let Some(frame) = read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await.unwrap() {
            let message = match ClientMessage::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    let reply = ServerMessage::Response {
                        id: e.id,
                        result: Err(e.error),
                    };
                    write_frame(&mut writer, &reply).await.unwrap();
                    continue;
                }
            };
            let event = ServerMessage::Event(DaemonEvent::TunnelState(TunnelState::disconnected(false)));
            write_frame(&mut writer, &event).await.unwrap();

            let result = match message.request {
                ManagementRequest::GetTunnelState => {
                    Ok(ManagementResponse::TunnelState(TunnelState::disconnected(false)))
                }
                _ => Err(ManagementError::new(ErrorCode::Internal, "not here")),
            };
            let reply = ServerMessage::Response {
                id: Some(message.id),
                result,
            };
            write_frame(&mut writer, &reply).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_skips_and_queues_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.sock");
        let endpoint = IpcEndpoint::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(endpoint));

        let mut client = IpcClient::connect(&path).await.unwrap();
        let state = client.get_tunnel_state().await.unwrap();
        assert!(state.is_disconnected());

        let queued = client.next_event().await.unwrap();
        assert!(matches!(queued, Some(DaemonEvent::TunnelState(_))));

        let err = client.request(ManagementRequest::Connect).await.unwrap_err();
        assert!(matches!(
            err,
            IpcError::Management(ManagementError { code: ErrorCode::Internal, .. })
        ));

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_daemon_fails() {
        let dir = tempdir().unwrap();
        let result = IpcClient::connect(dir.path().join("missing.sock")).await;
        assert!(matches!(result, Err(IpcError::Connection(_))));
    }
}
