//! Management sessions
//!
//! One task per connected client. Frames are read by a helper task so the
//! session can forward events while a request is still being received; the
//! session itself answers requests strictly in arrival order.

use crate::broadcaster::EventStream;
use crate::daemon::DaemonHandle;
use fos_ipc::codec::{read_frame, write_frame};
use fos_ipc::protocol::{
    ClientMessage, DecodeError, ErrorCode, ManagementError, ManagementRequest, ManagementResponse,
    ServerMessage,
};
use fos_ipc::{IpcEndpoint, IpcError};
use fos_vpn::events::DaemonEvent;
use std::path::Path;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Accepts clients on the management socket
pub struct ManagementServer {
    endpoint: IpcEndpoint,
    daemon: DaemonHandle,
    max_frame_size: usize,
}

impl ManagementServer {
    pub fn bind(
        path: impl AsRef<Path>,
        daemon: DaemonHandle,
        max_frame_size: usize,
    ) -> Result<Self, IpcError> {
        Ok(Self {
            endpoint: IpcEndpoint::bind(path)?,
            daemon,
            max_frame_size,
        })
    }

    pub fn path(&self) -> &Path {
        self.endpoint.path()
    }

    /// Accept clients until the task is dropped
    pub async fn run(self) {
        let mut next_session = 0u64;
        loop {
            match self.endpoint.accept().await {
                Ok(stream) => {
                    let session = Session {
                        id: next_session,
                        daemon: self.daemon.clone(),
                        max_frame_size: self.max_frame_size,
                        events: None,
                    };
                    next_session += 1;
                    tokio::spawn(session.run(stream));
                }
                Err(e) => error!("Failed to accept management client: {}", e),
            }
        }
    }
}

struct Session {
    id: u64,
    daemon: DaemonHandle,
    max_frame_size: usize,
    events: Option<EventStream>,
}

impl Session {
    async fn run(mut self, stream: UnixStream) {
        info!("Session {} opened", self.id);
        let (reader, mut writer) = stream.into_split();
        let (frame_tx, mut frames) = mpsc::channel(8);
        let reader_task = tokio::spawn(read_frames(reader, self.max_frame_size, frame_tx));

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        break;
                    };
                    let message = match frame {
                        Ok(body) => self.handle_frame(&body).await,
                        Err(e) => ServerMessage::Response {
                            id: None,
                            result: Err(ManagementError::new(ErrorCode::MalformedRequest, e.to_string())),
                        },
                    };
                    if let Err(e) = write_frame(&mut writer, &message).await {
                        debug!("Session {} write failed: {}", self.id, e);
                        break;
                    }
                }
                event = next_event(&mut self.events) => {
                    let Some(event) = event else {
                        warn!("Session {} lost its event subscription", self.id);
                        break;
                    };
                    if let Err(e) = write_frame(&mut writer, &ServerMessage::Event(event)).await {
                        debug!("Session {} write failed: {}", self.id, e);
                        break;
                    }
                }
            }
        }

        reader_task.abort();
        info!("Session {} closed", self.id);
    }

    async fn handle_frame(&mut self, body: &[u8]) -> ServerMessage {
        let ClientMessage { id, request } = match ClientMessage::decode(body) {
            Ok(message) => message,
            Err(DecodeError { id, error }) => {
                debug!("Session {}: {}", self.id, error);
                return ServerMessage::Response {
                    id,
                    result: Err(error),
                };
            }
        };

        let result = match request {
            ManagementRequest::SubscribeEvents => match self.daemon.subscribe().await {
                Ok((snapshot, events)) => {
                    self.events = Some(events);
                    Ok(ManagementResponse::Subscribed(Box::new(snapshot)))
                }
                Err(e) => Err(e.into()),
            },
            request => self.daemon.request(request).await,
        };
        ServerMessage::Response {
            id: Some(id),
            result,
        }
    }
}

/// Forward frames until the client hangs up. Oversized frames are reported
/// and skipped; any other read error ends the session.
async fn read_frames(
    mut reader: OwnedReadHalf,
    max_frame_size: usize,
    frames: mpsc::Sender<Result<Vec<u8>, IpcError>>,
) {
    loop {
        let frame = match read_frame(&mut reader, max_frame_size).await {
            Ok(Some(body)) => Ok(body),
            Ok(None) => return,
            Err(e @ IpcError::FrameTooLarge { .. }) => Err(e),
            Err(e) => {
                debug!("Management read failed: {}", e);
                return;
            }
        };
        if frames.send(frame).await.is_err() {
            return;
        }
    }
}

async fn next_event(events: &mut Option<EventStream>) -> Option<DaemonEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
