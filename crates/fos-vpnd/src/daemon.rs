//! Daemon control loop
//!
//! A single task owns the settings, tunnel state, device state and relay
//! list. Everything that mutates them arrives as a [`DaemonCommand`] and is
//! handled to completion before the next one, so a settings change can never
//! land halfway through a reconnect.
//!
//! ```text
//!  sessions ──DaemonCommand──▶ ┌──────────────┐ ──DaemonEvent──▶ subscribers
//!  relay updater ────────────▶ │ control loop │
//!  backend ──BackendMessage──▶ └──────┬───────┘
//!                                     │ watch
//!                                     ▼
//!                              read-only queries
//! ```

use crate::backend::{AttemptId, BackendEventReceiver, TunnelBackend};
use crate::broadcaster::{EventBroadcaster, EventStream};
use crate::config::DaemonConfig;
use crate::device_service::{DeviceService, DeviceServiceError};
use crate::persistence::Persistence;
use crate::store::SettingsStore;
use crate::tunnel_state_machine::{RetryPolicy, TunnelContext, TunnelInput, TunnelStateMachine};
use fos_ipc::protocol::{ErrorCode, ManagementError, ManagementRequest, ManagementResponse};
use fos_vpn::access_method::AccessMethodSetting;
use fos_vpn::custom_list::CustomList;
use fos_vpn::device::{
    AccountAndDevice, DeviceEvent, DeviceEventCause, DeviceState, RemoveDeviceEvent,
};
use fos_vpn::events::{AppVersionInfo, DaemonEvent, DaemonSnapshot};
use fos_vpn::firewall::Firewall;
use fos_vpn::relay_list::RelayList;
use fos_vpn::settings::{Settings, SettingsUpdate};
use fos_vpn::states::TunnelState;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type Reply = oneshot::Sender<Result<ManagementResponse, ManagementError>>;

#[derive(Debug)]
pub enum DaemonCommand {
    Request {
        request: ManagementRequest,
        reply: Reply,
    },
    Subscribe {
        reply: oneshot::Sender<(DaemonSnapshot, EventStream)>,
    },
    UpdateRelayList(RelayList),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DaemonError {
    #[error("Daemon is not running")]
    Stopped,
}

impl From<DaemonError> for ManagementError {
    fn from(error: DaemonError) -> Self {
        ManagementError::new(ErrorCode::DaemonUnavailable, error.to_string())
    }
}

impl From<DeviceServiceError> for ManagementError {
    fn from(error: DeviceServiceError) -> Self {
        ManagementError::new(ErrorCode::DeviceService, error.to_string())
    }
}

/// Tunables of the control loop
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub retry: RetryPolicy,
    pub subscriber_buffer: usize,
    pub command_buffer: usize,
    /// Seed for relay selection; random when `None`
    pub seed: Option<u64>,
    pub version: String,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            subscriber_buffer: 256,
            command_buffer: 64,
            seed: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl DaemonOptions {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: config.max_connect_attempts,
                attempt_timeout: config.attempt_timeout(),
            },
            subscriber_buffer: config.subscriber_buffer,
            command_buffer: config.command_buffer,
            ..Self::default()
        }
    }
}

/// Collaborators the daemon is built from
pub struct DaemonParts<B, F, P, D> {
    pub backend: B,
    pub firewall: F,
    pub persistence: P,
    pub devices: D,
    pub relay_list: RelayList,
}

pub struct Daemon<B, F, P, D> {
    store: SettingsStore<P>,
    tunnel: TunnelStateMachine<B, F>,
    devices: D,
    device: DeviceState,
    relay_list: RelayList,
    broadcaster: EventBroadcaster,
    snapshot: watch::Sender<DaemonSnapshot>,
    commands: mpsc::Receiver<DaemonCommand>,
    backend_events: BackendEventReceiver,
}

impl<B, F, P, D> Daemon<B, F, P, D>
where
    B: TunnelBackend,
    F: Firewall + 'static,
    P: Persistence,
    D: DeviceService,
{
    pub fn new(parts: DaemonParts<B, F, P, D>, options: DaemonOptions) -> (Self, DaemonHandle) {
        let store = SettingsStore::load(parts.persistence);
        let device = store.load_device();

        let (backend_tx, backend_events) = mpsc::unbounded_channel();
        let mut tunnel = TunnelStateMachine::new(
            parts.backend,
            parts.firewall,
            options.retry,
            backend_tx,
            store.settings(),
        );
        if let Some(seed) = options.seed {
            tunnel = tunnel.with_seed(seed);
        }

        let (snapshot, state) = watch::channel(DaemonSnapshot {
            tunnel_state: tunnel.state().clone(),
            settings: store.settings().clone(),
            relay_list: parts.relay_list.clone(),
            version_info: Some(AppVersionInfo::current(options.version)),
            device_state: device.clone(),
        });
        let (command_tx, commands) = mpsc::channel(options.command_buffer.max(1));

        let daemon = Self {
            store,
            tunnel,
            devices: parts.devices,
            device,
            relay_list: parts.relay_list,
            broadcaster: EventBroadcaster::new(options.subscriber_buffer),
            snapshot,
            commands,
            backend_events,
        };
        let handle = DaemonHandle {
            commands: command_tx,
            state,
        };
        (daemon, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Daemon started");
        if self.store.settings().auto_connect {
            info!("Auto-connecting");
            self.tunnel_input(TunnelInput::Connect);
        }

        loop {
            let deadline = self.tunnel.deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(DaemonCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(message) = self.backend_events.recv() => {
                    debug!("Backend: attempt {} {:?}", message.attempt, message.event);
                    self.tunnel_input(TunnelInput::Backend(message));
                }
                _ = wait_for(deadline) => {
                    if let Some((id, _)) = deadline {
                        self.tunnel_input(TunnelInput::AttemptTimeout(id));
                    }
                }
            }
        }

        self.tunnel_input(TunnelInput::Disconnect);
        info!("Daemon stopped");
    }

    fn handle_command(&mut self, command: DaemonCommand) {
        match command {
            DaemonCommand::Request { request, reply } => {
                let result = self.handle_request(request);
                if let Err(e) = &result {
                    debug!("Request failed: {}", e);
                }
                let _ = reply.send(result);
            }
            DaemonCommand::Subscribe { reply } => {
                let stream = self.broadcaster.subscribe();
                let _ = reply.send((self.snapshot.borrow().clone(), stream));
            }
            DaemonCommand::UpdateRelayList(relay_list) => {
                info!("Relay list updated ({} relays)", relay_list.relay_count());
                self.relay_list = relay_list.clone();
                self.publish(DaemonEvent::RelayList(relay_list));
            }
            DaemonCommand::Shutdown => {}
        }
    }

    fn handle_request(&mut self, request: ManagementRequest) -> Result<ManagementResponse, ManagementError> {
        match request {
            // Normally answered by `DaemonHandle` without a round trip
            ManagementRequest::GetTunnelState
            | ManagementRequest::GetSettings
            | ManagementRequest::GetRelayList
            | ManagementRequest::GetVersionInfo
            | ManagementRequest::GetDevice => {
                Ok(read_snapshot(&self.snapshot.borrow(), &request).unwrap_or(ManagementResponse::Ok))
            }
            ManagementRequest::Connect => Ok(ManagementResponse::StateChanged(
                self.tunnel_input(TunnelInput::Connect),
            )),
            ManagementRequest::Disconnect => Ok(ManagementResponse::StateChanged(
                self.tunnel_input(TunnelInput::Disconnect),
            )),
            ManagementRequest::Reconnect => Ok(ManagementResponse::StateChanged(
                self.tunnel_input(TunnelInput::Reconnect),
            )),
            ManagementRequest::SubscribeEvents => Err(ManagementError::new(
                ErrorCode::MalformedRequest,
                "subscriptions are only available on a session",
            )),
            ManagementRequest::UpdateSettings { update } => {
                self.update_settings(update).map(ManagementResponse::Settings)
            }
            ManagementRequest::CreateCustomList { name, locations } => {
                let list = CustomList {
                    locations,
                    ..CustomList::new(name)
                };
                let id = list.id;
                self.update_settings(SettingsUpdate::CreateCustomList { list })?;
                Ok(ManagementResponse::CustomListCreated(id))
            }
            ManagementRequest::AddAccessMethod {
                name,
                enabled,
                access_method,
            } => {
                let setting = AccessMethodSetting::new(name, enabled, access_method);
                let id = setting.id;
                self.update_settings(SettingsUpdate::AddAccessMethod {
                    setting: setting.clone(),
                })?;
                self.publish(DaemonEvent::NewAccessMethod(setting));
                Ok(ManagementResponse::AccessMethodAdded(id))
            }
            ManagementRequest::LoginAccount { account_number } => {
                if let Some(current) = self.device.logged_in().cloned() {
                    self.logout_device(&current);
                }
                let account = self.devices.login(&account_number)?;
                info!("Logged in as device \"{}\"", account.device.name);
                self.set_device(DeviceEventCause::LoggedIn, DeviceState::LoggedIn(account));
                Ok(ManagementResponse::Ok)
            }
            ManagementRequest::LogoutAccount => {
                if let Some(current) = self.device.logged_in().cloned() {
                    self.logout_device(&current);
                    self.set_device(DeviceEventCause::LoggedOut, DeviceState::LoggedOut);
                }
                Ok(ManagementResponse::Ok)
            }
            ManagementRequest::RotateWireguardKey => {
                let mut current = self
                    .device
                    .logged_in()
                    .cloned()
                    .ok_or(DeviceServiceError::NotLoggedIn)?;
                current.device.wireguard = self.devices.rotate_key(&current)?;
                self.set_device(DeviceEventCause::RotatedKey, DeviceState::LoggedIn(current));
                Ok(ManagementResponse::Ok)
            }
            ManagementRequest::ListDevices { account_number } => self
                .devices
                .list_devices(&account_number)
                .map(ManagementResponse::Devices)
                .map_err(ManagementError::from),
            ManagementRequest::RemoveDevice {
                account_number,
                device_id,
            } => {
                let new_device_list = self.devices.remove_device(&account_number, &device_id)?;
                self.publish(DaemonEvent::RemoveDevice(RemoveDeviceEvent {
                    account_number,
                    new_device_list,
                }));
                let removed_current = self
                    .device
                    .logged_in()
                    .is_some_and(|current| current.device.id == device_id);
                if removed_current {
                    warn!("Current device was removed");
                    self.set_device(DeviceEventCause::Revoked, DeviceState::Revoked);
                }
                Ok(ManagementResponse::Ok)
            }
        }
    }

    /// Commit an update, announce it and let the tunnel react
    fn update_settings(&mut self, update: SettingsUpdate) -> Result<Settings, ManagementError> {
        let old = self.store.settings().clone();
        let new = self.store.apply(update)?;
        if new != old {
            self.publish(DaemonEvent::Settings(new.clone()));
            self.tunnel_input(TunnelInput::SettingsChanged { old });
        }
        Ok(new)
    }

    fn logout_device(&mut self, current: &AccountAndDevice) {
        if let Err(e) = self.devices.logout(current) {
            warn!("Failed to remove device on logout: {}", e);
        }
    }

    fn set_device(&mut self, cause: DeviceEventCause, new_state: DeviceState) {
        self.device = new_state.clone();
        self.store.save_device(&new_state);
        self.publish(DaemonEvent::Device(DeviceEvent { cause, new_state }));
        self.tunnel_input(TunnelInput::DeviceChanged(cause));
    }

    /// Feed the tunnel state machine; true if the state changed
    fn tunnel_input(&mut self, input: TunnelInput) -> bool {
        let ctx = TunnelContext {
            settings: self.store.settings(),
            relay_list: &self.relay_list,
            device: &self.device,
        };
        let entered = self.tunnel.handle(input, &ctx);
        let changed = !entered.is_empty();
        for state in entered {
            self.publish(DaemonEvent::TunnelState(state));
        }
        changed
    }

    /// Update the shared snapshot, then tell the subscribers
    fn publish(&mut self, event: DaemonEvent) {
        self.snapshot.send_modify(|snapshot| match &event {
            DaemonEvent::TunnelState(state) => snapshot.tunnel_state = state.clone(),
            DaemonEvent::Settings(settings) => snapshot.settings = settings.clone(),
            DaemonEvent::RelayList(list) => snapshot.relay_list = list.clone(),
            DaemonEvent::VersionInfo(info) => snapshot.version_info = Some(info.clone()),
            DaemonEvent::Device(device) => snapshot.device_state = device.new_state.clone(),
            DaemonEvent::RemoveDevice(_) | DaemonEvent::NewAccessMethod(_) => {}
        });
        self.broadcaster.publish(event);
    }
}

async fn wait_for(deadline: Option<(AttemptId, Instant)>) {
    match deadline {
        Some((_, at)) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Response to `request` taken from the shared snapshot, or `None` when the
/// request has to go through the control loop
fn read_snapshot(snapshot: &DaemonSnapshot, request: &ManagementRequest) -> Option<ManagementResponse> {
    let response = match request {
        ManagementRequest::GetTunnelState => {
            ManagementResponse::TunnelState(snapshot.tunnel_state.clone())
        }
        ManagementRequest::GetSettings => ManagementResponse::Settings(snapshot.settings.clone()),
        ManagementRequest::GetRelayList => ManagementResponse::RelayList(snapshot.relay_list.clone()),
        ManagementRequest::GetVersionInfo => match &snapshot.version_info {
            Some(info) => ManagementResponse::VersionInfo(info.clone()),
            None => ManagementResponse::Ok,
        },
        ManagementRequest::GetDevice => ManagementResponse::Device(snapshot.device_state.clone()),
        ManagementRequest::Connect
        | ManagementRequest::Disconnect
        | ManagementRequest::Reconnect
        | ManagementRequest::SubscribeEvents
        | ManagementRequest::UpdateSettings { .. }
        | ManagementRequest::CreateCustomList { .. }
        | ManagementRequest::AddAccessMethod { .. }
        | ManagementRequest::LoginAccount { .. }
        | ManagementRequest::LogoutAccount
        | ManagementRequest::RotateWireguardKey
        | ManagementRequest::ListDevices { .. }
        | ManagementRequest::RemoveDevice { .. } => return None,
    };
    Some(response)
}

/// Cheap, cloneable access to a running daemon
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    commands: mpsc::Sender<DaemonCommand>,
    state: watch::Receiver<DaemonSnapshot>,
}

impl DaemonHandle {
    /// Answer a request. Read-only queries never reach the control loop.
    pub async fn request(&self, request: ManagementRequest) -> Result<ManagementResponse, ManagementError> {
        let read = read_snapshot(&self.state.borrow(), &request);
        if let Some(response) = read {
            return Ok(response);
        }

        let (reply, response) = oneshot::channel();
        self.send(DaemonCommand::Request { request, reply }).await?;
        response.await.map_err(|_| DaemonError::Stopped)?
    }

    /// Snapshot of the current state plus every event from here on
    pub async fn subscribe(&self) -> Result<(DaemonSnapshot, EventStream), DaemonError> {
        let (reply, response) = oneshot::channel();
        self.send(DaemonCommand::Subscribe { reply }).await?;
        response.await.map_err(|_| DaemonError::Stopped)
    }

    pub async fn update_relay_list(&self, relay_list: RelayList) -> Result<(), DaemonError> {
        self.send(DaemonCommand::UpdateRelayList(relay_list)).await
    }

    pub async fn shutdown(&self) -> Result<(), DaemonError> {
        self.send(DaemonCommand::Shutdown).await
    }

    pub fn tunnel_state(&self) -> TunnelState {
        self.state.borrow().tunnel_state.clone()
    }

    pub fn settings(&self) -> Settings {
        self.state.borrow().settings.clone()
    }

    /// Watch the shared snapshot
    pub fn watch(&self) -> watch::Receiver<DaemonSnapshot> {
        self.state.clone()
    }

    async fn send(&self, command: DaemonCommand) -> Result<(), DaemonError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DaemonError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_service::LocalDeviceService;
    use crate::persistence::MemoryPersistence;
    use crate::testing::{ScriptedBackend, logged_in_device, sample_relay_list};
    use fos_vpn::firewall::SoftFirewall;
    use fos_vpn::states::ErrorStateCause;

    fn spawn_daemon(persistence: MemoryPersistence) -> (DaemonHandle, ScriptedBackend) {
        let backend = ScriptedBackend::new();
        let parts = DaemonParts {
            backend: backend.clone(),
            firewall: SoftFirewall::new(),
            persistence,
            devices: LocalDeviceService::new(),
            relay_list: sample_relay_list(),
        };
        let options = DaemonOptions {
            seed: Some(1),
            ..DaemonOptions::default()
        };
        let (daemon, handle) = Daemon::new(parts, options);
        daemon.spawn();
        (handle, backend)
    }

    fn logged_in_persistence(settings: Settings) -> MemoryPersistence {
        let mut persistence = MemoryPersistence::with_settings(settings);
        persistence.save_device(&logged_in_device()).unwrap();
        persistence
    }

    async fn next_state(events: &mut EventStream) -> TunnelState {
        loop {
            match events.recv().await {
                Some(DaemonEvent::TunnelState(state)) => return state,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    }

    #[tokio::test]
    async fn test_read_only_queries_use_snapshot() {
        let (handle, _) = spawn_daemon(MemoryPersistence::new());

        let response = handle.request(ManagementRequest::GetTunnelState).await.unwrap();
        assert_eq!(response, ManagementResponse::TunnelState(TunnelState::disconnected(false)));

        let response = handle.request(ManagementRequest::GetRelayList).await.unwrap();
        assert_eq!(response, ManagementResponse::RelayList(sample_relay_list()));
    }

    #[tokio::test]
    async fn test_device_query_matches_control_loop() {
        let (handle, _) = spawn_daemon(logged_in_persistence(Settings::default()));
        let expected = ManagementResponse::Device(logged_in_device());

        let response = handle.request(ManagementRequest::GetDevice).await.unwrap();
        assert_eq!(response, expected);

        let (reply, response) = oneshot::channel();
        handle
            .send(DaemonCommand::Request {
                request: ManagementRequest::GetDevice,
                reply,
            })
            .await
            .unwrap();
        assert_eq!(response.await.unwrap().unwrap(), expected);

        let response = handle.request(ManagementRequest::GetVersionInfo).await.unwrap();
        assert!(matches!(response, ManagementResponse::VersionInfo(_)));
    }

    #[tokio::test]
    async fn test_settings_event_precedes_reconnect() {
        let (handle, backend) = spawn_daemon(logged_in_persistence(Settings::default()));
        let (_, mut events) = handle.subscribe().await.unwrap();

        handle.request(ManagementRequest::Connect).await.unwrap();
        assert!(next_state(&mut events).await.is_connecting());
        backend.up();
        assert!(next_state(&mut events).await.is_connected());

        let update = SettingsUpdate::SetWireguardMtu { mtu: Some(1280) };
        handle
            .request(ManagementRequest::UpdateSettings { update })
            .await
            .unwrap();

        assert!(matches!(events.recv().await, Some(DaemonEvent::Settings(_))));
        assert_eq!(
            next_state(&mut events).await,
            TunnelState::Disconnecting {
                after_disconnect: fos_vpn::states::ActionAfterDisconnect::Reconnect
            }
        );
        assert!(next_state(&mut events).await.is_connecting());
    }

    #[tokio::test]
    async fn test_auto_connect_on_start() {
        let settings = Settings {
            auto_connect: true,
            ..Settings::default()
        };
        let (handle, backend) = spawn_daemon(logged_in_persistence(settings));

        let mut watch = handle.watch();
        watch
            .wait_for(|snapshot| snapshot.tunnel_state.is_connecting())
            .await
            .unwrap();
        assert_eq!(backend.started().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_attempts() {
        let (handle, backend) = spawn_daemon(logged_in_persistence(Settings::default()));
        let (_, mut events) = handle.subscribe().await.unwrap();

        handle.request(ManagementRequest::Connect).await.unwrap();
        let mut states = Vec::new();
        loop {
            let state = next_state(&mut events).await;
            let done = state.is_in_error_state();
            states.push(state);
            if done {
                break;
            }
        }

        assert_eq!(states.len(), 5);
        assert_eq!(backend.started().len(), 4);
        assert!(matches!(
            states.last(),
            Some(TunnelState::Error { error_state })
                if error_state.cause == ErrorStateCause::StartTunnelError
        ));
    }

    #[tokio::test]
    async fn test_login_and_rotate_publish_device_events() {
        let (handle, _) = spawn_daemon(MemoryPersistence::new());
        let (snapshot, mut events) = handle.subscribe().await.unwrap();
        assert_eq!(snapshot.device_state, DeviceState::LoggedOut);

        handle
            .request(ManagementRequest::LoginAccount {
                account_number: "1111222233334444".into(),
            })
            .await
            .unwrap();
        let Some(DaemonEvent::Device(login)) = events.recv().await else {
            panic!("expected device event");
        };
        assert_eq!(login.cause, DeviceEventCause::LoggedIn);

        handle.request(ManagementRequest::RotateWireguardKey).await.unwrap();
        let Some(DaemonEvent::Device(rotated)) = events.recv().await else {
            panic!("expected device event");
        };
        assert_eq!(rotated.cause, DeviceEventCause::RotatedKey);
        assert_ne!(
            rotated.new_state.wireguard().map(|wg| wg.public_key()),
            login.new_state.wireguard().map(|wg| wg.public_key())
        );
    }

    #[tokio::test]
    async fn test_rotate_requires_login() {
        let (handle, _) = spawn_daemon(MemoryPersistence::new());

        let error = handle
            .request(ManagementRequest::RotateWireguardKey)
            .await
            .unwrap_err();
        assert_eq!(error.code, ErrorCode::DeviceService);
    }

    #[tokio::test]
    async fn test_stopped_daemon_is_unavailable() {
        let (handle, _) = spawn_daemon(MemoryPersistence::new());
        handle.shutdown().await.unwrap();
        handle.commands.closed().await;

        let error = handle.request(ManagementRequest::Connect).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::DaemonUnavailable);
    }
}
