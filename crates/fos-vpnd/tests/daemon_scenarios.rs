//! End-to-end scenarios driven through `DaemonHandle`

use fos_ipc::protocol::{ErrorCode, ManagementRequest, ManagementResponse};
use fos_vpn::events::DaemonEvent;
use fos_vpn::firewall::SoftFirewall;
use fos_vpn::relay_list::RelayList;
use fos_vpn::settings::{ObfuscationSettings, SelectedObfuscation, Settings, SettingsUpdate};
use fos_vpn::states::{
    ActionAfterDisconnect, ErrorState, ErrorStateCause, ParameterGenerationError, TunnelState,
};
use fos_vpnd::backend::{BackendEvent, TunnelMetadata};
use fos_vpnd::broadcaster::EventStream;
use fos_vpnd::device_service::LocalDeviceService;
use fos_vpnd::persistence::{JsonFilePersistence, MemoryPersistence, Persistence};
use fos_vpnd::testing::{ScriptedBackend, logged_in_device, sample_relay_list};
use fos_vpnd::{Daemon, DaemonHandle, DaemonOptions, DaemonParts};
use std::time::Duration;

fn spawn<P: Persistence>(persistence: P, relay_list: RelayList) -> (DaemonHandle, ScriptedBackend) {
    let backend = ScriptedBackend::new();
    let parts = DaemonParts {
        backend: backend.clone(),
        firewall: SoftFirewall::new(),
        persistence,
        devices: LocalDeviceService::new(),
        relay_list,
    };
    let options = DaemonOptions {
        seed: Some(7),
        ..DaemonOptions::default()
    };
    let (daemon, handle) = Daemon::new(parts, options);
    daemon.spawn();
    (handle, backend)
}

fn logged_in() -> MemoryPersistence {
    let mut persistence = MemoryPersistence::new();
    persistence.save_device(&logged_in_device()).unwrap();
    persistence
}

async fn tunnel_states(events: &mut EventStream, count: usize) -> Vec<TunnelState> {
    let mut states = Vec::new();
    while states.len() < count {
        match events.recv().await {
            Some(DaemonEvent::TunnelState(state)) => states.push(state),
            Some(_) => {}
            None => break,
        }
    }
    states
}

#[tokio::test]
async fn empty_relay_list_fails_with_no_matching_relay() {
    let (handle, backend) = spawn(logged_in(), RelayList::empty());
    let (_, mut events) = handle.subscribe().await.unwrap();

    handle.request(ManagementRequest::Connect).await.unwrap();

    let states = tunnel_states(&mut events, 1).await;
    assert_eq!(
        states,
        [TunnelState::Error {
            error_state: ErrorState::new(ErrorStateCause::TunnelParameterError {
                error: ParameterGenerationError::NoMatchingRelay,
            }),
        }]
    );
    assert!(backend.started().is_empty());
    assert!(handle.tunnel_state().is_in_error_state());
}

#[tokio::test]
async fn disconnect_while_connecting_never_connects() {
    let (handle, backend) = spawn(logged_in(), sample_relay_list());
    let (_, mut events) = handle.subscribe().await.unwrap();

    handle.request(ManagementRequest::Connect).await.unwrap();
    handle.request(ManagementRequest::Disconnect).await.unwrap();
    let attempt = backend.last_attempt().unwrap();

    // A late "up" from the aborted attempt must be ignored
    backend.send(
        attempt,
        BackendEvent::Up(TunnelMetadata {
            interface: "late0".into(),
            endpoint: None,
        }),
    );

    let states = tunnel_states(&mut events, 3).await;
    assert!(states[0].is_connecting());
    assert_eq!(
        states[1],
        TunnelState::Disconnecting {
            after_disconnect: ActionAfterDisconnect::Nothing
        }
    );
    assert_eq!(states[2], TunnelState::disconnected(false));
    assert_eq!(backend.aborted(), [attempt]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(handle.tunnel_state(), TunnelState::disconnected(false));
}

#[tokio::test]
async fn late_subscriber_gets_snapshot_without_replay() {
    let (handle, backend) = spawn(logged_in(), sample_relay_list());
    let (_, mut early) = handle.subscribe().await.unwrap();

    handle.request(ManagementRequest::Connect).await.unwrap();
    backend.up();
    let states = tunnel_states(&mut early, 2).await;
    assert!(states[1].is_connected());

    let (snapshot, mut late) = handle.subscribe().await.unwrap();
    assert!(snapshot.tunnel_state.is_connected());
    assert!(late.try_recv().is_err());

    handle.request(ManagementRequest::Disconnect).await.unwrap();
    let states = tunnel_states(&mut late, 2).await;
    assert!(matches!(states[0], TunnelState::Disconnecting { .. }));
    assert!(states[1].is_disconnected());
}

#[tokio::test]
async fn udp2tcp_without_settings_is_rejected() {
    let persistence = MemoryPersistence::new();
    let (handle, _) = spawn(persistence.clone(), sample_relay_list());
    let before = handle.settings();
    let writes = persistence.settings_writes();

    let update = SettingsUpdate::SetObfuscationSettings {
        obfuscation_settings: ObfuscationSettings {
            selected_obfuscation: SelectedObfuscation::Udp2Tcp,
            udp2tcp: None,
            shadowsocks: None,
        },
    };
    let error = handle
        .request(ManagementRequest::UpdateSettings { update })
        .await
        .unwrap_err();

    assert_eq!(error.code, ErrorCode::InvalidSettings);
    assert_eq!(handle.settings(), before);
    assert_eq!(persistence.settings_writes(), writes);
}

#[tokio::test]
async fn settings_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (handle, _) = spawn(JsonFilePersistence::new(dir.path()), sample_relay_list());
    let update = SettingsUpdate::SetAllowLan { allow_lan: true };
    handle
        .request(ManagementRequest::UpdateSettings { update })
        .await
        .unwrap();
    let response = handle
        .request(ManagementRequest::CreateCustomList {
            name: "work".into(),
            locations: Vec::new(),
        })
        .await
        .unwrap();
    let ManagementResponse::CustomListCreated(list_id) = response else {
        panic!("unexpected response: {response:?}");
    };
    handle.shutdown().await.unwrap();

    let (restarted, _) = spawn(JsonFilePersistence::new(dir.path()), sample_relay_list());
    let settings: Settings = restarted.settings();
    assert!(settings.allow_lan);
    assert!(settings.custom_lists.contains(&list_id));
}

#[tokio::test]
async fn relay_list_update_is_broadcast() {
    let (handle, _) = spawn(logged_in(), RelayList::empty());
    let (_, mut events) = handle.subscribe().await.unwrap();

    handle.update_relay_list(sample_relay_list()).await.unwrap();

    assert_eq!(
        events.recv().await,
        Some(DaemonEvent::RelayList(sample_relay_list()))
    );
    let response = handle.request(ManagementRequest::GetRelayList).await.unwrap();
    assert_eq!(response, ManagementResponse::RelayList(sample_relay_list()));
}
