//! fos-vpnd: VPN daemon
//!
//! Loads its config, restores the persisted settings and device, then serves
//! the management socket until interrupted.

use anyhow::{Context, Result};
use fos_vpn::device::DeviceState;
use fos_vpn::firewall::SoftFirewall;
use fos_vpn::relay_list::RelayList;
use fos_vpnd::device_service::LocalDeviceService;
use fos_vpnd::persistence::{JsonFilePersistence, Persistence};
use fos_vpnd::probe::ProbeBackend;
use fos_vpnd::relay_fetcher::RelayListUpdater;
use fos_vpnd::{Daemon, DaemonConfig, DaemonOptions, DaemonParts, ManagementServer};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fos_vpnd=info,fos_vpn=info".into()),
        )
        .init();

    let config = DaemonConfig::load(std::env::args_os().nth(1).map(PathBuf::from))
        .context("Failed to load daemon config")?;
    info!("fos-vpnd {} starting", env!("CARGO_PKG_VERSION"));

    let persistence = JsonFilePersistence::new(&config.settings_dir);
    let devices = match persistence.load_device() {
        Ok(Some(DeviceState::LoggedIn(account))) => LocalDeviceService::new().with_device(&account),
        Ok(_) => LocalDeviceService::new(),
        Err(e) => {
            warn!("Ignoring stored device: {}", e);
            LocalDeviceService::new()
        }
    };

    let mut updater = RelayListUpdater::new(&config.relay_list_path, config.relay_list_refresh());
    let relay_list = match updater.poll().await {
        Ok(Some(list)) => list,
        Ok(None) => RelayList::empty(),
        Err(e) => {
            warn!("Starting without relays: {}", e);
            RelayList::empty()
        }
    };

    let parts = DaemonParts {
        backend: ProbeBackend::default(),
        firewall: SoftFirewall::new(),
        persistence,
        devices,
        relay_list,
    };
    let (daemon, handle) = Daemon::new(parts, DaemonOptions::from_config(&config));
    let daemon_task = daemon.spawn();

    let server = ManagementServer::bind(&config.socket_path, handle.clone(), config.max_frame_size)
        .context("Failed to open management socket")?;
    let server_task = tokio::spawn(server.run());
    let updater_task = tokio::spawn(updater.run(handle.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    server_task.abort();
    updater_task.abort();
    // Let the server drop its endpoint so the socket file is removed
    let _ = server_task.await;
    if handle.shutdown().await.is_ok() {
        daemon_task.await.context("Daemon task panicked")?;
    }
    Ok(())
}
