//! Relay list refresh
//!
//! Watches the relay list file and pushes a new [`RelayList`] into the daemon
//! whenever it changes. A change is a new modification time with different
//! content; lists carrying the same `etag` as the current one are skipped.

use crate::daemon::DaemonHandle;
use fos_vpn::relay_list::{RelayList, RelayListError};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct RelayListUpdater {
    path: PathBuf,
    interval: Duration,
    modified: Option<SystemTime>,
    etag: Option<String>,
}

impl RelayListUpdater {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            modified: None,
            etag: None,
        }
    }

    /// Load the list if the file changed since the last poll
    pub async fn poll(&mut self) -> Result<Option<RelayList>, RelayListError> {
        let modified = tokio::fs::metadata(&self.path)
            .await
            .and_then(|meta| meta.modified())
            .map_err(|e| RelayListError::IoError(e.to_string()))?;
        if self.modified == Some(modified) {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RelayListError::IoError(e.to_string()))?;
        let list = RelayList::from_json(&content)?;
        self.modified = Some(modified);
        if list.etag.is_some() && list.etag == self.etag {
            debug!("Relay list touched but etag unchanged");
            return Ok(None);
        }
        self.etag = list.etag.clone();
        info!("Loaded {} relays from {}", list.relay_count(), self.path.display());
        Ok(Some(list))
    }

    /// Poll until the daemon goes away
    pub async fn run(mut self, daemon: DaemonHandle) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.poll().await {
                Ok(Some(list)) => {
                    if daemon.update_relay_list(list).await.is_err() {
                        debug!("Daemon stopped, relay list updater exiting");
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to refresh relay list: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_relay_list;

    #[tokio::test]
    async fn test_poll_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relays.json");
        let mut updater = RelayListUpdater::new(&path, Duration::from_secs(60));

        assert!(updater.poll().await.is_err());

        let list = sample_relay_list();
        std::fs::write(&path, list.to_json().unwrap()).unwrap();
        assert_eq!(updater.poll().await.unwrap(), Some(list));
        assert_eq!(updater.poll().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_same_etag_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relays.json");
        let mut updater = RelayListUpdater::new(&path, Duration::from_secs(60));
        let list = sample_relay_list();

        std::fs::write(&path, list.to_json().unwrap()).unwrap();
        assert!(updater.poll().await.unwrap().is_some());

        // Force a new modification time with identical content
        updater.modified = None;
        assert_eq!(updater.poll().await.unwrap(), None);

        let mut newer = list.clone();
        newer.etag = Some("v2".into());
        std::fs::write(&path, newer.to_json().unwrap()).unwrap();
        updater.modified = None;
        assert_eq!(updater.poll().await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_corrupt_list_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relays.json");
        std::fs::write(&path, "not json").unwrap();

        let mut updater = RelayListUpdater::new(&path, Duration::from_secs(60));
        assert!(matches!(updater.poll().await, Err(RelayListError::ParseError(_))));
    }
}
