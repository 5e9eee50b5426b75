//! Destination discovery.
//!
//! Drives are the readable directories under the configured volumes path
//! (`/Volumes` on macOS). A [`DriveWatcher`] polls that list and reports
//! when it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::Disks;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::errors::{IoContext, SyncResult};

/// A mounted destination volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drive {
    pub name: String,
    pub mount_path: PathBuf,
    /// Subfolder holding the show folders.
    pub folder: String,
}

impl Drive {
    pub fn new(name: impl Into<String>, mount_path: impl Into<PathBuf>, folder: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
            folder: folder.into(),
        }
    }

    /// `<mount>/<folder>`, the root of the synced tree.
    pub fn podcast_dir(&self) -> PathBuf {
        self.mount_path.join(&self.folder)
    }
}

/// Lists drives under `config.volumes_path`, sorted by name. Excluded
/// names, hidden entries and unreadable mounts are skipped.
pub fn detect_drives(config: &AppConfig) -> SyncResult<Vec<Drive>> {
    let volumes = &config.volumes_path;
    let mut drives = Vec::new();

    for entry in std::fs::read_dir(volumes).op_context("read volumes", volumes)? {
        let Ok(entry) = entry else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || config.excluded_volumes.iter().any(|x| x == &name) {
            continue;
        }

        let mount_path = entry.path();
        if !mount_path.is_dir() || !is_readable(&mount_path) {
            tracing::debug!(path = %mount_path.display(), "skipping unreadable volume");
            continue;
        }
        drives.push(Drive::new(name, mount_path, config.destination_folder.clone()));
    }

    drives.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(drives)
}

fn is_readable(path: &Path) -> bool {
    std::fs::read_dir(path).is_ok()
}

/// Same set of mount paths, in any order.
pub fn drives_equal(a: &[Drive], b: &[Drive]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut left: Vec<_> = a.iter().map(|d| &d.mount_path).collect();
    let mut right: Vec<_> = b.iter().map(|d| &d.mount_path).collect();
    left.sort();
    right.sort();
    left == right
}

/// Whether `path` sits on a disk the OS reports as removable.
pub fn is_on_removable_volume(path: &Path) -> bool {
    let disks = Disks::new_with_refreshed_list();

    // Longest mount point wins so `/` does not shadow `/Volumes/X`.
    let removable = disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.is_removable());

    match removable {
        Some(r) => r,
        None => cfg!(target_os = "macos") && path.starts_with("/Volumes"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveEvent {
    DrivesChanged(Vec<Drive>),
    ScanFailed(String),
}

/// Polls the volumes path and emits [`DriveEvent::DrivesChanged`] when the
/// set of drives differs from the last one reported.
pub struct DriveWatcher {
    stop_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DriveWatcher {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

    /// Starts polling on the current runtime. The first poll always reports.
    pub fn start(config: AppConfig, poll_interval: Duration, tx: mpsc::Sender<DriveEvent>) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(watch_loop(config, poll_interval, tx, stop_rx));
        Self {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Stops polling and waits for the loop to exit. Safe to call twice.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "drive watcher failed");
            }
        }
    }
}

async fn watch_loop(
    config: AppConfig,
    poll_interval: Duration,
    tx: mpsc::Sender<DriveEvent>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut known: Option<Vec<Drive>> = None;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                let event = match detect_drives(&config) {
                    Ok(drives) => {
                        if known.as_deref().is_some_and(|k| drives_equal(k, &drives)) {
                            continue;
                        }
                        tracing::info!(count = drives.len(), "drives changed");
                        known = Some(drives.clone());
                        DriveEvent::DrivesChanged(drives)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "drive scan failed");
                        DriveEvent::ScanFailed(e.to_string())
                    }
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(dir: &Path) -> AppConfig {
        AppConfig {
            volumes_path: dir.to_path_buf(),
            ..AppConfig::default()
        }
    }

    #[test]
    fn detects_directories_and_skips_excluded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("USB STICK")).unwrap();
        std::fs::create_dir(dir.path().join("Macintosh HD")).unwrap();
        std::fs::create_dir(dir.path().join(".hidden")).unwrap();
        std::fs::create_dir(dir.path().join("Another")).unwrap();
        std::fs::write(dir.path().join("not-a-drive"), b"x").unwrap();

        let drives = detect_drives(&config_for(dir.path())).unwrap();
        let names: Vec<_> = drives.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Another", "USB STICK"]);
        assert_eq!(drives[1].mount_path, dir.path().join("USB STICK"));
        assert_eq!(drives[1].podcast_dir(), dir.path().join("USB STICK").join("podcasts"));
    }

    #[test]
    fn missing_volumes_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(detect_drives(&config_for(&dir.path().join("nope"))).is_err());
    }

    #[test]
    fn equality_ignores_order() {
        let a = Drive::new("A", "/Volumes/A", "podcasts");
        let b = Drive::new("B", "/Volumes/B", "podcasts");
        let c = Drive::new("C", "/Volumes/C", "podcasts");
        assert!(drives_equal(&[a.clone(), b.clone()], &[b.clone(), a.clone()]));
        assert!(!drives_equal(&[a.clone(), b.clone()], &[a.clone(), c]));
        assert!(!drives_equal(&[a.clone()], &[a, b]));
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_reports_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("A")).unwrap();

        let (tx, mut rx) = mpsc::channel(10);
        let mut watcher = DriveWatcher::start(config_for(dir.path()), Duration::from_millis(100), tx);

        let first = rx.recv().await.unwrap();
        assert!(matches!(&first, DriveEvent::DrivesChanged(d) if d.len() == 1));

        std::fs::create_dir(dir.path().join("B")).unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(&second, DriveEvent::DrivesChanged(d) if d.len() == 2));

        watcher.stop().await;
        assert!(!watcher.is_running());
        watcher.stop().await;
        assert!(rx.recv().await.is_none());
    }
}
