use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use podcast_sync::config::SyncSettings;
use podcast_sync::tagging::{NoopTagger, Tagger};
use podcast_sync::{AppConfig, Drive, Episode, ProgressSnapshot, SyncEngine, SyncResult};

fn source_episode(dir: &Path, title: &str, size: usize) -> Episode {
    let path = dir.join(format!("{}.mp3", title));
    std::fs::write(&path, vec![7u8; size]).unwrap();
    Episode {
        selected: true,
        file_size: size as u64,
        published_at: Some(Utc.with_ymd_and_hms(2023, 11, 5, 8, 0, 0).unwrap()),
        ..Episode::new(title, "Morning Show", format!("file://{}", path.display()))
    }
}

fn show_dir(mount: &Path) -> PathBuf {
    mount.join("podcasts").join("Morning Show")
}

fn collect(mut rx: mpsc::Receiver<ProgressSnapshot>) -> tokio::task::JoinHandle<Vec<ProgressSnapshot>> {
    tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(s) = rx.recv().await {
            out.push(s);
        }
        out
    })
}

#[tokio::test]
async fn existing_episode_is_left_out_of_the_batch() {
    let source = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    let drive = Drive::new("USB", mount.path(), "podcasts");

    let present = source_episode(source.path(), "Present", 500);
    let fresh = source_episode(source.path(), "Fresh", 1_500);

    std::fs::create_dir_all(show_dir(mount.path())).unwrap();
    let present_dest = show_dir(mount.path()).join("2023-11-05 - Present.mp3");
    std::fs::write(&present_dest, b"already here").unwrap();

    let engine = SyncEngine::with_tagger(AppConfig::default(), Arc::new(NoopTagger));
    let (tx, rx) = mpsc::channel(200);
    let handle = engine.start_sync(vec![present, fresh], &drive, tx).await;
    let snapshots = collect(rx).await.unwrap();
    handle.wait().await;

    let last = snapshots.last().unwrap();
    assert!(last.complete);
    assert!(!last.cancelled);
    assert_eq!(last.total_files, 1);
    assert_eq!(last.total_bytes, 1_500);
    assert_eq!(last.bytes_transferred, 1_500);
    assert_eq!(std::fs::read(&present_dest).unwrap(), b"already here");
    assert!(show_dir(mount.path()).join("2023-11-05 - Fresh.mp3").exists());
}

#[tokio::test]
async fn snapshots_never_go_backwards() {
    let source = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    let drive = Drive::new("USB", mount.path(), "podcasts");

    let episodes: Vec<_> = (0..4)
        .map(|i| source_episode(source.path(), &format!("Part {}", i), 64 * 1024))
        .collect();

    let engine = SyncEngine::with_tagger(AppConfig::default(), Arc::new(NoopTagger));
    let (tx, rx) = mpsc::channel(200);
    let handle = engine.start_sync(episodes, &drive, tx).await;
    let snapshots = collect(rx).await.unwrap();
    handle.wait().await;

    assert!(snapshots.windows(2).all(|w| w[0].bytes_transferred <= w[1].bytes_transferred));
    assert!(snapshots.iter().all(|s| s.session_id == handle.id()));
    assert_eq!(snapshots.iter().filter(|s| s.complete).count(), 1);

    let last = snapshots.last().unwrap();
    assert_eq!(last.files_done, 4);
    assert_eq!(last.bytes_transferred, 4 * 64 * 1024);
    assert!((last.fraction_complete - 1.0).abs() < f64::EPSILON);
    assert_eq!(last.eta_secs, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_during_copy_leaves_no_partial_file() {
    let source = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    let drive = Drive::new("USB", mount.path(), "podcasts");

    let big = source_episode(source.path(), "Long Interview", 10 * 1024 * 1024);
    let config = AppConfig {
        sync: SyncSettings {
            copy_buffer_size: 4 * 1024,
            flush_every_bytes: 64 * 1024,
            ..SyncSettings::default()
        },
        ..AppConfig::default()
    };

    let engine = SyncEngine::with_tagger(config, Arc::new(NoopTagger));
    let (tx, rx) = mpsc::channel(200);
    let handle = engine.start_sync(vec![big], &drive, tx).await;
    let snapshots = collect(rx);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while handle.snapshot().bytes_transferred < 3 * 1024 * 1024
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    handle.stop().await;
    let snapshots = snapshots.await.unwrap();

    let last = snapshots.last().unwrap();
    assert!(last.complete);
    assert_eq!(last.error, None);

    let dest = show_dir(mount.path()).join("2023-11-05 - Long Interview.mp3");
    match std::fs::metadata(&dest) {
        // the copy beat the stop request
        Ok(meta) => assert_eq!(meta.len(), 10 * 1024 * 1024),
        Err(_) => {
            assert!(last.cancelled);
            assert_eq!(last.files_done, 0);
            assert!(!show_dir(mount.path()).exists());
        }
    }
}

/// Blocks inside `tag` until released, so a test can stop the session
/// between two files.
struct GateTagger {
    entered: mpsc::Sender<()>,
    release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
}

impl Tagger for GateTagger {
    fn tag(&self, _path: &Path, _episode: &Episode) -> SyncResult<()> {
        let _ = self.entered.blocking_send(());
        let _ = self.release.lock().unwrap().recv();
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_between_files_reports_cancelled() {
    let source = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    let drive = Drive::new("USB", mount.path(), "podcasts");

    let (entered_tx, mut entered_rx) = mpsc::channel(4);
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let tagger = GateTagger {
        entered: entered_tx,
        release: std::sync::Mutex::new(release_rx),
    };

    let episodes = vec![
        source_episode(source.path(), "First", 2_000),
        source_episode(source.path(), "Second", 3_000),
    ];
    let engine = SyncEngine::with_tagger(AppConfig::default(), Arc::new(tagger));
    let (tx, rx) = mpsc::channel(200);
    let handle = engine.start_sync(episodes, &drive, tx).await;
    let snapshots = collect(rx);

    entered_rx.recv().await.unwrap();
    let stopper = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.stop().await })
    };
    while !handle.is_stopped() {
        tokio::task::yield_now().await;
    }
    release_tx.send(()).unwrap();
    stopper.await.unwrap();

    let snapshots = snapshots.await.unwrap();
    let last = snapshots.last().unwrap();
    assert!(last.complete);
    assert!(last.cancelled);
    assert_eq!(last.files_done, 1);
    assert_eq!(last.bytes_transferred, 2_000);
    assert!(show_dir(mount.path()).join("2023-11-05 - First.mp3").exists());
    assert!(!show_dir(mount.path()).join("2023-11-05 - Second.mp3").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_after_abandoned_wait_still_waits_for_copy_loop() {
    let source = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    let drive = Drive::new("USB", mount.path(), "podcasts");

    let (entered_tx, mut entered_rx) = mpsc::channel(4);
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let tagger = GateTagger {
        entered: entered_tx,
        release: std::sync::Mutex::new(release_rx),
    };

    let engine = SyncEngine::with_tagger(AppConfig::default(), Arc::new(tagger));
    let (tx, rx) = mpsc::channel(200);
    let handle = engine
        .start_sync(vec![source_episode(source.path(), "Only", 4_000)], &drive, tx)
        .await;
    let snapshots = collect(rx);
    entered_rx.recv().await.unwrap();

    // the copy loop is parked in the tagger, so this wait gives up
    tokio::select! {
        _ = handle.wait() => panic!("copy loop cannot finish while tagging is held"),
        _ = tokio::time::sleep(Duration::from_millis(30)) => {}
    }

    let stopper = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopper.is_finished());

    release_tx.send(()).unwrap();
    stopper.await.unwrap();
    let last = snapshots.await.unwrap().pop().unwrap();
    assert!(last.complete);
    assert_eq!(last.files_done, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_wait_then_stop_leaves_no_partial_file() {
    let source = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    let drive = Drive::new("USB", mount.path(), "podcasts");

    let big = source_episode(source.path(), "Marathon", 32 * 1024 * 1024);
    let config = AppConfig {
        sync: SyncSettings {
            copy_buffer_size: 4 * 1024,
            flush_every_bytes: 256 * 1024,
            ..SyncSettings::default()
        },
        ..AppConfig::default()
    };
    let engine = SyncEngine::with_tagger(config, Arc::new(NoopTagger));
    let (tx, rx) = mpsc::channel(200);
    let handle = engine.start_sync(vec![big], &drive, tx).await;
    let snapshots = collect(rx);

    tokio::select! {
        _ = handle.wait() => {}
        _ = tokio::time::sleep(Duration::from_millis(30)) => {}
    }
    handle.stop().await;

    let dest = show_dir(mount.path()).join("2023-11-05 - Marathon.mp3");
    match std::fs::metadata(&dest) {
        Ok(meta) => assert_eq!(meta.len(), 32 * 1024 * 1024),
        Err(_) => assert!(!show_dir(mount.path()).exists()),
    }
    assert!(snapshots.await.unwrap().last().unwrap().complete);
}

#[tokio::test]
async fn synced_episodes_can_be_found_and_deleted() {
    let source = tempfile::tempdir().unwrap();
    let mount = tempfile::tempdir().unwrap();
    let drive = Drive::new("USB", mount.path(), "podcasts");

    let catalog = vec![
        source_episode(source.path(), "Keep", 300),
        source_episode(source.path(), "Drop", 700),
    ];

    let engine = SyncEngine::with_tagger(AppConfig::default(), Arc::new(NoopTagger));
    let (tx, rx) = mpsc::channel(200);
    let handle = engine.start_sync(catalog.clone(), &drive, tx).await;
    collect(rx).await.unwrap();
    handle.wait().await;

    let mut scan = engine.scan_drive(&drive, catalog).unwrap();
    assert!(scan.catalog.iter().all(|e| e.on_drive));
    assert_eq!(scan.drive_episodes.len(), 2);

    for episode in &mut scan.drive_episodes {
        episode.selected = episode.title == "Drop";
    }
    let outcome = engine.delete_selected(&scan.drive_episodes);
    assert_eq!(outcome.completed, 1);
    assert!(outcome.error.is_none());
    assert!(show_dir(mount.path()).join("2023-11-05 - Keep.mp3").exists());
    assert!(!show_dir(mount.path()).join("2023-11-05 - Drop.mp3").exists());

    for episode in &mut scan.drive_episodes {
        episode.selected = true;
    }
    let outcome = engine.delete_selected(&scan.drive_episodes);
    assert_eq!(outcome.completed, 1);
    assert!(outcome.error.is_some());
    assert!(!show_dir(mount.path()).exists());
}
