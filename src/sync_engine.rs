//! Orchestration of scans, syncs and deletions against one drive.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::episode::{restat_sizes, Episode};
use crate::errors::{IoContext, SyncError, SyncResult};
use crate::file_ops::{
    copy_file_with_progress, remove_dir_if_empty, remove_partial, scan_audio_files, CopyOptions,
    CopyOutcome,
};
use crate::matcher::EpisodeMatcher;
use crate::naming::{expected_path, parse_episode_path, NamingTemplate};
use crate::tagging::{LoftyTagger, Tagger};
use crate::transfer_state::{ProgressSnapshot, SessionControl, TransferSession};
use crate::volume_watcher::Drive;

/// Caller's grip on a running sync.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<TransferSession>,
    copy_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.session.id()
    }

    pub fn is_stopped(&self) -> bool {
        self.session.is_stopped()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.session.snapshot()
    }

    /// Cancels the sync and waits until the copy loop has cleaned up.
    /// Calling it after the sync ended is a no-op.
    pub async fn stop(&self) {
        self.session.stop().await;
        self.wait().await;
    }

    /// Waits for the copy loop to finish on its own. Dropping this future
    /// early leaves the loop attached, so a later `stop` still waits for it.
    pub async fn wait(&self) {
        let mut task = self.copy_task.lock().await;
        if let Some(handle) = task.as_mut() {
            let result = handle.await;
            *task = None;
            if let Err(e) = result {
                tracing::error!(session = %self.session.id(), error = %e, "copy loop panicked");
            }
        }
    }
}

/// Result of [`SyncEngine::delete_selected`]: how many files went, and the
/// first failure if any.
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    pub completed: usize,
    pub error: Option<SyncError>,
}

/// Drive contents after matching.
#[derive(Debug, Default)]
pub struct DriveScan {
    /// Audio files found on the drive, enriched where a match was found.
    pub drive_episodes: Vec<Episode>,
    /// The catalog with `on_drive` set for every matched entry.
    pub catalog: Vec<Episode>,
}

/// One file still to be copied.
struct CopyJob {
    episode: Episode,
    dest: PathBuf,
}

pub struct SyncEngine {
    config: Arc<AppConfig>,
    tagger: Arc<dyn Tagger>,
    active: Mutex<Option<SessionHandle>>,
}

impl SyncEngine {
    pub fn new(config: AppConfig) -> Self {
        Self::with_tagger(config, Arc::new(LoftyTagger))
    }

    pub fn with_tagger(config: AppConfig, tagger: Arc<dyn Tagger>) -> Self {
        Self {
            config: Arc::new(config),
            tagger,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Walks the drive's podcast folder and matches every audio file found
    /// against `catalog`.
    pub fn scan_drive(&self, drive: &Drive, catalog: Vec<Episode>) -> SyncResult<DriveScan> {
        let root = drive.podcast_dir();
        tracing::info!(drive = %drive.name, root = %root.display(), "scanning drive");

        let files = scan_audio_files(&root)?;
        let mut matcher = EpisodeMatcher::new(catalog, &self.config.template, self.config.matcher.clone());

        let mut drive_episodes = Vec::with_capacity(files.len());
        let mut matched = 0;
        for file in files {
            let mut episode = parse_episode_path(&file.path, &self.config.template);
            episode.file_size = file.size;
            if matcher.match_candidate(&mut episode).is_some() {
                matched += 1;
            }
            drive_episodes.push(episode);
        }

        tracing::info!(found = drive_episodes.len(), matched, "drive scan complete");
        Ok(DriveScan {
            drive_episodes,
            catalog: matcher.into_catalog(),
        })
    }

    /// Copies the selected `episodes` onto `drive`, reporting progress on
    /// `tx`. Episodes already present at their expected path are left out
    /// of the batch. The queue always ends with one `complete` snapshot and
    /// is closed afterwards.
    ///
    /// A sync already running on this engine is stopped first.
    pub async fn start_sync(
        &self,
        episodes: Vec<Episode>,
        drive: &Drive,
        tx: mpsc::Sender<ProgressSnapshot>,
    ) -> SessionHandle {
        let config = self.config.clone();
        let root = drive.podcast_dir();
        let prepared = tokio::task::spawn_blocking(move || prepare(&config, episodes, &root))
            .await
            .map_err(|e| SyncError::Internal(e.to_string()))
            .and_then(|jobs| jobs);

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            tracing::debug!(session = %previous.id(), "stopping previous sync");
            previous.stop().await;
        }

        let handle = match prepared {
            Ok(jobs) => {
                let total_bytes = jobs.iter().map(|j| j.episode.file_size).sum();
                let session =
                    TransferSession::start(total_bytes, jobs.len(), self.config.progress.clone(), tx);
                tracing::info!(
                    session = %session.id(),
                    files = jobs.len(),
                    bytes = total_bytes,
                    drive = %drive.name,
                    "sync started"
                );

                let task = tokio::spawn(run_copy_loop(
                    session.clone(),
                    jobs,
                    CopyOptions::from(&self.config.sync),
                    self.tagger.clone(),
                ));
                SessionHandle {
                    session,
                    copy_task: Arc::new(Mutex::new(Some(task))),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "sync could not start");
                let session = TransferSession::start(0, 0, self.config.progress.clone(), tx);
                session.finish(Some(e.to_string())).await;
                SessionHandle {
                    session,
                    copy_task: Arc::new(Mutex::new(None)),
                }
            }
        };

        *active = Some(handle.clone());
        handle
    }

    /// Stops the running sync, if any.
    pub async fn stop_active(&self) {
        if let Some(handle) = self.active.lock().await.take() {
            handle.stop().await;
        }
    }

    /// Removes the selected episodes' files from the drive, then every
    /// folder left empty by that. Keeps going past failures and returns the
    /// first one.
    pub fn delete_selected(&self, episodes: &[Episode]) -> DeleteOutcome {
        let mut outcome = DeleteOutcome::default();
        let mut touched: Vec<PathBuf> = Vec::new();

        for episode in episodes.iter().filter(|e| e.selected) {
            let result = episode.local_path().and_then(|path| {
                std::fs::remove_file(&path).op_context("delete episode", &path)?;
                Ok(path)
            });

            match result {
                Ok(path) => {
                    tracing::info!(path = %path.display(), "deleted episode");
                    outcome.completed += 1;
                    if let Some(parent) = path.parent() {
                        if !touched.iter().any(|p| p == parent) {
                            touched.push(parent.to_path_buf());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(title = %episode.title, error = %e, "delete failed");
                    outcome.error.get_or_insert(e);
                }
            }
        }

        for dir in touched {
            if remove_dir_if_empty(&dir) {
                tracing::debug!(dir = %dir.display(), "removed empty show folder");
            }
        }

        outcome
    }
}

/// Restats the selected episodes, creates the podcast folder and plans the
/// copies. Runs on the blocking pool.
fn prepare(config: &AppConfig, episodes: Vec<Episode>, root: &Path) -> SyncResult<Vec<CopyJob>> {
    let mut selected: Vec<Episode> = episodes.into_iter().filter(|e| e.selected).collect();
    if let Err(e) = restat_sizes(selected.iter_mut()) {
        tracing::warn!(error = %e, "could not refresh some episode sizes");
    }

    std::fs::create_dir_all(root).op_context("create destination folder", root)?;
    Ok(plan(&config.template, selected, root))
}

/// Destination paths for the episodes that still need copying.
fn plan(template: &NamingTemplate, selected: Vec<Episode>, root: &Path) -> Vec<CopyJob> {
    selected
        .into_iter()
        .filter_map(|episode| {
            let dest = root.join(expected_path(template, &episode));
            if dest.exists() {
                tracing::debug!(dest = %dest.display(), "already on drive, skipping");
                None
            } else {
                Some(CopyJob { episode, dest })
            }
        })
        .collect()
}

enum LoopEnd {
    Done,
    Cancelled,
}

async fn run_copy_loop(
    session: Arc<TransferSession>,
    jobs: Vec<CopyJob>,
    options: CopyOptions,
    tagger: Arc<dyn Tagger>,
) {
    let id = session.id();
    match copy_all(&session, jobs, &options, &tagger).await {
        Ok(LoopEnd::Done) => {
            tracing::info!(session = %id, "sync complete");
            session.finish(None).await;
        }
        Ok(LoopEnd::Cancelled) => {
            tracing::info!(session = %id, "sync cancelled");
            session.finish(None).await;
        }
        Err(e) => {
            tracing::error!(session = %id, error = %e, "sync failed");
            session.finish(Some(e.to_string())).await;
        }
    }
}

async fn copy_all(
    session: &Arc<TransferSession>,
    jobs: Vec<CopyJob>,
    options: &CopyOptions,
    tagger: &Arc<dyn Tagger>,
) -> SyncResult<LoopEnd> {
    for job in jobs {
        if session.is_stopped() {
            return Ok(LoopEnd::Cancelled);
        }

        let source = job.episode.local_path()?;
        if let Some(show_dir) = job.dest.parent() {
            std::fs::create_dir_all(show_dir).op_context("create show folder", show_dir)?;
        }

        let file_name = job
            .dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if job.dest.exists() {
            tracing::debug!(dest = %job.dest.display(), "appeared on drive meanwhile, skipping");
            session.start_file(&file_name);
            session.complete_file(job.episode.file_size);
            continue;
        }

        session.start_file(&file_name);
        tracing::debug!(source = %source.display(), dest = %job.dest.display(), "copying");

        let copy_session = session.clone();
        let copy_options = options.clone();
        let dest = job.dest.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            copy_file_with_progress(&source, &dest, &copy_options, copy_session.as_ref())
        })
        .await
        .map_err(|e| SyncError::Internal(e.to_string()))?;

        match outcome {
            Ok(CopyOutcome::Completed { bytes }) => {
                session.complete_file(bytes);
                tag_best_effort(tagger, job.dest, job.episode).await;
            }
            Ok(CopyOutcome::Cancelled { bytes_written }) => {
                tracing::info!(
                    dest = %job.dest.display(),
                    bytes_written,
                    "removing partial file"
                );
                remove_partial(&job.dest);
                return Ok(LoopEnd::Cancelled);
            }
            Err(e) => {
                remove_partial(&job.dest);
                return Err(e);
            }
        }
    }

    Ok(LoopEnd::Done)
}

async fn tag_best_effort(tagger: &Arc<dyn Tagger>, dest: PathBuf, episode: Episode) {
    let tagger = tagger.clone();
    let result = tokio::task::spawn_blocking(move || tagger.tag(&dest, &episode)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "tagging failed"),
        Err(e) => tracing::warn!(error = %e, "tagging task failed"),
    }
}
