//! Live progress tracking for one transfer batch.
//!
//! A [`TransferSession`] owns a single atomic byte counter fed by the copy
//! loop and a background reporter that samples it on a fixed tick, smooths
//! the rate, and pushes throttled [`ProgressSnapshot`]s onto a bounded
//! queue. The copy loop only sees the [`SessionControl`] surface.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::ProgressConfig;

/// What the copy loop may do to a session.
pub trait SessionControl: Send + Sync {
    /// Records `n` more bytes written to the current file.
    fn write(&self, n: u64);
    /// True once the session has been asked to stop.
    fn is_stopped(&self) -> bool;
    fn start_file(&self, name: &str);
    /// Folds a finished file of `size` bytes into the batch total.
    fn complete_file(&self, size: u64);
}

/// One point-in-time view of a session, as delivered to observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub session_id: Uuid,
    pub current_file: String,
    pub fraction_complete: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: f64,
    pub eta_secs: u64,
    pub files_done: usize,
    pub total_files: usize,
    /// Set only on the last snapshot of a session.
    pub complete: bool,
    pub cancelled: bool,
    pub error: Option<String>,
}

/// Exponentially smoothed transfer rate.
///
/// Time is passed in as elapsed-since-start so the estimator stays a plain
/// value that can be driven directly in tests.
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    smoothing_factor: f64,
    min_recalc_interval: Duration,
    min_sample_window: Duration,
    seed_after: Duration,
    last_sample_at: Duration,
    bytes_at_last_sample: u64,
    speed: f64,
}

impl SpeedEstimator {
    pub fn new(config: &ProgressConfig, initial_bytes: u64) -> Self {
        Self {
            smoothing_factor: config.smoothing_factor,
            min_recalc_interval: config.min_speed_recalc_interval(),
            min_sample_window: config.min_elapsed_for_speed_sample(),
            seed_after: config.speed_seed_after(),
            last_sample_at: Duration::ZERO,
            bytes_at_last_sample: initial_bytes,
            speed: 0.0,
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Feeds the counter value observed `elapsed` after the session started.
    pub fn sample(&mut self, elapsed: Duration, bytes: u64, is_final: bool) -> f64 {
        let window = elapsed.saturating_sub(self.last_sample_at);
        let delta = bytes.saturating_sub(self.bytes_at_last_sample);
        let recalc = is_final || window >= self.min_recalc_interval;

        if recalc && window >= self.min_sample_window && delta > 0 {
            let instant = delta as f64 / window.as_secs_f64();
            self.speed = if self.speed == 0.0 {
                // Seeding from the running average avoids a first reading
                // dominated by startup latency.
                if elapsed > self.seed_after && bytes > 0 {
                    bytes as f64 / elapsed.as_secs_f64()
                } else {
                    instant
                }
            } else {
                self.smoothing_factor * instant + (1.0 - self.smoothing_factor) * self.speed
            };
            self.speed = self.speed.max(0.0);
            self.bytes_at_last_sample = bytes;
            self.last_sample_at = elapsed;
        } else if is_final && self.speed == 0.0 && !elapsed.is_zero() {
            self.speed = bytes as f64 / elapsed.as_secs_f64();
        }

        self.speed
    }
}

/// Seconds left at `speed`, or the sentinel when the speed is negligible.
pub fn eta_secs(remaining: u64, speed: f64, config: &ProgressConfig) -> u64 {
    if remaining == 0 {
        return 0;
    }
    if speed <= config.negligible_speed {
        return config.max_eta_secs;
    }
    let secs = (remaining as f64 / speed).ceil();
    if secs >= config.max_eta_secs as f64 {
        config.max_eta_secs
    } else {
        secs as u64
    }
}

/// Decides which samples are worth sending.
#[derive(Debug, Clone)]
pub struct UpdateThrottle {
    bytes_threshold: u64,
    progress_threshold: f64,
    max_interval: Duration,
    last_sent_bytes: u64,
    last_sent_fraction: f64,
    last_sent_at: Duration,
}

impl UpdateThrottle {
    pub fn new(config: &ProgressConfig, total_bytes: u64) -> Self {
        Self {
            bytes_threshold: config.bytes_threshold_for(total_bytes),
            progress_threshold: config.progress_threshold,
            max_interval: config.max_time_between_updates(),
            last_sent_bytes: 0,
            last_sent_fraction: if total_bytes == 0 { 1.0 } else { 0.0 },
            last_sent_at: Duration::ZERO,
        }
    }

    pub fn bytes_threshold(&self) -> u64 {
        self.bytes_threshold
    }

    pub fn should_send(&self, elapsed: Duration, bytes: u64, fraction: f64, is_final: bool) -> bool {
        is_final
            || bytes.saturating_sub(self.last_sent_bytes) >= self.bytes_threshold
            || (fraction - self.last_sent_fraction).abs() >= self.progress_threshold
            || elapsed.saturating_sub(self.last_sent_at) > self.max_interval
    }

    /// Moves the baseline whether or not the send went through, so the next
    /// comparison is against what was attempted.
    pub fn record_attempt(&mut self, bytes: u64, fraction: f64) {
        self.last_sent_bytes = bytes;
        self.last_sent_fraction = fraction;
    }

    pub fn record_delivery(&mut self, elapsed: Duration) {
        self.last_sent_at = elapsed;
    }
}

#[derive(Debug, Default)]
struct SessionRecord {
    base_offset: u64,
    current_file_bytes: u64,
    current_file: String,
    files_done: usize,
    speed: f64,
    eta_secs: u64,
    finished: bool,
    error: Option<String>,
}

/// State shared between the session handle, the copy loop and the reporter.
struct Shared {
    id: Uuid,
    config: ProgressConfig,
    total_bytes: u64,
    total_files: usize,
    /// Bytes moved across the whole batch. Never decreases.
    bytes: AtomicU64,
    stopping: AtomicBool,
    record: Mutex<SessionRecord>,
    stop_signal: Notify,
    file_boundary: Notify,
}

impl Shared {
    fn signal_stop(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            self.stop_signal.notify_one();
        }
    }

    fn snapshot_from(&self, record: &SessionRecord, bytes: u64, is_final: bool) -> ProgressSnapshot {
        let (bytes_transferred, fraction_complete) = if self.total_bytes > 0 {
            let clamped = bytes.min(self.total_bytes);
            (clamped, clamped as f64 / self.total_bytes as f64)
        } else {
            (bytes, 1.0)
        };

        ProgressSnapshot {
            session_id: self.id,
            current_file: record.current_file.clone(),
            fraction_complete,
            bytes_transferred,
            total_bytes: self.total_bytes,
            speed_bytes_per_sec: record.speed,
            eta_secs: record.eta_secs,
            files_done: record.files_done,
            total_files: self.total_files,
            complete: is_final,
            cancelled: is_final && !record.finished && record.files_done < self.total_files,
            error: if is_final { record.error.clone() } else { None },
        }
    }
}

/// The live progress state of one batch, plus its reporting task.
pub struct TransferSession {
    shared: Arc<Shared>,
    reporter: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TransferSession {
    /// Creates the session and spawns its reporter on the current runtime.
    pub fn start(
        total_bytes: u64,
        total_files: usize,
        config: ProgressConfig,
        tx: mpsc::Sender<ProgressSnapshot>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        if let Err(e) = config.validate() {
            tracing::warn!(session = %id, error = %e, "progress config repaired");
        }
        let shared = Arc::new(Shared {
            id,
            config: config.sanitized(),
            total_bytes,
            total_files,
            bytes: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            record: Mutex::new(SessionRecord::default()),
            stop_signal: Notify::new(),
            file_boundary: Notify::new(),
        });

        tracing::debug!(
            session = %shared.id,
            total_bytes,
            total_files,
            "transfer session started"
        );

        let handle = tokio::spawn(run_reporter(shared.clone(), tx));
        Arc::new(Self {
            shared,
            reporter: tokio::sync::Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn total_bytes(&self) -> u64 {
        self.shared.total_bytes
    }

    pub fn total_files(&self) -> usize {
        self.shared.total_files
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.shared.bytes.load(Ordering::Acquire)
    }

    /// Consistent view of the session right now. Never marked complete.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let record = self.shared.record.lock();
        let bytes = self.shared.bytes.load(Ordering::Acquire);
        self.shared.snapshot_from(&record, bytes, false)
    }

    /// Stops the reporter after one last snapshot, which waits up to
    /// `final_send_timeout` for queue space. Returns only once the reporter
    /// has exited and the queue is closed. Later calls return immediately.
    pub async fn stop(&self) {
        self.shared.signal_stop();

        let mut reporter = self.reporter.lock().await;
        if let Some(handle) = reporter.take() {
            if let Err(e) = handle.await {
                tracing::warn!(session = %self.shared.id, error = %e, "progress reporter failed");
            }
            tracing::debug!(session = %self.shared.id, "transfer session stopped");
        }
    }

    /// Ends the batch normally, or with `error`, and stops. Has no effect on
    /// the final snapshot if the session was already stopped.
    pub async fn finish(&self, error: Option<String>) {
        {
            let mut record = self.shared.record.lock();
            if !self.shared.stopping.load(Ordering::Acquire) {
                record.finished = true;
                record.error = error;
            } else if let Some(e) = error {
                tracing::warn!(session = %self.shared.id, error = %e, "error after session stop");
            }
        }
        self.stop().await;
    }
}

impl SessionControl for TransferSession {
    fn write(&self, n: u64) {
        let total = {
            let mut record = self.shared.record.lock();
            record.current_file_bytes += n;
            record.base_offset + record.current_file_bytes
        };
        self.shared.bytes.fetch_max(total, Ordering::AcqRel);
    }

    fn is_stopped(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    fn start_file(&self, name: &str) {
        {
            let mut record = self.shared.record.lock();
            record.current_file_bytes = 0;
            record.current_file = name.to_string();
            self.shared.bytes.fetch_max(record.base_offset, Ordering::AcqRel);
        }
        self.shared.file_boundary.notify_one();
    }

    fn complete_file(&self, size: u64) {
        {
            let mut record = self.shared.record.lock();
            record.base_offset += size;
            record.current_file_bytes = 0;
            record.files_done += 1;
            self.shared.bytes.fetch_max(record.base_offset, Ordering::AcqRel);
        }
        self.shared.file_boundary.notify_one();
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.shared.signal_stop();
    }
}

struct Reporter {
    shared: Arc<Shared>,
    tx: mpsc::Sender<ProgressSnapshot>,
    started: Instant,
    estimator: SpeedEstimator,
    throttle: UpdateThrottle,
}

async fn run_reporter(shared: Arc<Shared>, tx: mpsc::Sender<ProgressSnapshot>) {
    let mut interval = tokio::time::interval(shared.config.update_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut reporter = Reporter {
        estimator: SpeedEstimator::new(&shared.config, 0),
        throttle: UpdateThrottle::new(&shared.config, shared.total_bytes),
        started: Instant::now(),
        shared,
        tx,
    };

    loop {
        tokio::select! {
            biased;
            _ = reporter.shared.stop_signal.notified() => break,
            _ = reporter.shared.file_boundary.notified() => reporter.report(false).await,
            _ = interval.tick() => {
                if reporter.shared.stopping.load(Ordering::Acquire) {
                    break;
                }
                reporter.report(false).await;
            }
        }
    }

    reporter.report(true).await;
}

impl Reporter {
    async fn report(&mut self, is_final: bool) {
        let elapsed = self.started.elapsed();
        let bytes = self.shared.bytes.load(Ordering::Acquire);
        let config = &self.shared.config;

        let snapshot = {
            let mut record = self.shared.record.lock();
            let speed = self.estimator.sample(elapsed, bytes, is_final);
            record.speed = speed;
            record.eta_secs = eta_secs(self.shared.total_bytes.saturating_sub(bytes), speed, config);
            self.shared.snapshot_from(&record, bytes, is_final)
        };

        if !self
            .throttle
            .should_send(elapsed, bytes, snapshot.fraction_complete, is_final)
        {
            return;
        }
        self.throttle.record_attempt(bytes, snapshot.fraction_complete);

        if is_final {
            match self.tx.send_timeout(snapshot, config.final_send_timeout()).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    tracing::warn!(session = %self.shared.id, "observer not reading, final snapshot dropped");
                }
                Err(SendTimeoutError::Closed(_)) => {
                    tracing::debug!(session = %self.shared.id, "observer gone before final snapshot");
                }
            }
            return;
        }

        match self.tx.send_timeout(snapshot, config.send_timeout()).await {
            Ok(()) => self.throttle.record_delivery(elapsed),
            Err(_) => tracing::trace!(session = %self.shared.id, "progress snapshot dropped"),
        }
    }
}
