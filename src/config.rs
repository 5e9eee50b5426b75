//! Configuration for the sync engine.
//!
//! Everything that used to be a tuned constant lives here so that a session,
//! a matcher or a sync run can be built with explicit values in tests.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{SyncError, SyncResult};
use crate::naming::NamingTemplate;

const CONFIG_DIR_NAME: &str = "podcast-sync";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Top-level application configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory whose children are candidate destination volumes.
    pub volumes_path: PathBuf,
    /// Subfolder on the destination volume that holds the show folders.
    pub destination_folder: String,
    /// Volume names never offered as destinations.
    pub excluded_volumes: Vec<String>,
    /// Log level used when `PODCAST_SYNC_LOG` is not set.
    pub log_level: String,
    pub template: NamingTemplate,
    pub progress: ProgressConfig,
    pub matcher: MatcherConfig,
    pub sync: SyncSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            volumes_path: default_volumes_path(),
            destination_folder: "podcasts".to_string(),
            excluded_volumes: vec!["Macintosh HD".to_string()],
            log_level: "info".to_string(),
            template: NamingTemplate::default(),
            progress: ProgressConfig::default(),
            matcher: MatcherConfig::default(),
            sync: SyncSettings::default(),
        }
    }
}

fn default_volumes_path() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/Volumes")
    }

    #[cfg(not(target_os = "macos"))]
    {
        PathBuf::from("/media")
    }
}

/// Tuning for the transfer/progress subsystem.
///
/// Durations are stored in milliseconds so the TOML stays readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Reporting task tick.
    pub update_interval_ms: u64,
    /// Force a snapshot at least this often while bytes are moving.
    pub max_time_between_updates_ms: u64,
    /// Minimum spacing between two speed recalculations.
    pub min_speed_recalc_interval_ms: u64,
    /// Minimum sample window for an instantaneous rate to count.
    pub min_elapsed_for_speed_sample_ms: u64,
    /// EMA weight given to the newest sample (0 < factor <= 1).
    pub smoothing_factor: f64,
    /// Overall elapsed time after which the first speed reading is seeded
    /// from the running average instead of a single sample.
    pub speed_seed_after_ms: u64,
    /// Byte delta threshold as a fraction of the batch total.
    pub bytes_threshold_fraction: f64,
    /// Lower bound of the byte delta threshold.
    pub min_bytes_threshold: u64,
    /// Upper bound of the byte delta threshold.
    pub max_bytes_threshold: u64,
    /// Fractional progress change that forces a snapshot.
    pub progress_threshold: f64,
    /// How long a throttled snapshot may wait for queue space before it is dropped.
    pub send_timeout_ms: u64,
    /// How long the final snapshot may wait for queue space. Bounds how
    /// long a stop can block on an observer that stopped reading.
    pub final_send_timeout_ms: u64,
    /// Rates at or below this are treated as "no speed yet".
    pub negligible_speed: f64,
    /// ETA reported when the speed is negligible.
    pub max_eta_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 33,
            max_time_between_updates_ms: 200,
            min_speed_recalc_interval_ms: 200,
            min_elapsed_for_speed_sample_ms: 200,
            smoothing_factor: 0.2,
            speed_seed_after_ms: 1000,
            bytes_threshold_fraction: 0.0005,
            min_bytes_threshold: 32 * 1024,
            max_bytes_threshold: 512 * 1024,
            progress_threshold: 0.003,
            send_timeout_ms: 33,
            final_send_timeout_ms: 1000,
            negligible_speed: 1.0,
            max_eta_secs: 359_999,
        }
    }
}

impl ProgressConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn max_time_between_updates(&self) -> Duration {
        Duration::from_millis(self.max_time_between_updates_ms)
    }

    pub fn min_speed_recalc_interval(&self) -> Duration {
        Duration::from_millis(self.min_speed_recalc_interval_ms)
    }

    pub fn min_elapsed_for_speed_sample(&self) -> Duration {
        Duration::from_millis(self.min_elapsed_for_speed_sample_ms)
    }

    pub fn speed_seed_after(&self) -> Duration {
        Duration::from_millis(self.speed_seed_after_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn final_send_timeout(&self) -> Duration {
        Duration::from_millis(self.final_send_timeout_ms)
    }

    /// Byte delta that forces a snapshot for a batch of `total` bytes.
    pub fn bytes_threshold_for(&self, total: u64) -> u64 {
        let scaled = (total as f64 * self.bytes_threshold_fraction) as u64;
        scaled.max(self.min_bytes_threshold).min(self.max_bytes_threshold)
    }

    /// Copy with every value [`validate`](Self::validate) would reject
    /// replaced by something usable: a zero tick becomes 1 ms, swapped
    /// bounds are reordered, and bad smoothing or thresholds fall back to
    /// their defaults.
    pub fn sanitized(&self) -> Self {
        let defaults = Self::default();
        let mut config = self.clone();
        config.update_interval_ms = config.update_interval_ms.max(1);
        if config.min_bytes_threshold > config.max_bytes_threshold {
            std::mem::swap(&mut config.min_bytes_threshold, &mut config.max_bytes_threshold);
        }
        if !(config.smoothing_factor > 0.0 && config.smoothing_factor <= 1.0) {
            config.smoothing_factor = defaults.smoothing_factor;
        }
        if config.progress_threshold.is_nan() || config.progress_threshold < 0.0 {
            config.progress_threshold = defaults.progress_threshold;
        }
        if config.bytes_threshold_fraction.is_nan() || config.bytes_threshold_fraction < 0.0 {
            config.bytes_threshold_fraction = defaults.bytes_threshold_fraction;
        }
        config
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.update_interval_ms == 0 {
            return Err(SyncError::Config("update_interval_ms must be positive".into()));
        }
        if !(self.smoothing_factor > 0.0 && self.smoothing_factor <= 1.0) {
            return Err(SyncError::Config(format!(
                "smoothing_factor must be in (0, 1], got {}",
                self.smoothing_factor
            )));
        }
        if self.min_bytes_threshold > self.max_bytes_threshold {
            return Err(SyncError::Config(format!(
                "min_bytes_threshold ({}) exceeds max_bytes_threshold ({})",
                self.min_bytes_threshold, self.max_bytes_threshold
            )));
        }
        if self.progress_threshold < 0.0 || self.bytes_threshold_fraction < 0.0 {
            return Err(SyncError::Config("thresholds must not be negative".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Relative duration tolerance for the size-collision tiebreak.
    pub duration_tolerance: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            duration_tolerance: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub copy_buffer_size: usize,
    /// Destination is fsync'd every time this many bytes have been written.
    pub flush_every_bytes: u64,
    /// Capacity of the snapshot queue handed to observers.
    pub queue_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            copy_buffer_size: 1024 * 1024,
            flush_every_bytes: 8 * 1024 * 1024,
            queue_capacity: 200,
        }
    }
}

/// Default location of the config file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Loads configuration from `path`, or from the default location.
/// A missing file yields the defaults.
pub fn load(path: Option<&Path>) -> SyncResult<AppConfig> {
    let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(p) => p,
        None => return Ok(AppConfig::default()),
    };

    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(AppConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|e| SyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let config = parse(&content)?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Parses and validates a TOML config document.
pub fn parse(content: &str) -> SyncResult<AppConfig> {
    let config: AppConfig =
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))?;
    config.progress.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.destination_folder, "podcasts");
        assert_eq!(config.progress, ProgressConfig::default());
        assert_eq!(config.matcher.duration_tolerance, 0.02);
        assert_eq!(config.template.episode_format, "{date} - {title}");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = parse(
            r#"
            destination_folder = "shows"

            [progress]
            smoothing_factor = 0.5

            [template]
            date_format = "%d.%m.%Y"
            "#,
        )
        .unwrap();
        assert_eq!(config.destination_folder, "shows");
        assert_eq!(config.progress.smoothing_factor, 0.5);
        assert_eq!(config.progress.update_interval_ms, 33);
        assert_eq!(config.template.date_format, "%d.%m.%Y");
        assert!(config.template.sanitize_names);
    }

    #[test]
    fn invalid_smoothing_is_rejected() {
        let err = parse("[progress]\nsmoothing_factor = 0.0\n").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn bytes_threshold_is_clamped() {
        let config = ProgressConfig::default();
        assert_eq!(config.bytes_threshold_for(0), 32 * 1024);
        assert_eq!(config.bytes_threshold_for(1_000_000), 32 * 1024);
        // 0.05% of 200 MB = 100 KB
        assert_eq!(config.bytes_threshold_for(200_000_000), 100_000);
        assert_eq!(config.bytes_threshold_for(10_000_000_000), 512 * 1024);
    }

    #[test]
    fn sanitized_repairs_values_that_would_panic() {
        let config = ProgressConfig {
            update_interval_ms: 0,
            min_bytes_threshold: 512 * 1024,
            max_bytes_threshold: 32 * 1024,
            smoothing_factor: 0.0,
            ..ProgressConfig::default()
        };
        assert!(config.validate().is_err());

        let fixed = config.sanitized();
        assert!(fixed.validate().is_ok());
        assert_eq!(fixed.update_interval(), Duration::from_millis(1));
        assert_eq!(fixed.min_bytes_threshold, 32 * 1024);
        assert_eq!(fixed.max_bytes_threshold, 512 * 1024);
        assert_eq!(fixed.smoothing_factor, 0.2);
        assert_eq!(ProgressConfig::default().sanitized(), ProgressConfig::default());
    }

    #[test]
    fn inverted_bounds_do_not_panic_threshold() {
        let config = ProgressConfig {
            min_bytes_threshold: 100,
            max_bytes_threshold: 10,
            ..ProgressConfig::default()
        };
        assert_eq!(config.bytes_threshold_for(1_000_000), 10);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(config.sync, SyncSettings::default());
    }
}
