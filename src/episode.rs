//! Episode data model and the source-catalog collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{SyncError, SyncResult};

/// One media item, either from the catalog or found on a destination drive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Episode {
    pub title: String,
    pub show: String,
    /// `file://` URI or plain path for catalog entries; absolute path for
    /// files found on a drive.
    pub file_path: String,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(rename = "duration_secs", with = "duration_secs")]
    pub duration: Duration,
    pub file_size: u64,
    pub selected: bool,
    pub on_drive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u64>,
}

impl Episode {
    pub fn new(title: impl Into<String>, show: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            show: show.into(),
            file_path: file_path.into(),
            ..Self::default()
        }
    }

    /// Resolves `file_path` to a local filesystem path.
    pub fn local_path(&self) -> SyncResult<PathBuf> {
        uri_to_path(&self.file_path)
    }

    /// One-line summary: show, publish date and duration when known.
    pub fn description(&self) -> String {
        let mut parts = vec![self.show.clone()];
        if let Some(published) = self.published_at {
            parts.push(published.format("%Y-%m-%d").to_string());
        }
        if !self.duration.is_zero() {
            parts.push(format_duration(self.duration));
        }
        parts.join(" • ")
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Source of catalog episodes.
pub trait Catalog {
    fn load(&self) -> SyncResult<Vec<Episode>>;
}

/// Catalog stored as a JSON array of episodes.
pub struct JsonCatalog {
    path: PathBuf,
}

impl JsonCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Catalog for JsonCatalog {
    fn load(&self) -> SyncResult<Vec<Episode>> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| SyncError::Catalog(format!("cannot read {}: {}", self.path.display(), e)))?;
        let mut episodes: Vec<Episode> = serde_json::from_str(&content)?;
        // Flags are run-time state, never trusted from the file.
        for episode in &mut episodes {
            episode.on_drive = false;
        }
        Ok(episodes)
    }
}

/// Converts a `file://` URI (percent-encoded) or a plain path to a local path.
pub fn uri_to_path(uri: &str) -> SyncResult<PathBuf> {
    if let Some((scheme, _)) = uri.split_once("://") {
        if !scheme.eq_ignore_ascii_case("file") {
            return Err(SyncError::UnsupportedScheme(scheme.to_string()));
        }
        let parsed = url::Url::parse(uri).map_err(|e| SyncError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        return parsed.to_file_path().map_err(|_| SyncError::InvalidUri {
            uri: uri.to_string(),
            reason: "not a local file path".to_string(),
        });
    }

    if uri.is_empty() {
        return Err(SyncError::InvalidUri {
            uri: String::new(),
            reason: "empty path".to_string(),
        });
    }
    Ok(PathBuf::from(uri))
}

/// Refreshes `file_size` from disk. A missing file gets size 0; other
/// failures are collected and reported together after every episode is tried.
pub fn restat_sizes<'a>(episodes: impl IntoIterator<Item = &'a mut Episode>) -> SyncResult<()> {
    let mut failures = Vec::new();

    for episode in episodes {
        let path = match episode.local_path() {
            Ok(p) => p,
            Err(e) => {
                failures.push(format!("{}: {}", episode.title, e));
                continue;
            }
        };
        match std::fs::metadata(&path) {
            Ok(meta) => episode.file_size = meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => episode.file_size = 0,
            Err(e) => failures.push(format!("{}: {}", episode.title, e)),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(SyncError::Catalog(format!(
            "failed to stat {} episode(s): {}",
            failures.len(),
            failures.join("; ")
        )))
    }
}

/// Human-readable byte count using binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let unit = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, unit)
}

/// `MM:SS`, or `HH:MM:SS` once an hour is reached.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total / 60) % 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}
