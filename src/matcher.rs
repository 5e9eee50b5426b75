//! Matching of destination files against catalog episodes.
//!
//! Signals are tried cheapest first: expected path, unique size, duration
//! among equal sizes, then content hash. The first hit wins.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::config::MatcherConfig;
use crate::episode::Episode;
use crate::errors::SyncResult;
use crate::file_ops::compute_file_hash;
use crate::naming::{expected_path, NamingTemplate};
use crate::tagging::read_duration;

/// Which signal produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Path,
    UniqueSize,
    Duration,
    Checksum,
}

/// Content digest used by the last matching stage.
pub trait ContentHasher: Send + Sync {
    fn hash(&self, path: &Path) -> SyncResult<u64>;
}

/// Streams the file through xxh3.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileHasher;

impl ContentHasher for FileHasher {
    fn hash(&self, path: &Path) -> SyncResult<u64> {
        compute_file_hash(path)
    }
}

/// Playback length of a drive file whose name carried none.
pub trait DurationReader: Send + Sync {
    fn duration(&self, path: &Path) -> Option<Duration>;
}

/// Reads the length from the audio headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct AudioDurationReader;

impl DurationReader for AudioDurationReader {
    fn duration(&self, path: &Path) -> Option<Duration> {
        match read_duration(path) {
            Ok(d) if !d.is_zero() => Some(d),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "no duration");
                None
            }
        }
    }
}

/// Size and expected-path lookups over a catalog, built once per scan.
#[derive(Debug, Default)]
pub struct DestinationIndex {
    by_size: HashMap<u64, Vec<usize>>,
    by_path: HashMap<PathBuf, usize>,
}

impl DestinationIndex {
    pub fn build(catalog: &[Episode], template: &NamingTemplate) -> Self {
        let mut index = Self::default();
        for (i, episode) in catalog.iter().enumerate() {
            if episode.file_size > 0 {
                index.by_size.entry(episode.file_size).or_default().push(i);
            }
            index.by_path.entry(expected_path(template, episode)).or_insert(i);
        }
        index
    }

    pub fn by_path(&self, relative: &Path) -> Option<usize> {
        self.by_path.get(relative).copied()
    }

    pub fn by_size(&self, size: u64) -> &[usize] {
        self.by_size.get(&size).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Reduces a drive path to its `show/episode` tail.
pub fn canonicalize_for_matching(path: &Path) -> PathBuf {
    let parts: Vec<_> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    let tail = parts.len().saturating_sub(2);
    parts[tail..].iter().collect()
}

pub struct EpisodeMatcher {
    catalog: Vec<Episode>,
    index: DestinationIndex,
    config: MatcherConfig,
    hasher: Box<dyn ContentHasher>,
    durations: Box<dyn DurationReader>,
}

impl EpisodeMatcher {
    pub fn new(catalog: Vec<Episode>, template: &NamingTemplate, config: MatcherConfig) -> Self {
        let index = DestinationIndex::build(&catalog, template);
        Self {
            catalog,
            index,
            config,
            hasher: Box::new(FileHasher),
            durations: Box::new(AudioDurationReader),
        }
    }

    pub fn with_hasher(mut self, hasher: impl ContentHasher + 'static) -> Self {
        self.hasher = Box::new(hasher);
        self
    }

    pub fn with_duration_reader(mut self, reader: impl DurationReader + 'static) -> Self {
        self.durations = Box::new(reader);
        self
    }

    pub fn catalog(&self) -> &[Episode] {
        &self.catalog
    }

    /// The catalog with `on_drive` set on every matched entry.
    pub fn into_catalog(self) -> Vec<Episode> {
        self.catalog
    }

    /// Tries to pair `candidate` with a catalog entry. On success both sides
    /// are flagged as present and the candidate takes the catalog metadata.
    pub fn match_candidate(&mut self, candidate: &mut Episode) -> Option<MatchKind> {
        let found = self.find(candidate);
        if let Some((i, kind)) = found {
            apply_match(candidate, &mut self.catalog[i]);
            tracing::debug!(
                file = %candidate.file_path,
                title = %candidate.title,
                ?kind,
                "matched drive file"
            );
            Some(kind)
        } else {
            tracing::debug!(file = %candidate.file_path, "no catalog match");
            None
        }
    }

    fn find(&mut self, candidate: &mut Episode) -> Option<(usize, MatchKind)> {
        let relative = canonicalize_for_matching(Path::new(&candidate.file_path));
        if let Some(i) = self.index.by_path(&relative) {
            return Some((i, MatchKind::Path));
        }

        if candidate.file_size == 0 {
            return None;
        }
        let same_size = self.index.by_size(candidate.file_size).to_vec();
        match same_size.len() {
            0 => None,
            1 => Some((same_size[0], MatchKind::UniqueSize)),
            _ => {
                // Only read headers when a tiebreak is actually needed.
                if candidate.duration.is_zero() {
                    if let Some(d) = self.durations.duration(Path::new(&candidate.file_path)) {
                        candidate.duration = d;
                    }
                }
                self.match_by_duration(candidate, &same_size)
                .map(|i| (i, MatchKind::Duration))
                .or_else(|| {
                    self.match_by_checksum(candidate, &same_size)
                        .map(|i| (i, MatchKind::Checksum))
                })
            }
        }
    }

    /// Accepts only when exactly one entry is within tolerance.
    fn match_by_duration(&self, candidate: &Episode, indices: &[usize]) -> Option<usize> {
        let duration = candidate.duration.as_secs_f64();
        if duration <= 0.0 {
            return None;
        }
        let tolerance = duration * self.config.duration_tolerance;

        let mut within = indices.iter().copied().filter(|&i| {
            let other = self.catalog[i].duration.as_secs_f64();
            other > 0.0 && (duration - other).abs() <= tolerance
        });
        match (within.next(), within.next()) {
            (Some(i), None) => Some(i),
            _ => None,
        }
    }

    fn match_by_checksum(&mut self, candidate: &Episode, indices: &[usize]) -> Option<usize> {
        let candidate_hash = match candidate
            .checksum
            .map(Ok)
            .unwrap_or_else(|| self.hasher.hash(Path::new(&candidate.file_path)))
        {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!(file = %candidate.file_path, error = %e, "skipping checksum match");
                return None;
            }
        };

        for &i in indices {
            let entry = &mut self.catalog[i];
            let hash = match entry.checksum {
                Some(h) => h,
                None => {
                    let computed = entry
                        .local_path()
                        .and_then(|path| self.hasher.hash(&path));
                    match computed {
                        Ok(h) => {
                            entry.checksum = Some(h);
                            h
                        }
                        Err(e) => {
                            tracing::debug!(title = %entry.title, error = %e, "catalog file unreadable");
                            continue;
                        }
                    }
                }
            };
            if hash == candidate_hash {
                return Some(i);
            }
        }
        None
    }
}

fn apply_match(candidate: &mut Episode, entry: &mut Episode) {
    candidate.on_drive = true;
    candidate.title = entry.title.clone();
    candidate.show = entry.show.clone();
    candidate.duration = entry.duration;
    candidate.published_at = entry.published_at;

    entry.on_drive = true;
}
