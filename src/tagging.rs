//! Audio metadata: best-effort tagging of copied episodes and reading
//! their playback length.

use chrono::Datelike;
use lofty::config::WriteOptions;
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::probe::Probe;
use lofty::tag::{Accessor, Tag, TagExt, TagType};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::episode::Episode;
use crate::errors::{SyncError, SyncResult};

const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Writes episode metadata into a file on the destination. Failures are
/// reported but never fail a sync.
pub trait Tagger: Send + Sync {
    fn tag(&self, path: &Path, episode: &Episode) -> SyncResult<()>;
}

/// Leaves files untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTagger;

impl Tagger for NoopTagger {
    fn tag(&self, _path: &Path, _episode: &Episode) -> SyncResult<()> {
        Ok(())
    }
}

/// ID3v2.3 tags on MP3 files; other formats are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyTagger;

impl Tagger for LoftyTagger {
    fn tag(&self, path: &Path, episode: &Episode) -> SyncResult<()> {
        let is_mp3 = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mp3"));
        if !is_mp3 {
            return Ok(());
        }

        cleanup_temp_files(path);
        let mut result = write_tags(path, episode);
        if result.is_err() {
            std::thread::sleep(RETRY_DELAY);
            cleanup_temp_files(path);
            result = write_tags(path, episode);
        }
        cleanup_temp_files(path);

        result
    }
}

/// Playback length from the file's audio properties.
pub fn read_duration(path: &Path) -> SyncResult<Duration> {
    let tagged_file = Probe::open(path)
        .and_then(|probe| probe.read())
        .map_err(|e| SyncError::Tagging {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(tagged_file.properties().duration())
}

/// Leftovers from interrupted tag rewrites on FAT volumes.
fn temp_files(path: &Path) -> [PathBuf; 2] {
    let mut id3v2 = path.as_os_str().to_owned();
    id3v2.push("-id3v2");
    let mut id3 = path.as_os_str().to_owned();
    id3.push(".id3");
    [PathBuf::from(id3v2), PathBuf::from(id3)]
}

fn cleanup_temp_files(path: &Path) {
    for temp in temp_files(path) {
        if temp.exists() {
            if let Err(e) = std::fs::remove_file(&temp) {
                tracing::warn!(path = %temp.display(), error = %e, "could not remove tag temp file");
            }
        }
    }
}

fn write_tags(path: &Path, episode: &Episode) -> SyncResult<()> {
    let fail = |reason: String| SyncError::Tagging {
        path: path.to_path_buf(),
        reason,
    };

    let mut tagged_file = Probe::open(path)
        .and_then(|probe| probe.read())
        .map_err(|e| fail(e.to_string()))?;

    if tagged_file.tag(TagType::Id3v2).is_none() {
        tagged_file.insert_tag(Tag::new(TagType::Id3v2));
    }
    let tag = tagged_file
        .tag_mut(TagType::Id3v2)
        .ok_or_else(|| fail("no ID3v2 tag".to_string()))?;

    if !episode.title.is_empty() {
        tag.set_title(episode.title.clone());
    }
    if !episode.show.is_empty() {
        tag.set_artist(episode.show.clone());
        tag.set_album(episode.show.clone());
    }
    tag.set_genre("Podcast".to_string());
    if let Some(published) = episode.published_at {
        if let Ok(year) = u32::try_from(published.year()) {
            tag.set_year(year);
        }
        tag.set_comment(format!("Published: {}", published.format("%Y-%m-%d")));
    }

    tag.save_to_path(path, WriteOptions::default().use_id3v23(true))
        .map_err(|e| fail(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_mp3_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ep.m4a");
        std::fs::write(&path, b"not really audio").unwrap();

        LoftyTagger.tag(&path, &Episode::new("T", "S", "/x.m4a")).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"not really audio");
    }

    #[test]
    fn temp_files_are_removed_even_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ep.mp3");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        let [id3v2, id3] = temp_files(&path);
        std::fs::write(&id3v2, b"stale").unwrap();
        std::fs::write(&id3, b"stale").unwrap();

        let _ = LoftyTagger.tag(&path, &Episode::new("T", "S", "/x.mp3"));

        assert!(!id3v2.exists());
        assert!(!id3.exists());
        assert!(path.exists());
    }

    #[test]
    fn duration_of_non_audio_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"plain text, no frames").unwrap();
        assert!(read_duration(&path).is_err());
        assert!(read_duration(&dir.path().join("absent.mp3")).is_err());
    }

    #[test]
    fn temp_file_names() {
        let [a, b] = temp_files(Path::new("/d/Show/ep.mp3"));
        assert_eq!(a, PathBuf::from("/d/Show/ep.mp3-id3v2"));
        assert_eq!(b, PathBuf::from("/d/Show/ep.mp3.id3"));
    }
}
