//! File operations for the sync engine.

use globset::{GlobBuilder, GlobMatcher};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use xxhash_rust::xxh3::Xxh3;

use crate::config::SyncSettings;
use crate::errors::{IoContext, SyncError, SyncResult};
use crate::transfer_state::SessionControl;

pub const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Extensions recognised as audio when scanning a destination.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "wav", "aac", "ogg", "flac"];

/// Names created by the OS on removable media. They never count as content.
const SYSTEM_HIDDEN_FILES: &[&str] = &[
    ".DS_Store",
    ".Spotlight-V100",
    ".Trashes",
    ".fseventsd",
    ".TemporaryItems",
    ".VolumeIcon.icns",
    ".com.apple.timemachine.donotpresent",
    ".DocumentRevisions-V100",
    ".PKInstallSandboxManager",
];

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub buffer_size: usize,
    /// Destination data is synced to stable storage each time this many
    /// bytes have been written since the previous sync.
    pub flush_every_bytes: u64,
    pub preserve_mtime: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for CopyOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            buffer_size: settings.copy_buffer_size.max(1),
            flush_every_bytes: settings.flush_every_bytes,
            preserve_mtime: true,
        }
    }
}

/// How a copy ended. Cancellation is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Completed { bytes: u64 },
    Cancelled { bytes_written: u64 },
}

/// Streaming xxh3 digest of a file's contents.
pub fn compute_file_hash(path: &Path) -> SyncResult<u64> {
    let file = File::open(path).op_context("open for hashing", path)?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut hasher = Xxh3::new();

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SyncError::io("read for hashing", path, e)),
        };
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.digest())
}

/// Copies `source` to `dest` through `control`, which is told about every
/// chunk written and polled for cancellation before every read.
///
/// On cancellation the partially written destination is left in place; the
/// caller owns cleanup since it also knows about the enclosing folder.
pub fn copy_file_with_progress<C>(
    source: &Path,
    dest: &Path,
    options: &CopyOptions,
    control: &C,
) -> SyncResult<CopyOutcome>
where
    C: SessionControl + ?Sized,
{
    let src_file = File::open(source).op_context("open source", source)?;
    let src_mtime = src_file.metadata().and_then(|m| m.modified()).ok();

    let dest_file = File::create(dest).op_context("create destination", dest)?;

    let mut reader = BufReader::with_capacity(options.buffer_size, src_file);
    let mut writer = BufWriter::with_capacity(options.buffer_size, dest_file);
    let mut buffer = vec![0u8; options.buffer_size];
    let mut bytes_copied: u64 = 0;
    let mut since_flush: u64 = 0;

    loop {
        if control.is_stopped() {
            return Ok(CopyOutcome::Cancelled {
                bytes_written: bytes_copied,
            });
        }

        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SyncError::io("read source", source, e)),
        };

        writer
            .write_all(&buffer[..bytes_read])
            .op_context("write destination", dest)?;
        bytes_copied += bytes_read as u64;
        since_flush += bytes_read as u64;
        control.write(bytes_read as u64);

        if options.flush_every_bytes > 0 && since_flush >= options.flush_every_bytes {
            writer.flush().op_context("flush destination", dest)?;
            writer.get_ref().sync_data().op_context("sync destination", dest)?;
            since_flush = 0;
        }
    }

    writer.flush().op_context("flush destination", dest)?;
    let dest_file = writer
        .into_inner()
        .map_err(|e| SyncError::io("flush destination", dest, e.into_error()))?;
    dest_file.sync_all().op_context("sync destination", dest)?;
    drop(dest_file);

    if options.preserve_mtime {
        if let Some(mtime) = src_mtime {
            let _ = filetime::set_file_mtime(dest, filetime::FileTime::from_system_time(mtime));
        }
    }

    Ok(CopyOutcome::Completed {
        bytes: bytes_copied,
    })
}

/// True for OS-generated artifacts such as `.DS_Store` or AppleDouble `._*` files.
pub fn is_system_hidden_file(name: &str) -> bool {
    SYSTEM_HIDDEN_FILES.contains(&name) || name.starts_with("._")
}

/// A directory is empty when everything left in it is a system artifact.
pub fn is_dir_empty(path: &Path) -> SyncResult<bool> {
    for entry in fs::read_dir(path).op_context("read directory", path)? {
        let entry = entry.op_context("read directory", path)?;
        if !is_system_hidden_file(&entry.file_name().to_string_lossy()) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Removes system artifacts from `dir`. Best effort; failures are ignored.
pub fn cleanup_system_hidden_files(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        if !is_system_hidden_file(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        let removed = match entry.file_type() {
            Ok(t) if t.is_dir() => fs::remove_dir_all(&path),
            _ => fs::remove_file(&path),
        };
        if let Err(e) = removed {
            tracing::debug!(path = %path.display(), error = %e, "could not remove system file");
        }
    }
}

/// Removes `dir` if it holds nothing but system artifacts. Returns whether
/// the directory is gone afterwards.
pub fn remove_dir_if_empty(dir: &Path) -> bool {
    match is_dir_empty(dir) {
        Ok(true) => {
            cleanup_system_hidden_files(dir);
            match fs::remove_dir(dir) {
                Ok(()) => true,
                Err(e) if e.kind() == ErrorKind::NotFound => true,
                Err(e) => {
                    tracing::debug!(dir = %dir.display(), error = %e, "could not remove directory");
                    false
                }
            }
        }
        Ok(false) => false,
        Err(_) => !dir.exists(),
    }
}

/// Cleanup after a cancelled copy: the partial file goes, and so does its
/// folder if nothing else is in it.
pub fn remove_partial(file: &Path) {
    match fs::remove_file(file) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %file.display(), error = %e, "could not remove partial file"),
    }
    if let Some(parent) = file.parent() {
        remove_dir_if_empty(parent);
    }
}

/// Case-insensitive matcher for audio file names.
pub struct AudioFilter {
    matcher: GlobMatcher,
}

impl AudioFilter {
    pub fn new() -> SyncResult<Self> {
        let pattern = format!("*.{{{}}}", AUDIO_EXTENSIONS.join(","));
        let glob = GlobBuilder::new(&pattern)
            .case_insensitive(true)
            .literal_separator(true)
            .build()
            .map_err(|e| SyncError::Internal(format!("invalid audio pattern: {}", e)))?;
        Ok(Self {
            matcher: glob.compile_matcher(),
        })
    }

    /// Matches on the file name only; dot-files never match.
    pub fn is_audio_file(&self, path: &Path) -> bool {
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if !name.starts_with('.') => self.matcher.is_match(name),
            _ => false,
        }
    }
}

/// An audio file found under a destination root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Lists audio files under `root` in a stable order. A missing root yields
/// nothing; any other walk error aborts the scan.
pub fn scan_audio_files(root: &Path) -> SyncResult<Vec<ScannedFile>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let filter = AudioFilter::new()?;
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = entry.map_err(|e| SyncError::Scan(format!("{}: {}", root.display(), e)))?;
        if !entry.file_type().is_file() || !filter.is_audio_file(entry.path()) {
            continue;
        }
        let size = entry
            .metadata()
            .map_err(|e| SyncError::Scan(format!("{}: {}", entry.path().display(), e)))?
            .len();
        files.push(ScannedFile {
            path: entry.into_path(),
            size,
        });
    }

    Ok(files)
}
