//! Error types for the podcast sync engine.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Fatal-to-batch I/O failure with the operation that triggered it.
    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid file URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Drive scan failed: {0}")]
    Scan(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Tagging failed for {}: {reason}", path.display())]
    Tagging { path: PathBuf, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Wraps an I/O error with the operation name and the path it touched.
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        SyncError::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl serde::Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Extension for attaching an operation name and path to raw I/O results.
pub trait IoContext<T> {
    fn op_context(self, op: &'static str, path: impl AsRef<Path>) -> SyncResult<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn op_context(self, op: &'static str, path: impl AsRef<Path>) -> SyncResult<T> {
        self.map_err(|e| SyncError::io(op, path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_operation_and_path() {
        let err = SyncError::io(
            "create show folder",
            "/Volumes/Drive/podcasts/Show",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("create show folder"));
        assert!(msg.contains("/Volumes/Drive/podcasts/Show"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn serializes_as_display_string() {
        let err = SyncError::UnsupportedScheme("http".into());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Unsupported URI scheme: http\"");
    }
}
