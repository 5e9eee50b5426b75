//! Podcast sync engine.
//!
//! Copies selected catalog episodes onto a removable drive under
//! `<drive>/<folder>/<show>/<episode>`, recognises episodes already on the
//! drive even after renaming or retagging, and streams throttled progress
//! snapshots to an observer.

pub mod config;
pub mod episode;
pub mod errors;
pub mod file_ops;
pub mod logging;
pub mod matcher;
pub mod naming;
pub mod sync_engine;
pub mod tagging;
pub mod transfer_state;
pub mod volume_watcher;

pub use config::AppConfig;
pub use episode::{Catalog, Episode, JsonCatalog};
pub use errors::{SyncError, SyncResult};
pub use naming::NamingTemplate;
pub use sync_engine::{DeleteOutcome, DriveScan, SessionHandle, SyncEngine};
pub use transfer_state::{ProgressSnapshot, SessionControl, TransferSession};
pub use volume_watcher::{detect_drives, Drive, DriveEvent, DriveWatcher};
