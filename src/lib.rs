//! Selective folder watching, a tracked-item ledger and watch folder workflow
//! generation.
//!
//! Files on source storages are watched for settled changes and deletions,
//! recorded in a persistent ledger and mirrored onto destination storages by
//! emitting copy and delete workflows.

pub mod cli;
pub mod config;
pub mod generator;
pub mod ledger;
pub mod logging;
pub mod storage;
pub mod watcher;
pub mod workflow;

pub use config::Settings;
pub use generator::{GeneratorError, MediaFlow, WatchFolderGenerator};
pub use ledger::{LedgerError, TrackedItems, TrackedMediaItem};
pub use storage::{FileHandle, StorageHandler, StorageObject};
pub use watcher::{SelectiveWatcher, WatchEvent};
pub use workflow::{WorkFlow, WorkflowSink};
