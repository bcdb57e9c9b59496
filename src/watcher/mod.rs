//! Selective file watcher with stability debouncing.
//!
//! Only explicitly registered files are watched, through one shared native
//! watch per parent directory.
//!
//! # Architecture
//!
//! ```text
//! SelectiveWatcher (handle)
//!   | commands
//!   v
//! EventLoop (background task)
//!   - DirectoryRegistry: dir -> {notify watch | failed, refcount}
//!   - StabilityTracker: path -> {size snapshot, deadline, generation}
//!   - restart sweep for failed directory watches
//!   |
//!   v
//! WatchEvent::{Change, Unlink, Error}
//! ```

mod error;
mod registry;
mod selective;
mod stability;

pub use error::WatchError;
pub use registry::{AddOutcome, DirectoryRegistry, DirectoryWatch};
pub use selective::{
    DEFAULT_CHECK_INTERVAL, DEFAULT_RESTART_INTERVAL, DEFAULT_STABILITY_THRESHOLD,
    SelectiveWatcher, WatchEvent, WatcherOptions, WatcherStats,
};
pub use stability::{Resolution, StabilityTracker};
