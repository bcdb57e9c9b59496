//! Workflow generation from storage events.
//!
//! A generator reacts to file events on source storages and to a periodic
//! reconciliation sweep, keeps the ledger in step with what it observes and
//! emits copy and delete workflows to a [`crate::workflow::WorkflowSink`].

mod error;
mod flow;
mod pairing;
mod watch_folder;

pub use error::{GeneratorError, GeneratorResult};
pub use flow::{MediaFlow, MediaFlowType};
pub use pairing::{Pairing, StoragePairing};
pub use watch_folder::{
    DEFAULT_CRON_INTERVAL, DEFAULT_LINGER_TIME, GeneratorOptions, WatchFolderGenerator,
};
