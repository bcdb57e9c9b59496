//! Error types for workflow generation.

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("Flow {flow_id} references unknown storage: {storage_id}")]
    UnknownStorage { flow_id: String, storage_id: String },

    #[error("Watch folder flows cannot run on a storage with only selected files: {storage_id}")]
    IncompatibleStorage { storage_id: String },

    #[error("Storage {0} has no registered destination")]
    Unregistered(String),

    #[error("Event for {path} carries no file")]
    MissingFile { path: String },

    #[error("Generator is already running")]
    AlreadyRunning,

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type GeneratorResult<T> = Result<T, GeneratorError>;
