use thiserror::Error;

use crate::watcher::WatchError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File not found on storage {storage_id}: {name}")]
    NotFound { storage_id: String, name: String },

    #[error("Invalid file name {name}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Storage {storage_id} is already being watched")]
    AlreadyWatching { storage_id: String },

    #[error("Watcher error: {0}")]
    Watch(#[from] WatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    /// The requested file does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
