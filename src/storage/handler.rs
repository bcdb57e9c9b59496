//! Storage handler boundary.
//!
//! A storage handler reads, writes and enumerates files on one storage
//! location. Handlers backed by something watchable also report add, change
//! and delete events for their files.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::{StorageError, StorageResult};

/// Reference to a file on a storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHandle {
    /// Name relative to the storage root, `/` separated.
    pub name: String,
    /// Location the bytes can be read from.
    pub url: String,
    /// Storage the file lives on.
    pub storage_id: String,
}

/// Properties of a file on a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileProperties {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageEventKind {
    Add,
    Change,
    Delete,
}

/// A file event reported by a storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub kind: StorageEventKind,
    /// Name of the file, relative to the storage root.
    pub path: String,
    /// Handle to the file; absent for deletions.
    pub file: Option<FileHandle>,
}

impl StorageEvent {
    pub fn add(file: FileHandle) -> Self {
        Self {
            kind: StorageEventKind::Add,
            path: file.name.clone(),
            file: Some(file),
        }
    }

    pub fn change(file: FileHandle) -> Self {
        Self {
            kind: StorageEventKind::Change,
            path: file.name.clone(),
            file: Some(file),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            kind: StorageEventKind::Delete,
            path: path.into(),
            file: None,
        }
    }
}

/// Operations every storage backend provides.
#[async_trait]
pub trait StorageHandler: Send + Sync {
    /// Identifier of the storage this handler serves.
    fn storage_id(&self) -> &str;

    /// Every file on the storage.
    async fn get_all_files(&self) -> StorageResult<Vec<FileHandle>>;

    /// Look up a file by name. Fails with `NotFound` if absent.
    async fn get_file(&self, name: &str) -> StorageResult<FileHandle>;

    /// Size and modification time of a file.
    async fn get_properties(&self, file: &FileHandle) -> StorageResult<FileProperties>;

    /// Write a file (possibly from another storage) under its name.
    async fn put_file(&self, file: &FileHandle) -> StorageResult<()>;

    /// Remove a file from this storage.
    async fn delete_file(&self, file: &FileHandle) -> StorageResult<()>;

    /// Start reporting file events.
    ///
    /// Returns `None` for storages that cannot be watched.
    async fn watch(&self) -> StorageResult<Option<mpsc::UnboundedReceiver<StorageEvent>>> {
        Ok(None)
    }

    /// Stop watching and release resources.
    async fn close(&self) {}
}

/// Per-storage options relevant to flow setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageOptions {
    /// Only files explicitly selected are watched, not the whole folder.
    pub only_selected_files: bool,
    pub base_path: Option<PathBuf>,
}

/// A configured storage: identity, options and the handler serving it.
#[derive(Clone)]
pub struct StorageObject {
    pub id: String,
    pub options: StorageOptions,
    pub handler: Arc<dyn StorageHandler>,
}

impl StorageObject {
    pub fn new(
        id: impl Into<String>,
        options: StorageOptions,
        handler: Arc<dyn StorageHandler>,
    ) -> Self {
        Self {
            id: id.into(),
            options,
            handler,
        }
    }
}

impl std::fmt::Debug for StorageObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageObject")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish()
    }
}

/// `/` separated name of a relative path.
pub fn file_name_of(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Relative path of a file name, rejecting names that escape the storage root.
pub fn relative_path_of(name: &str) -> StorageResult<PathBuf> {
    let path = PathBuf::from(name);
    if name.is_empty() {
        return Err(StorageError::InvalidName {
            name: name.to_string(),
            reason: "empty name".to_string(),
        });
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(StorageError::InvalidName {
                    name: name.to_string(),
                    reason: "must be relative to the storage root".to_string(),
                });
            }
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_of_uses_forward_slashes() {
        let path = Path::new("clips").join("day1").join("a.mxf");
        assert_eq!(file_name_of(&path), "clips/day1/a.mxf");
        assert_eq!(file_name_of(Path::new("a.mxf")), "a.mxf");
    }

    #[test]
    fn test_relative_path_rejects_escapes() {
        assert!(relative_path_of("clips/a.mxf").is_ok());
        assert!(relative_path_of("../a.mxf").is_err());
        assert!(relative_path_of("/etc/passwd").is_err());
        assert!(relative_path_of("").is_err());
    }

    #[test]
    fn test_event_constructors() {
        let file = FileHandle {
            name: "a.mxf".to_string(),
            url: "/media/a.mxf".to_string(),
            storage_id: "local".to_string(),
        };
        let event = StorageEvent::add(file.clone());
        assert_eq!(event.kind, StorageEventKind::Add);
        assert_eq!(event.path, "a.mxf");

        let event = StorageEvent::delete("a.mxf");
        assert_eq!(event.kind, StorageEventKind::Delete);
        assert!(event.file.is_none());
    }
}
