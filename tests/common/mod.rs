//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;
use watchflow::ledger::TrackedItems;
use watchflow::storage::{
    FileHandle, FileProperties, StorageError, StorageEvent, StorageHandler, StorageObject,
    StorageOptions, StorageResult,
};
use watchflow::workflow::WorkFlow;

/// Storage keeping file sizes in memory.
///
/// Watchable storages hand out an event channel fed through [`MemoryStorage::send`].
pub struct MemoryStorage {
    id: String,
    files: Mutex<BTreeMap<String, u64>>,
    broken_properties: Mutex<HashSet<String>>,
    watchable: bool,
    events: Mutex<Option<mpsc::UnboundedSender<StorageEvent>>>,
    calls: Mutex<Vec<&'static str>>,
}

impl MemoryStorage {
    pub fn new(id: &str) -> Arc<Self> {
        Self::build(id, false)
    }

    pub fn watchable(id: &str) -> Arc<Self> {
        Self::build(id, true)
    }

    fn build(id: &str, watchable: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            files: Mutex::new(BTreeMap::new()),
            broken_properties: Mutex::new(HashSet::new()),
            watchable,
            events: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Report an event to the watcher of this storage.
    pub fn send(&self, event: StorageEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            tx.send(event).unwrap();
        }
    }

    /// Listing and watch calls, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn insert(&self, name: &str, size: u64) {
        self.files.lock().unwrap().insert(name.to_string(), size);
    }

    pub fn remove(&self, name: &str) {
        self.files.lock().unwrap().remove(name);
    }

    /// Make `get_properties` fail for `name`.
    pub fn break_properties(&self, name: &str) {
        self.broken_properties.lock().unwrap().insert(name.to_string());
    }

    pub fn handle(&self, name: &str) -> FileHandle {
        FileHandle {
            name: name.to_string(),
            url: format!("memory://{}/{name}", self.id),
            storage_id: self.id.clone(),
        }
    }

    fn not_found(&self, name: &str) -> StorageError {
        StorageError::NotFound {
            storage_id: self.id.clone(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl StorageHandler for MemoryStorage {
    fn storage_id(&self) -> &str {
        &self.id
    }

    async fn get_all_files(&self) -> StorageResult<Vec<FileHandle>> {
        self.calls.lock().unwrap().push("get_all_files");
        let names: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        Ok(names.iter().map(|name| self.handle(name)).collect())
    }

    async fn get_file(&self, name: &str) -> StorageResult<FileHandle> {
        if self.files.lock().unwrap().contains_key(name) {
            Ok(self.handle(name))
        } else {
            Err(self.not_found(name))
        }
    }

    async fn get_properties(&self, file: &FileHandle) -> StorageResult<FileProperties> {
        if self.broken_properties.lock().unwrap().contains(&file.name) {
            return Err(StorageError::Io(std::io::Error::other("properties unavailable")));
        }
        let size = self.files.lock().unwrap().get(&file.name).copied();
        size.map(|size| FileProperties {
            size,
            modified: None,
        })
        .ok_or_else(|| self.not_found(&file.name))
    }

    async fn put_file(&self, file: &FileHandle) -> StorageResult<()> {
        self.insert(&file.name, 0);
        Ok(())
    }

    async fn delete_file(&self, file: &FileHandle) -> StorageResult<()> {
        match self.files.lock().unwrap().remove(&file.name) {
            Some(_) => Ok(()),
            None => Err(self.not_found(&file.name)),
        }
    }

    async fn watch(&self) -> StorageResult<Option<mpsc::UnboundedReceiver<StorageEvent>>> {
        if !self.watchable {
            return Ok(None);
        }
        self.calls.lock().unwrap().push("watch");
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(tx);
        Ok(Some(rx))
    }
}

pub fn storage_object(storage: &Arc<MemoryStorage>, only_selected_files: bool) -> StorageObject {
    StorageObject::new(
        storage.storage_id(),
        StorageOptions {
            only_selected_files,
            base_path: None,
        },
        Arc::clone(storage) as Arc<dyn StorageHandler>,
    )
}

/// A ledger in a scratch directory. Keep the directory alive with the ledger.
pub fn open_ledger() -> (TempDir, TrackedItems) {
    let temp_dir = TempDir::new().unwrap();
    let tracked = TrackedItems::open(temp_dir.path().join("ledger")).unwrap();
    (temp_dir, tracked)
}

/// Every workflow emitted so far.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<WorkFlow>) -> Vec<WorkFlow> {
    let mut workflows = Vec::new();
    while let Ok(workflow) = rx.try_recv() {
        workflows.push(workflow);
    }
    workflows
}

/// Wait for the next workflow, up to `timeout`.
pub async fn next_workflow(
    rx: &mut mpsc::UnboundedReceiver<WorkFlow>,
    timeout: Duration,
) -> Option<WorkFlow> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}
