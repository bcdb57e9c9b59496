//! Storage handler for a folder on the local filesystem.
//!
//! Watching is done with a [`SelectiveWatcher`] rooted at the folder. In
//! whole-folder mode every file is monitored and a recursive discovery watch
//! registers files as they appear. In selected-files mode only files written
//! through [`StorageHandler::put_file`] or added with
//! [`LocalFolderHandler::add_monitored_file`] are monitored.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::error::{StorageError, StorageResult};
use super::handler::{
    FileHandle, FileProperties, StorageEvent, StorageHandler, StorageOptions, file_name_of,
    relative_path_of,
};
use crate::watcher::{SelectiveWatcher, WatchEvent, WatcherOptions};

/// A storage backed by a local directory.
pub struct LocalFolderHandler {
    id: String,
    base_path: PathBuf,
    only_selected_files: bool,
    watcher_options: WatcherOptions,
    /// Files selected for monitoring in selected-files mode.
    selected: StdMutex<HashSet<String>>,
    monitor: Mutex<Option<Monitor>>,
}

struct Monitor {
    watcher: Arc<SelectiveWatcher>,
    _discovery: Option<RecommendedWatcher>,
    shutdown: CancellationToken,
    forwarder: JoinHandle<()>,
}

impl LocalFolderHandler {
    pub fn new(id: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            base_path: base_path.into(),
            only_selected_files: false,
            watcher_options: WatcherOptions::default(),
            selected: StdMutex::new(HashSet::new()),
            monitor: Mutex::new(None),
        }
    }

    /// Monitor only selected files instead of the whole folder.
    pub fn with_only_selected_files(mut self, only_selected_files: bool) -> Self {
        self.only_selected_files = only_selected_files;
        self
    }

    pub fn with_watcher_options(mut self, options: WatcherOptions) -> Self {
        self.watcher_options = options;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Options describing this storage.
    pub fn options(&self) -> StorageOptions {
        StorageOptions {
            only_selected_files: self.only_selected_files,
            base_path: Some(self.base_path.clone()),
        }
    }

    /// Start monitoring a file in selected-files mode.
    ///
    /// The file does not have to exist yet.
    pub async fn add_monitored_file(&self, name: &str) -> StorageResult<()> {
        let relative = relative_path_of(name)?;
        self.select(name);
        if let Some(monitor) = self.monitor.lock().await.as_ref() {
            monitor.watcher.add(&relative)?;
        }
        Ok(())
    }

    /// Stop monitoring a file in selected-files mode.
    pub async fn remove_monitored_file(&self, name: &str) -> StorageResult<()> {
        let relative = relative_path_of(name)?;
        if let Ok(mut selected) = self.selected.lock() {
            selected.remove(name);
        }
        if let Some(monitor) = self.monitor.lock().await.as_ref() {
            monitor.watcher.unwatch(&relative)?;
        }
        Ok(())
    }

    fn select(&self, name: &str) {
        match self.selected.lock() {
            Ok(mut selected) => {
                selected.insert(name.to_string());
            }
            Err(_) => tracing::error!("[storage] selection lock poisoned for {}", self.id),
        }
    }

    fn selected_files(&self) -> Vec<String> {
        self.selected
            .lock()
            .map(|selected| selected.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn resolve(&self, name: &str) -> StorageResult<PathBuf> {
        Ok(self.base_path.join(relative_path_of(name)?))
    }

    fn handle_for(&self, name: &str, absolute: &Path) -> FileHandle {
        FileHandle {
            name: name.to_string(),
            url: absolute.to_string_lossy().into_owned(),
            storage_id: self.id.clone(),
        }
    }

    fn not_found(&self, name: &str) -> StorageError {
        StorageError::NotFound {
            storage_id: self.id.clone(),
            name: name.to_string(),
        }
    }

    fn start_discovery(
        base_path: &Path,
    ) -> StorageResult<(RecommendedWatcher, mpsc::UnboundedReceiver<notify::Result<Event>>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(crate::watcher::WatchError::from)?;

        watcher
            .watch(base_path, RecursiveMode::Recursive)
            .map_err(|e| crate::watcher::WatchError::PathWatchFailed {
                path: base_path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok((watcher, rx))
    }
}

/// Every file under `base_path`, as `/` separated relative names.
fn list_files(base_path: &Path) -> Vec<String> {
    let mut names: Vec<String> = WalkDir::new(base_path)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(base_path)
                .ok()
                .map(file_name_of)
        })
        .collect();
    names.sort();
    names
}

/// Files among `paths`, with directories expanded to the files below them.
fn files_under(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(list_files(&path).into_iter().map(|name| path.join(name)));
        } else if path.is_file() {
            files.push(path);
        }
    }
    files
}

fn io_not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

#[async_trait]
impl StorageHandler for LocalFolderHandler {
    fn storage_id(&self) -> &str {
        &self.id
    }

    async fn get_all_files(&self) -> StorageResult<Vec<FileHandle>> {
        // Fail on a missing folder instead of reporting it empty
        tokio::fs::metadata(&self.base_path).await?;

        let base_path = self.base_path.clone();
        let names = tokio::task::spawn_blocking(move || list_files(&base_path))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?;

        Ok(names
            .iter()
            .map(|name| self.handle_for(name, &self.base_path.join(name)))
            .collect())
    }

    async fn get_file(&self, name: &str) -> StorageResult<FileHandle> {
        let path = self.resolve(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(self.handle_for(name, &path)),
            Ok(_) => Err(self.not_found(name)),
            Err(e) if io_not_found(&e) => Err(self.not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_properties(&self, file: &FileHandle) -> StorageResult<FileProperties> {
        let path = self.resolve(&file.name)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if io_not_found(&e) => return Err(self.not_found(&file.name)),
            Err(e) => return Err(e.into()),
        };
        Ok(FileProperties {
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    async fn put_file(&self, file: &FileHandle) -> StorageResult<()> {
        let target = self.resolve(&file.name)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::copy(&file.url, &target).await {
            Ok(bytes) => {
                crate::debug_event!("storage", "put", "{} -> {} ({bytes} bytes)", file.url, self.id);
            }
            Err(e) if io_not_found(&e) => {
                return Err(StorageError::NotFound {
                    storage_id: file.storage_id.clone(),
                    name: file.name.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        if self.only_selected_files {
            self.add_monitored_file(&file.name).await?;
        }
        Ok(())
    }

    async fn delete_file(&self, file: &FileHandle) -> StorageResult<()> {
        let path = self.resolve(&file.name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if io_not_found(&e) => Err(self.not_found(&file.name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn watch(&self) -> StorageResult<Option<mpsc::UnboundedReceiver<StorageEvent>>> {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            return Err(StorageError::AlreadyWatching {
                storage_id: self.id.clone(),
            });
        }

        let (watcher, watch_rx) = SelectiveWatcher::new(&self.base_path, self.watcher_options);
        let watcher = Arc::new(watcher);

        let mut known = HashSet::new();
        let (discovery, discovery_rx) = if self.only_selected_files {
            for name in self.selected_files() {
                watcher.add(relative_path_of(&name)?)?;
            }
            (None, None)
        } else {
            let (discovery, rx) = Self::start_discovery(watcher.base_path())?;
            for file in self.get_all_files().await? {
                watcher.add(relative_path_of(&file.name)?)?;
                known.insert(file.name);
            }
            (Some(discovery), Some(rx))
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let forwarder = Forwarder {
            storage_id: self.id.clone(),
            base_path: watcher.base_path().to_path_buf(),
            watcher: Arc::clone(&watcher),
            events: events_tx,
            // Files present before watching are reported as changes
            announced: known.clone(),
            known,
            whole_folder: !self.only_selected_files,
        };
        let task = tokio::spawn(forwarder.run(watch_rx, discovery_rx, shutdown.clone()));

        crate::log_event!(
            "storage",
            "watching",
            "{} at {}",
            self.id,
            self.base_path.display()
        );

        *monitor = Some(Monitor {
            watcher,
            _discovery: discovery,
            shutdown,
            forwarder: task,
        });
        Ok(Some(events_rx))
    }

    async fn close(&self) {
        let Some(monitor) = self.monitor.lock().await.take() else {
            return;
        };
        monitor.shutdown.cancel();
        if let Err(e) = monitor.forwarder.await {
            tracing::error!("[storage] forwarder for {} ended abnormally: {e}", self.id);
        }
        monitor.watcher.close().await;
        crate::debug_event!("storage", "closed", "{}", self.id);
    }
}

/// Turns watcher events into storage events for one folder.
struct Forwarder {
    storage_id: String,
    base_path: PathBuf,
    watcher: Arc<SelectiveWatcher>,
    events: mpsc::UnboundedSender<StorageEvent>,
    /// Files already reported at least once.
    announced: HashSet<String>,
    /// Files registered with the watcher by discovery.
    known: HashSet<String>,
    whole_folder: bool,
}

impl Forwarder {
    async fn run(
        mut self,
        mut watch_rx: mpsc::UnboundedReceiver<WatchEvent>,
        discovery_rx: Option<mpsc::UnboundedReceiver<notify::Result<Event>>>,
        shutdown: CancellationToken,
    ) {
        let (_idle_tx, idle_rx) = mpsc::unbounded_channel();
        let mut discovery_rx = discovery_rx.unwrap_or(idle_rx);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                event = watch_rx.recv() => match event {
                    Some(event) => self.on_watch_event(event).await,
                    None => break,
                },

                Some(result) = discovery_rx.recv() => {
                    self.on_discovery(result).await;
                }
            }
        }
    }

    async fn on_watch_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Change(path) => {
                let name = file_name_of(&path);
                let file = FileHandle {
                    url: self.base_path.join(&path).to_string_lossy().into_owned(),
                    name: name.clone(),
                    storage_id: self.storage_id.clone(),
                };
                let event = if self.announced.insert(name) {
                    StorageEvent::add(file)
                } else {
                    StorageEvent::change(file)
                };
                let _ = self.events.send(event);
            }
            WatchEvent::Unlink(path) => {
                let name = file_name_of(&path);
                self.announced.remove(&name);

                // Deleted and recreated before the unlink got here
                let recreated = tokio::fs::try_exists(self.base_path.join(&path))
                    .await
                    .unwrap_or(false);
                if recreated {
                    crate::debug_event!("storage", "recreated", "{name} on {}", self.storage_id);
                    if let Err(e) = self.watcher.recheck(&path) {
                        tracing::warn!("[storage] cannot recheck {name}: {e}");
                    }
                } else if self.whole_folder {
                    self.known.remove(&name);
                    if let Err(e) = self.watcher.unwatch(&path) {
                        tracing::warn!("[storage] cannot unwatch {name}: {e}");
                    }
                }
                let _ = self.events.send(StorageEvent::delete(name));
            }
            WatchEvent::Error(e) => {
                tracing::warn!("[storage] watcher error on {}: {e}", self.storage_id);
            }
        }
    }

    async fn on_discovery(&mut self, result: notify::Result<Event>) {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("[storage] discovery error on {}: {e}", self.storage_id);
                return;
            }
        };

        let appeared: Vec<PathBuf> = event
            .paths
            .into_iter()
            .enumerate()
            .filter(|(index, _)| match event.kind {
                EventKind::Modify(ModifyKind::Name(RenameMode::From)) => false,
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => *index == 1,
                EventKind::Create(_) | EventKind::Modify(_) => true,
                _ => false,
            })
            .map(|(_, path)| path)
            .collect();
        if appeared.is_empty() {
            return;
        }

        match tokio::task::spawn_blocking(move || files_under(appeared)).await {
            Ok(files) => {
                for file in files {
                    self.register(&file);
                }
            }
            Err(e) => tracing::error!("[storage] discovery on {} failed: {e}", self.storage_id),
        }
    }

    fn register(&mut self, absolute: &Path) {
        let Ok(relative) = absolute.strip_prefix(&self.base_path) else {
            return;
        };
        let name = file_name_of(relative);
        if !self.known.insert(name.clone()) {
            return;
        }

        crate::debug_event!("storage", "discovered", "{name} on {}", self.storage_id);
        let registered = self
            .watcher
            .add(relative)
            .and_then(|()| self.watcher.recheck(relative));
        if let Err(e) = registered {
            tracing::warn!("[storage] cannot monitor {name}: {e}");
            self.known.remove(&name);
        }
    }
}
