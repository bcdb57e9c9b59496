//! Directory registry with reference-counted native watches.
//!
//! Tracks the set of monitored files (relative to the watcher's base path)
//! and one watch slot per distinct parent directory. A slot holds the native
//! watch handle, or `None` while the watch is failed and waiting for the
//! restart sweep.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// A single directory watch slot.
#[derive(Debug)]
pub struct DirectoryWatch<H> {
    /// Native handle, `None` when creation failed or the watch errored.
    pub handle: Option<H>,
    /// Number of monitored files living in this directory.
    pub file_count: usize,
}

/// Registry of monitored files and their directory watches.
///
/// Generic over the handle type so the bookkeeping can be exercised without
/// touching the filesystem.
#[derive(Debug)]
pub struct DirectoryRegistry<H> {
    base_path: PathBuf,
    /// Monitored files, relative to `base_path`.
    files: HashSet<PathBuf>,
    /// Absolute directory -> watch slot.
    directories: HashMap<PathBuf, DirectoryWatch<H>>,
}

/// Outcome of registering a file.
#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// The file was already monitored.
    AlreadyWatched,
    /// The file joined an existing directory watch.
    Joined,
    /// The file needs a new watch on this absolute directory.
    NeedsWatch(PathBuf),
}

impl<H> DirectoryRegistry<H> {
    /// Create an empty registry rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            files: HashSet::new(),
            directories: HashMap::new(),
        }
    }

    /// Base path all monitored files are relative to.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Absolute directory that holds a relative file.
    pub fn directory_of(&self, file: &Path) -> PathBuf {
        match file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.base_path.join(parent),
            _ => self.base_path.clone(),
        }
    }

    /// Absolute path of a relative file.
    pub fn absolute(&self, file: &Path) -> PathBuf {
        self.base_path.join(file)
    }

    /// Relative path of an absolute one, if it lies under the base path.
    pub fn relative(&self, absolute: &Path) -> Option<PathBuf> {
        absolute
            .strip_prefix(&self.base_path)
            .ok()
            .map(Path::to_path_buf)
    }

    /// Register a file. Repeat registrations are no-ops.
    ///
    /// When the outcome is [`AddOutcome::NeedsWatch`] the caller must create
    /// the native watch and hand it over with [`DirectoryRegistry::insert_directory`].
    pub fn add_file(&mut self, file: PathBuf) -> AddOutcome {
        let dir = self.directory_of(&file);
        if !self.files.insert(file) {
            return AddOutcome::AlreadyWatched;
        }

        match self.directories.get_mut(&dir) {
            Some(existing) => {
                existing.file_count += 1;
                AddOutcome::Joined
            }
            None => AddOutcome::NeedsWatch(dir),
        }
    }

    /// Install the slot for a directory reported by [`AddOutcome::NeedsWatch`].
    pub fn insert_directory(&mut self, dir: PathBuf, handle: Option<H>) {
        self.directories.insert(
            dir,
            DirectoryWatch {
                handle,
                file_count: 1,
            },
        );
    }

    /// Unregister a file.
    ///
    /// Returns the slot of its directory when the reference count dropped to
    /// zero; dropping the returned slot closes the native watch.
    pub fn remove_file(&mut self, file: &Path) -> Option<(PathBuf, DirectoryWatch<H>)> {
        if !self.files.remove(file) {
            return None;
        }

        let dir = self.directory_of(file);
        let existing = self.directories.get_mut(&dir)?;
        existing.file_count = existing.file_count.saturating_sub(1);
        if existing.file_count == 0 {
            return self.directories.remove_entry(&dir);
        }
        None
    }

    /// Check if a relative file is monitored.
    pub fn contains(&self, file: &Path) -> bool {
        self.files.contains(file)
    }

    /// Whether a directory slot exists and is currently failed.
    pub fn is_failed(&self, dir: &Path) -> bool {
        self.directories
            .get(dir)
            .is_some_and(|watch| watch.handle.is_none())
    }

    /// Mark a directory watch as failed, dropping its handle.
    ///
    /// Returns `true` if the slot exists.
    pub fn mark_failed(&mut self, dir: &Path) -> bool {
        match self.directories.get_mut(dir) {
            Some(watch) => {
                watch.handle = None;
                true
            }
            None => false,
        }
    }

    /// Hand a freshly created handle to a failed slot.
    pub fn restore(&mut self, dir: &Path, handle: H) {
        if let Some(watch) = self.directories.get_mut(dir) {
            watch.handle = Some(handle);
        }
    }

    /// Directories whose watch is currently failed.
    pub fn failed_directories(&self) -> Vec<PathBuf> {
        self.directories
            .iter()
            .filter(|(_, watch)| watch.handle.is_none())
            .map(|(dir, _)| dir.clone())
            .collect()
    }

    /// Monitored files living directly in an absolute directory.
    pub fn files_in(&self, dir: &Path) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter(|file| self.directory_of(file) == dir)
            .cloned()
            .collect()
    }

    /// Number of monitored files.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Number of directory slots, failed or not.
    pub fn dir_count(&self) -> usize {
        self.directories.len()
    }

    /// Number of failed directory slots.
    pub fn failed_count(&self) -> usize {
        self.directories
            .values()
            .filter(|watch| watch.handle.is_none())
            .count()
    }

    /// Drop every slot and forget all files.
    pub fn clear(&mut self) {
        self.directories.clear();
        self.files.clear();
    }
}
