//! Selective file watcher.
//!
//! Watches only explicitly registered files. One native `notify` watch is kept
//! per distinct parent directory and shared by reference count; raw events for
//! files outside the monitored set are dropped. Updates go through size
//! stability debouncing before a [`WatchEvent::Change`] is reported, and failed
//! directory watches are re-created by a periodic restart sweep.
//!
//! All bookkeeping lives in one background task. The [`SelectiveWatcher`]
//! handle talks to it over a command channel.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;

use super::error::WatchError;
use super::registry::{AddOutcome, DirectoryRegistry};
use super::stability::{Resolution, StabilityTracker};

/// Default time a file size must stay constant before it counts as changed.
pub const DEFAULT_STABILITY_THRESHOLD: Duration = Duration::from_secs(2);
/// Default interval of the sweep that re-creates failed directory watches.
pub const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_secs(10);
/// Default polling granularity for due stability checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest ticker period; zero intervals are raised to this.
const MIN_TICK: Duration = Duration::from_millis(1);

/// Timing options for a [`SelectiveWatcher`].
#[derive(Debug, Clone, Copy)]
pub struct WatcherOptions {
    pub stability_threshold: Duration,
    pub restart_interval: Duration,
    pub check_interval: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            stability_threshold: DEFAULT_STABILITY_THRESHOLD,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// Events reported by the watcher. Paths are relative to the base path.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// File content settled after a change.
    Change(PathBuf),
    /// File was removed.
    Unlink(PathBuf),
    /// A failure not tied to a reported file event.
    Error(WatchError),
}

/// Snapshot of the watcher's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherStats {
    /// Monitored files.
    pub files: usize,
    /// Directory watch slots, including failed ones.
    pub directories: usize,
    /// Directory watches waiting for the restart sweep.
    pub failed: usize,
    /// Stability checks in progress.
    pub pending_checks: usize,
}

#[derive(Debug)]
enum Command {
    Add(PathBuf),
    Unwatch(PathBuf),
    Recheck(PathBuf),
    Stats(oneshot::Sender<WatcherStats>),
}

struct RawEvent {
    /// Directory whose native watch produced the event.
    dir: PathBuf,
    result: notify::Result<Event>,
}

struct Observation {
    path: PathBuf,
    generation: u64,
    result: std::io::Result<u64>,
}

/// What a raw notification means for one monitored path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Updated,
    Removed,
}

/// Handle to a running selective watcher.
///
/// Dropping every handle stops the background task; [`SelectiveWatcher::close`]
/// stops it deterministically and waits for it to release its resources.
pub struct SelectiveWatcher {
    base_path: PathBuf,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SelectiveWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectiveWatcher")
            .field("base_path", &self.base_path)
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl SelectiveWatcher {
    /// Start a watcher rooted at `base_path`.
    ///
    /// Must be called from within a tokio runtime. Returns the handle and the
    /// receiving end of the event channel.
    pub fn new(
        base_path: impl AsRef<Path>,
        options: WatcherOptions,
    ) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let base_path = normalize_base(base_path.as_ref());

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (observation_tx, observation_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let event_loop = EventLoop {
            registry: DirectoryRegistry::new(base_path.clone()),
            tracker: StabilityTracker::new(options.stability_threshold),
            events: event_tx,
            raw_tx,
            observation_tx,
            options,
        };
        let task = tokio::spawn(event_loop.run(
            command_rx,
            raw_rx,
            observation_rx,
            shutdown.clone(),
        ));

        let watcher = Self {
            base_path,
            commands: command_tx,
            shutdown,
            task: Mutex::new(Some(task)),
        };
        (watcher, event_rx)
    }

    /// Base path all monitored files are relative to.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Begin monitoring a file relative to the base path.
    ///
    /// Repeat calls for the same file are no-ops. The parent directory gets
    /// a native watch if it has none yet.
    pub fn add(&self, file: impl AsRef<Path>) -> Result<(), WatchError> {
        self.send(Command::Add(self.relative(file.as_ref())))
    }

    /// Stop monitoring a file. The directory watch is released with its last file.
    pub fn unwatch(&self, file: impl AsRef<Path>) -> Result<(), WatchError> {
        self.send(Command::Unwatch(self.relative(file.as_ref())))
    }

    /// Start a stability check for a monitored file right away.
    pub fn recheck(&self, file: impl AsRef<Path>) -> Result<(), WatchError> {
        self.send(Command::Recheck(self.relative(file.as_ref())))
    }

    /// Current bookkeeping counts.
    pub async fn stats(&self) -> Result<WatcherStats, WatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Stats(reply_tx))?;
        reply_rx.await.map_err(|_| WatchError::Closed)
    }

    /// Release all native watches and pending checks.
    ///
    /// Idempotent. Returns once the background task has finished; no events
    /// are produced afterwards.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("[watcher] event loop ended abnormally: {e}");
            }
        }
    }

    fn send(&self, command: Command) -> Result<(), WatchError> {
        if self.shutdown.is_cancelled() {
            return Err(WatchError::Closed);
        }
        self.commands.send(command).map_err(|_| WatchError::Closed)
    }

    fn relative(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            if let Ok(stripped) = file.strip_prefix(&self.base_path) {
                return stripped.to_path_buf();
            }
        }
        file.to_path_buf()
    }
}

/// Canonical absolute base path, so it matches the paths notify reports.
fn normalize_base(base: &Path) -> PathBuf {
    std::fs::canonicalize(base)
        .or_else(|_| std::path::absolute(base))
        .unwrap_or_else(|_| base.to_path_buf())
}

fn classify(kind: &EventKind, index: usize) -> Option<RawKind> {
    match kind {
        EventKind::Create(_) => Some(RawKind::Updated),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(RawKind::Removed),
        // Both: paths are [from, to]
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if index == 0 => {
            Some(RawKind::Removed)
        }
        EventKind::Modify(_) => Some(RawKind::Updated),
        EventKind::Remove(_) => Some(RawKind::Removed),
        _ => None,
    }
}

struct EventLoop {
    registry: DirectoryRegistry<RecommendedWatcher>,
    tracker: StabilityTracker,
    events: mpsc::UnboundedSender<WatchEvent>,
    raw_tx: mpsc::UnboundedSender<RawEvent>,
    observation_tx: mpsc::UnboundedSender<Observation>,
    options: WatcherOptions,
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut raw_rx: mpsc::UnboundedReceiver<RawEvent>,
        mut observation_rx: mpsc::UnboundedReceiver<Observation>,
        shutdown: CancellationToken,
    ) {
        let mut check_ticker = interval(self.options.check_interval.max(MIN_TICK));
        check_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let restart_every = self.options.restart_interval.max(MIN_TICK);
        let mut restart_ticker = interval_at(tokio::time::Instant::now() + restart_every, restart_every);
        restart_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // Every handle was dropped
                    None => break,
                },

                Some(raw) = raw_rx.recv() => {
                    self.handle_raw(raw).await;
                }

                Some(observation) = observation_rx.recv() => {
                    self.handle_observation(observation);
                }

                _ = check_ticker.tick() => {
                    self.dispatch_due_checks();
                }

                _ = restart_ticker.tick() => {
                    self.restart_failed().await;
                }
            }
        }

        self.tracker.clear();
        self.registry.clear();
        crate::debug_event!("watcher", "closed", "{}", self.registry.base_path().display());
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add(file) => {
                if let AddOutcome::NeedsWatch(dir) = self.registry.add_file(file) {
                    let handle = match self.create_watch(&dir) {
                        Ok(handle) => Some(handle),
                        Err(e) => {
                            tracing::warn!(
                                "[watcher] cannot watch {}, will retry: {e}",
                                dir.display()
                            );
                            None
                        }
                    };
                    self.registry.insert_directory(dir, handle);
                }
            }
            Command::Unwatch(file) => {
                self.tracker.cancel(&file);
                if let Some((dir, _slot)) = self.registry.remove_file(&file) {
                    crate::debug_event!("watcher", "released", "{}", dir.display());
                }
            }
            Command::Recheck(file) => {
                if self.registry.contains(&file) {
                    self.start_check(file).await;
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(WatcherStats {
                    files: self.registry.file_count(),
                    directories: self.registry.dir_count(),
                    failed: self.registry.failed_count(),
                    pending_checks: self.tracker.pending_count(),
                });
            }
        }
    }

    fn create_watch(&self, dir: &Path) -> Result<RecommendedWatcher, WatchError> {
        let raw_tx = self.raw_tx.clone();
        let watch_dir = dir.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let _ = raw_tx.send(RawEvent {
                dir: watch_dir.clone(),
                result,
            });
        })?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::PathWatchFailed {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?;

        crate::debug_event!("watcher", "watching", "{}", dir.display());
        Ok(watcher)
    }

    async fn handle_raw(&mut self, raw: RawEvent) {
        let event = match raw.result {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("[watcher] watch on {} failed: {e}", raw.dir.display());
                self.registry.mark_failed(&raw.dir);
                let _ = self.events.send(WatchEvent::Error(WatchError::EventError {
                    details: e.to_string(),
                }));
                return;
            }
        };

        for (index, path) in event.paths.iter().enumerate() {
            // A directory that failed to be watched may just have appeared
            self.try_restart(path).await;

            let kind = classify(&event.kind, index);
            if kind == Some(RawKind::Removed) && *path == raw.dir {
                tracing::warn!("[watcher] watched directory removed: {}", path.display());
                self.registry.mark_failed(&raw.dir);
                continue;
            }

            let Some(relative) = self.registry.relative(path) else {
                continue;
            };
            if !self.registry.contains(&relative) {
                continue;
            }

            match kind {
                Some(RawKind::Updated) => self.start_check(relative).await,
                Some(RawKind::Removed) => self.on_remove(relative),
                None => {}
            }
        }
    }

    async fn start_check(&mut self, file: PathBuf) {
        let size = tokio::fs::metadata(self.registry.absolute(&file))
            .await
            .ok()
            .map(|meta| meta.len());
        self.tracker.schedule(file, size, Instant::now());
    }

    fn on_remove(&mut self, file: PathBuf) {
        self.tracker.cancel(&file);
        crate::debug_event!("watcher", "unlink", "{}", file.display());
        let _ = self.events.send(WatchEvent::Unlink(file));
    }

    fn dispatch_due_checks(&mut self) {
        for (path, generation) in self.tracker.take_due(Instant::now()) {
            let absolute = self.registry.absolute(&path);
            let observation_tx = self.observation_tx.clone();
            tokio::spawn(async move {
                let result = tokio::fs::metadata(&absolute).await.map(|meta| meta.len());
                let _ = observation_tx.send(Observation {
                    path,
                    generation,
                    result,
                });
            });
        }
    }

    fn handle_observation(&mut self, observation: Observation) {
        let Observation {
            path,
            generation,
            result,
        } = observation;

        match result {
            Ok(size) => match self.tracker.resolve(&path, generation, size, Instant::now()) {
                Resolution::Stable => {
                    crate::debug_event!("watcher", "settled", "{} ({size} bytes)", path.display());
                    let _ = self.events.send(WatchEvent::Change(path));
                }
                Resolution::Unsettled => {
                    tracing::trace!("[watcher] still growing: {}", path.display());
                }
                Resolution::Superseded => {
                    tracing::trace!("[watcher] discarded stale check: {}", path.display());
                }
            },
            Err(e) => {
                if self.tracker.discard(&path, generation) {
                    let _ = self.events.send(WatchEvent::Error(WatchError::StatFailed {
                        path,
                        reason: e.to_string(),
                    }));
                }
            }
        }
    }

    async fn try_restart(&mut self, path: &Path) {
        if self.registry.is_failed(path) {
            self.restart(path).await;
        }
    }

    async fn restart_failed(&mut self) {
        for dir in self.registry.failed_directories() {
            self.restart(&dir).await;
        }
    }

    async fn restart(&mut self, dir: &Path) {
        let handle = match self.create_watch(dir) {
            Ok(handle) => handle,
            Err(e) => {
                crate::debug_event!("watcher", "restart failed", "{e}");
                return;
            }
        };
        self.registry.restore(dir, handle);
        crate::log_event!("watcher", "restored", "{}", dir.display());

        // Events may have been missed while the watch was down
        for file in self.registry.files_in(dir) {
            let exists = tokio::fs::try_exists(self.registry.absolute(&file))
                .await
                .unwrap_or(false);
            if exists {
                self.start_check(file).await;
            }
        }
    }
}
