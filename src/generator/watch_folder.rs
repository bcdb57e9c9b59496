//! Watch folder workflow generator.
//!
//! Pairs source storages with destinations, mirrors every file on a source
//! onto its destination and propagates deletions. State lives in the ledger:
//! a file is registered the first time it is seen and removed once it is gone
//! from its source.
//!
//! Storage events and the reconciliation sweep are handled by one dispatcher
//! task, one at a time. Per-file failures are logged and abandon only that
//! file; the next event or sweep corrects it.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use super::error::{GeneratorError, GeneratorResult};
use super::flow::{MediaFlow, MediaFlowType};
use super::pairing::StoragePairing;
use crate::ledger::{ItemFilter, TrackedItems, TrackedMediaItem};
use crate::storage::{FileHandle, StorageEvent, StorageEventKind, StorageObject};
use crate::workflow::{WorkFlow, WorkFlowSource, WorkStep, WorkflowSink};

/// Default interval of the reconciliation sweep.
pub const DEFAULT_CRON_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Shortest accepted sweep interval.
const MIN_CRON_INTERVAL: Duration = Duration::from_millis(1);
/// Default linger time of newly tracked items.
pub const DEFAULT_LINGER_TIME: Duration = Duration::from_secs(3 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct GeneratorOptions {
    pub cron_interval: Duration,
    pub linger_time: Duration,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            cron_interval: DEFAULT_CRON_INTERVAL,
            linger_time: DEFAULT_LINGER_TIME,
        }
    }
}

/// Input of the dispatcher task.
#[derive(Debug)]
enum GeneratorEvent {
    Storage {
        storage_id: String,
        event: StorageEvent,
    },
}

/// Generator for watch folder flows.
pub struct WatchFolderGenerator {
    core: Arc<GeneratorCore>,
    events_tx: mpsc::UnboundedSender<GeneratorEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<GeneratorEvent>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct GeneratorCore {
    storages: Vec<StorageObject>,
    tracked: TrackedItems,
    flows: Vec<MediaFlow>,
    sink: Arc<dyn WorkflowSink>,
    options: GeneratorOptions,
    pairing: RwLock<StoragePairing>,
}

impl WatchFolderGenerator {
    pub fn new(
        storages: Vec<StorageObject>,
        tracked: TrackedItems,
        flows: Vec<MediaFlow>,
        sink: Arc<dyn WorkflowSink>,
        options: GeneratorOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            core: Arc::new(GeneratorCore {
                storages,
                tracked,
                flows,
                sink,
                options,
                pairing: RwLock::new(StoragePairing::new()),
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register every watch folder flow and start processing.
    ///
    /// Flows with unknown or incompatible storages are logged and skipped.
    /// Each registered source is watched first, then checked against the
    /// ledger; its events are handled once every initial check is done.
    /// The reconciliation sweep runs every `cron_interval` afterwards.
    pub async fn init(&self) -> GeneratorResult<()> {
        let Some(events_rx) = self.events_rx.lock().await.take() else {
            return Err(GeneratorError::AlreadyRunning);
        };

        let sources = self.core.register_flows();
        crate::log_event!(
            "generator",
            "init",
            "{} source storage(s) paired",
            sources.len()
        );

        // Events arriving during the initial check queue up for the dispatcher
        for source in &sources {
            self.start_forwarding(source).await;
            if let Err(e) = self.core.initial_check(&source.id).await {
                tracing::error!("[generator] initial check of {} failed: {e}", source.id);
            }
        }

        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&self.core),
            events_rx,
            self.shutdown.clone(),
        ));
        self.tasks.lock().await.push(dispatcher);
        Ok(())
    }

    async fn start_forwarding(&self, source: &StorageObject) {
        let mut storage_rx = match source.handler.watch().await {
            Ok(Some(rx)) => rx,
            Ok(None) => {
                crate::debug_event!("generator", "unwatchable", "{}", source.id);
                return;
            }
            Err(e) => {
                tracing::error!("[generator] cannot watch {}: {e}", source.id);
                return;
            }
        };

        let storage_id = source.id.clone();
        let events_tx = self.events_tx.clone();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = storage_rx.recv() => match event {
                        Some(event) => {
                            let forwarded = GeneratorEvent::Storage {
                                storage_id: storage_id.clone(),
                                event,
                            };
                            if events_tx.send(forwarded).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        self.tasks.lock().await.push(task);
    }

    /// Handle one storage event right away.
    pub async fn handle_event(&self, storage_id: &str, event: StorageEvent) -> GeneratorResult<()> {
        self.core.handle_event(storage_id, event).await
    }

    /// Reconcile a source storage against the ledger.
    pub async fn initial_check(&self, storage_id: &str) -> GeneratorResult<()> {
        self.core.initial_check(storage_id).await
    }

    /// Run the reconciliation sweep over every enrolled source.
    pub async fn cron_job(&self) {
        self.core.cron_job().await
    }

    /// Check tracked items of one source against their destinations.
    pub async fn storage_check(&self, storage_id: &str) -> GeneratorResult<()> {
        self.core.storage_check(storage_id).await
    }

    /// Ids of the paired source storages.
    pub fn registered_sources(&self) -> Vec<String> {
        self.core.pairing().sources()
    }

    /// Stop the sweep and event processing.
    ///
    /// Idempotent. Returns once every task has finished; storages are left
    /// open for their owner to close.
    pub async fn destroy(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("[generator] task ended abnormally: {e}");
            }
        }
        crate::debug_event!("generator", "destroyed");
    }
}

async fn dispatch(
    core: Arc<GeneratorCore>,
    mut events_rx: mpsc::UnboundedReceiver<GeneratorEvent>,
    shutdown: CancellationToken,
) {
    let every = core.options.cron_interval.max(MIN_CRON_INTERVAL);
    let mut cron = interval_at(tokio::time::Instant::now() + every, every);
    cron.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            Some(GeneratorEvent::Storage { storage_id, event }) = events_rx.recv() => {
                if let Err(e) = core.handle_event(&storage_id, event).await {
                    tracing::error!("[generator] event from {storage_id} rejected: {e}");
                }
            }

            _ = cron.tick() => core.cron_job().await,
        }
    }
}

impl GeneratorCore {
    fn pairing(&self) -> StoragePairing {
        match self.pairing.read() {
            Ok(pairing) => pairing.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn storage(&self, id: &str) -> Option<&StorageObject> {
        self.storages.iter().find(|s| s.id == id)
    }

    /// Register every watch folder flow, returning the paired sources.
    fn register_flows(&self) -> Vec<StorageObject> {
        let mut pairing = StoragePairing::new();
        let mut sources: Vec<StorageObject> = Vec::new();

        for flow in &self.flows {
            if flow.media_flow_type != MediaFlowType::WatchFolder {
                continue;
            }
            match self.resolve_flow(flow) {
                Ok((source, destination)) => {
                    pairing.register(&flow.id, &source.id, &destination.id, flow.copy_removed);
                    if !sources.iter().any(|s| s.id == source.id) {
                        sources.push(source.clone());
                    }
                    crate::debug_event!(
                        "generator",
                        "paired",
                        "{} -> {} ({})",
                        source.id,
                        destination.id,
                        flow.id
                    );
                }
                Err(e) => tracing::error!("[generator] flow {} skipped: {e}", flow.id),
            }
        }

        match self.pairing.write() {
            Ok(mut current) => *current = pairing,
            Err(poisoned) => *poisoned.into_inner() = pairing,
        }
        sources
    }

    fn resolve_flow(&self, flow: &MediaFlow) -> GeneratorResult<(&StorageObject, &StorageObject)> {
        let unknown = |storage_id: &str| GeneratorError::UnknownStorage {
            flow_id: flow.id.clone(),
            storage_id: storage_id.to_string(),
        };
        let source = self
            .storage(&flow.source_id)
            .ok_or_else(|| unknown(&flow.source_id))?;
        let destination = self
            .storage(&flow.destination_id)
            .ok_or_else(|| unknown(&flow.destination_id))?;

        if source.options.only_selected_files {
            return Err(GeneratorError::IncompatibleStorage {
                storage_id: source.id.clone(),
            });
        }
        Ok((source, destination))
    }

    /// Source storage and its paired destination.
    fn paired(&self, storage_id: &str) -> GeneratorResult<(&StorageObject, &StorageObject)> {
        let unregistered = || GeneratorError::Unregistered(storage_id.to_string());
        let destination_id = self
            .pairing()
            .destination_of(storage_id)
            .map(str::to_string)
            .ok_or_else(unregistered)?;
        let source = self.storage(storage_id).ok_or_else(unregistered)?;
        let destination = self
            .storage(&destination_id)
            .ok_or_else(|| GeneratorError::Unregistered(destination_id.clone()))?;
        Ok((source, destination))
    }

    async fn handle_event(&self, storage_id: &str, event: StorageEvent) -> GeneratorResult<()> {
        let (source, destination) = self.paired(storage_id)?;
        match event.kind {
            StorageEventKind::Add | StorageEventKind::Change => {
                self.on_file_updated(source, destination, event).await
            }
            StorageEventKind::Delete => {
                self.on_delete(source, &event.path).await;
                Ok(())
            }
        }
    }

    async fn on_file_updated(
        &self,
        source: &StorageObject,
        destination: &StorageObject,
        event: StorageEvent,
    ) -> GeneratorResult<()> {
        let Some(file) = event.file else {
            return Err(GeneratorError::MissingFile { path: event.path });
        };

        match self.tracked.get_by_id(&event.path).await {
            Ok(_) => {
                crate::debug_event!(
                    "generator",
                    "already tracked",
                    "{} on {}",
                    event.path,
                    source.id
                );
            }
            Err(e) if e.is_not_found() => {
                match self.register_file(&file, source, destination).await {
                    Ok(()) => {
                        crate::debug_event!("generator", "tracking", "{} on {}", event.path, source.id)
                    }
                    Err(e) => {
                        tracing::error!("[generator] registration of {} failed: {e}", event.path)
                    }
                }
            }
            Err(e) => {
                tracing::error!("[generator] lookup of {} failed: {e}", event.path);
                return Ok(());
            }
        }

        let target_file = match destination.handler.get_file(&file.name).await {
            Ok(target_file) => target_file,
            Err(e) if e.is_not_found() => {
                self.emit_copy(
                    &event.path,
                    &file,
                    destination,
                    WorkFlowSource::LocalMediaItem,
                    None,
                    "missing on target",
                );
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(
                    "[generator] cannot look up {} on {}: {e}",
                    file.name,
                    destination.id
                );
                return Ok(());
            }
        };

        let sizes = async {
            let target = destination.handler.get_properties(&target_file).await?;
            let local = source.handler.get_properties(&file).await?;
            Ok::<_, crate::storage::StorageError>((local.size, target.size))
        };
        match sizes.await {
            Ok((local, target)) if local != target => {
                self.emit_copy(
                    &event.path,
                    &file,
                    destination,
                    WorkFlowSource::LocalMediaItem,
                    None,
                    "size differs on target",
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!("[generator] cannot compare {}: {e}", file.name),
        }
        Ok(())
    }

    async fn register_file(
        &self,
        file: &FileHandle,
        source: &StorageObject,
        destination: &StorageObject,
    ) -> GeneratorResult<()> {
        let name = file.name.clone();
        let source_id = source.id.clone();
        let destination_id = destination.id.clone();
        let flow_id = self.pairing().get(&source.id).map(|p| p.flow_id.clone());
        let linger_time = self.options.linger_time;

        self.tracked
            .upsert(&file.name, move |existing| {
                let mut item = existing.unwrap_or_else(|| TrackedMediaItem::new(&name, &name));
                item.name = name.clone();
                item.source_storage_id = Some(source_id.clone());
                item.media_flow_id = flow_id.clone();
                item.last_seen = Utc::now();
                item.linger_time = linger_time;
                item.add_target(destination_id.clone());
                item
            })
            .await?;
        Ok(())
    }

    async fn on_delete(&self, source: &StorageObject, path: &str) {
        let item = match self.tracked.get_by_id(path).await {
            Ok(item) => item,
            Err(e) if e.is_not_found() => {
                crate::debug_event!("generator", "untracked delete", "{path} on {}", source.id);
                return;
            }
            Err(e) => {
                tracing::error!("[generator] lookup of {path} failed: {e}");
                return;
            }
        };

        if !item.is_from(&source.id) {
            crate::debug_event!("generator", "foreign delete", "{path} is sourced elsewhere");
            return;
        }

        for target_id in &item.target_storage_ids {
            let Some(target) = self.storage(target_id) else {
                tracing::warn!("[generator] unknown target storage {target_id} for {path}");
                continue;
            };
            match target.handler.get_file(&item.name).await {
                Ok(file) => {
                    let workflow = WorkFlow::new(
                        path,
                        &file.name,
                        WorkFlowSource::SourceStorageRemove,
                        vec![WorkStep::delete(file.clone(), &target.id)],
                    );
                    crate::debug_event!(
                        "generator",
                        "delete workflow",
                        "{} from {}: {}",
                        item.name,
                        target.id,
                        workflow.id
                    );
                    self.sink.emit(workflow);
                }
                Err(e) => {
                    tracing::warn!("[generator] cannot find {} on {}: {e}", item.name, target.id);
                }
            }
        }

        match self.tracked.remove(&item).await {
            Ok(()) => crate::debug_event!("generator", "untracked", "{path} removed from {}", source.id),
            Err(e) => tracing::error!("[generator] {path} could not be untracked: {e}"),
        }
    }

    async fn initial_check(&self, storage_id: &str) -> GeneratorResult<()> {
        let (source, destination) = self.paired(storage_id)?;
        let scan_start = Utc::now();

        let files = source.handler.get_all_files().await?;
        crate::log_event!(
            "generator",
            "initial check",
            "{} file(s) on {}",
            files.len(),
            source.id
        );

        for file in files {
            match self.tracked.get_by_id(&file.name).await {
                Ok(mut item) => {
                    if !item.is_from(&source.id) {
                        continue;
                    }
                    item.last_seen = scan_start;
                    if let Err(e) = self.tracked.put(item.clone()).await {
                        tracing::error!("[generator] cannot refresh {}: {e}", item.name);
                    }
                    if let Err(e) = destination.handler.get_file(&item.name).await {
                        crate::debug_event!("generator", "target check", "{}: {e}", item.name);
                        self.on_file_updated(source, destination, StorageEvent::add(file))
                            .await?;
                    }
                }
                Err(e) if e.is_not_found() => {
                    self.on_file_updated(source, destination, StorageEvent::add(file))
                        .await?;
                }
                Err(e) => tracing::error!("[generator] lookup of {} failed: {e}", file.name),
            }
        }

        let stale = self
            .tracked
            .get_all_from_storage(&source.id, Some(ItemFilter::last_seen_before(scan_start)))
            .await?;
        for item in stale {
            crate::debug_event!("generator", "stale", "{} not seen on {}", item.id, source.id);
            self.on_delete(source, &item.id).await;
        }
        Ok(())
    }

    async fn cron_job(&self) {
        crate::debug_event!("generator", "storage check");
        let sources = self.pairing().cron_sources().to_vec();
        for storage_id in sources {
            if let Err(e) = self.storage_check(&storage_id).await {
                tracing::error!("[generator] storage check of {storage_id} failed: {e}");
            }
        }
    }

    async fn storage_check(&self, storage_id: &str) -> GeneratorResult<()> {
        let pairing = self.pairing();
        if !pairing.is_cron_source(storage_id) {
            return Err(GeneratorError::Unregistered(storage_id.to_string()));
        }
        let source = self
            .storage(storage_id)
            .ok_or_else(|| GeneratorError::Unregistered(storage_id.to_string()))?;

        let items = self.tracked.get_all_from_storage(storage_id, None).await?;
        for item in items {
            self.check_and_emit_copy(&item, source, &pairing).await;
        }
        Ok(())
    }

    /// Emit a copy for every destination of `item` that is missing it or
    /// holds a copy of a different size.
    async fn check_and_emit_copy(
        &self,
        item: &TrackedMediaItem,
        source: &StorageObject,
        pairing: &StoragePairing,
    ) {
        let file = match source.handler.get_file(&item.name).await {
            Ok(file) => file,
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                tracing::error!("[generator] {} failed to be checked on {}: {e}", item.name, source.id);
                return;
            }
        };
        let source_size = match source.handler.get_properties(&file).await {
            Ok(props) => props.size,
            Err(e) => {
                tracing::error!("[generator] cannot read properties of {}: {e}", item.name);
                return;
            }
        };

        let targets = pairing
            .destinations()
            .iter()
            .filter(|id| item.target_storage_ids.contains(id))
            .filter_map(|id| self.storage(id));

        for target in targets {
            let reason = match target.handler.get_file(&item.name).await {
                Ok(target_file) => match target.handler.get_properties(&target_file).await {
                    Ok(props) if props.size != source_size => "size differs on target",
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::error!(
                            "[generator] {} exists on {} but its properties could not be checked: {e}",
                            item.name,
                            target.id
                        );
                        "target properties unreadable"
                    }
                },
                Err(_) => "missing on target",
            };
            self.emit_copy(
                &file.name,
                &file,
                target,
                WorkFlowSource::TargetStorageRemove,
                item.comment.clone(),
                reason,
            );
        }
    }

    fn emit_copy(
        &self,
        trigger_path: &str,
        file: &FileHandle,
        target: &StorageObject,
        source: WorkFlowSource,
        comment: Option<String>,
        reason: &str,
    ) {
        let workflow = WorkFlow::new(
            trigger_path,
            &file.name,
            source,
            vec![WorkStep::copy(file.clone(), &target.id)],
        )
        .with_comment(comment);
        crate::debug_event!(
            "generator",
            "copy workflow",
            "{} to {} ({reason}): {}",
            file.name,
            target.id,
            workflow.id
        );
        self.sink.emit(workflow);
    }
}
