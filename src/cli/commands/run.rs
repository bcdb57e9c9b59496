//! Run command - watch storages and emit workflows until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Settings;
use crate::generator::WatchFolderGenerator;
use crate::ledger::TrackedItems;
use crate::storage::{StorageObject, open_storage};
use crate::workflow::{JsonLinesSink, WorkflowSink};

pub async fn run(settings: &Settings) -> Result<()> {
    let tracked = TrackedItems::open_with_heap(&settings.ledger.path, settings.ledger.writer_heap_bytes)
        .with_context(|| format!("Cannot open ledger at {}", settings.ledger.path.display()))?;

    let watcher_options = settings.watcher.options();
    let storages: Vec<StorageObject> = settings
        .storages
        .iter()
        .map(|config| open_storage(config, watcher_options))
        .collect();

    let sink: Arc<dyn WorkflowSink> = match &settings.workflows.output {
        Some(path) => Arc::new(
            JsonLinesSink::append(path)
                .with_context(|| format!("Cannot open workflow output {}", path.display()))?,
        ),
        None => Arc::new(JsonLinesSink::stdout()),
    };

    let generator = WatchFolderGenerator::new(
        storages.clone(),
        tracked.clone(),
        settings.flows.clone(),
        sink,
        settings.generator_options(),
    );
    generator.init().await?;

    let sources = generator.registered_sources();
    if sources.is_empty() {
        eprintln!("No watch folder flows could be started; check [[storages]] and [[flows]]");
    } else {
        eprintln!(
            "Watching {} ({} tracked items). Press Ctrl-C to stop.",
            sources.join(", "),
            tracked.len()
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    eprintln!("Received shutdown signal");

    generator.destroy().await;
    for storage in &storages {
        storage.handler.close().await;
    }
    Ok(())
}
