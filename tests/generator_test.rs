mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{MemoryStorage, drain, next_workflow, open_ledger, storage_object};
use tempfile::TempDir;
use watchflow::generator::{GeneratorError, GeneratorOptions, MediaFlow, WatchFolderGenerator};
use watchflow::ledger::{TrackedItems, TrackedMediaItem};
use watchflow::storage::{LocalFolderHandler, StorageEvent, StorageObject};
use watchflow::watcher::WatcherOptions;
use watchflow::workflow::{ChannelSink, WorkFlowSource, WorkStepAction};

struct Fixture {
    source: Arc<MemoryStorage>,
    target: Arc<MemoryStorage>,
    tracked: TrackedItems,
    generator: WatchFolderGenerator,
    workflows: tokio::sync::mpsc::UnboundedReceiver<watchflow::WorkFlow>,
    _ledger_dir: TempDir,
}

fn fixture(copy_removed: bool) -> Fixture {
    fixture_with(copy_removed, GeneratorOptions::default())
}

fn fixture_with(copy_removed: bool, options: GeneratorOptions) -> Fixture {
    let source = MemoryStorage::watchable("source");
    let target = MemoryStorage::new("target");
    let (ledger_dir, tracked) = open_ledger();
    let (sink, workflows) = ChannelSink::new();

    let generator = WatchFolderGenerator::new(
        vec![storage_object(&source, false), storage_object(&target, false)],
        tracked.clone(),
        vec![MediaFlow::watch_folder("flow0", "source", "target").with_copy_removed(copy_removed)],
        Arc::new(sink),
        options,
    );

    Fixture {
        source,
        target,
        tracked,
        generator,
        workflows,
        _ledger_dir: ledger_dir,
    }
}

#[tokio::test]
async fn test_add_then_delete_end_to_end() {
    let mut f = fixture(false);
    f.generator.init().await.unwrap();
    assert!(drain(&mut f.workflows).is_empty());

    f.source.insert("a.txt", 4);
    f.generator
        .handle_event("source", StorageEvent::add(f.source.handle("a.txt")))
        .await
        .unwrap();

    let item = f.tracked.get_by_id("a.txt").await.unwrap();
    assert_eq!(item.source_storage_id.as_deref(), Some("source"));
    assert_eq!(item.target_storage_ids, vec!["target"]);
    assert_eq!(item.media_flow_id.as_deref(), Some("flow0"));

    let workflows = drain(&mut f.workflows);
    assert_eq!(workflows.len(), 1);
    let copy = &workflows[0];
    assert!(copy.id.starts_with("a.txt_"));
    assert_eq!(copy.source, WorkFlowSource::LocalMediaItem);
    assert_eq!(copy.steps.len(), 1);
    assert_eq!(copy.steps[0].action, WorkStepAction::Copy);
    assert_eq!(copy.steps[0].file.name, "a.txt");
    assert_eq!(copy.steps[0].target, "target");

    // The copy was carried out, then the source file goes away
    f.target.insert("a.txt", 4);
    f.source.remove("a.txt");
    f.generator
        .handle_event("source", StorageEvent::delete("a.txt"))
        .await
        .unwrap();

    let workflows = drain(&mut f.workflows);
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0].source, WorkFlowSource::SourceStorageRemove);
    assert_eq!(workflows[0].steps[0].action, WorkStepAction::Delete);
    assert_eq!(workflows[0].steps[0].target, "target");

    assert!(f.tracked.get_by_id("a.txt").await.unwrap_err().is_not_found());
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_add_with_matching_target_emits_nothing() {
    let mut f = fixture(false);
    f.generator.init().await.unwrap();

    f.source.insert("a.txt", 4);
    f.target.insert("a.txt", 4);
    f.generator
        .handle_event("source", StorageEvent::add(f.source.handle("a.txt")))
        .await
        .unwrap();

    assert!(drain(&mut f.workflows).is_empty());
    assert!(f.tracked.get_by_id("a.txt").await.is_ok());
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_change_of_tracked_file_still_checks_target() {
    let mut f = fixture(false);
    f.generator.init().await.unwrap();

    f.source.insert("a.txt", 4);
    f.target.insert("a.txt", 4);
    f.generator
        .handle_event("source", StorageEvent::add(f.source.handle("a.txt")))
        .await
        .unwrap();
    assert!(drain(&mut f.workflows).is_empty());

    f.source.insert("a.txt", 8);
    f.generator
        .handle_event("source", StorageEvent::change(f.source.handle("a.txt")))
        .await
        .unwrap();

    let workflows = drain(&mut f.workflows);
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0].steps[0].action, WorkStepAction::Copy);
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_delete_of_untracked_file_is_ignored() {
    let mut f = fixture(false);
    f.generator.init().await.unwrap();

    f.generator
        .handle_event("source", StorageEvent::delete("never-seen.txt"))
        .await
        .unwrap();

    assert!(drain(&mut f.workflows).is_empty());
    assert!(f.tracked.is_empty());
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_delete_with_missing_target_copy_still_untracks() {
    let mut f = fixture(false);
    f.generator.init().await.unwrap();

    f.source.insert("a.txt", 4);
    f.generator
        .handle_event("source", StorageEvent::add(f.source.handle("a.txt")))
        .await
        .unwrap();
    drain(&mut f.workflows);

    // The copy never happened
    f.source.remove("a.txt");
    f.generator
        .handle_event("source", StorageEvent::delete("a.txt"))
        .await
        .unwrap();

    assert!(drain(&mut f.workflows).is_empty());
    assert!(f.tracked.get_by_id("a.txt").await.unwrap_err().is_not_found());
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_storage_check_detects_drift() {
    let mut f = fixture(true);
    f.generator.init().await.unwrap();

    f.source.insert("a.txt", 4);
    f.target.insert("a.txt", 4);
    f.generator
        .handle_event("source", StorageEvent::add(f.source.handle("a.txt")))
        .await
        .unwrap();
    assert!(drain(&mut f.workflows).is_empty());

    // Matching sizes: nothing to do
    f.generator.storage_check("source").await.unwrap();
    assert!(drain(&mut f.workflows).is_empty());

    // Destination copy corrupted
    f.target.insert("a.txt", 2);
    f.generator.storage_check("source").await.unwrap();
    let workflows = drain(&mut f.workflows);
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0].source, WorkFlowSource::TargetStorageRemove);
    assert_eq!(workflows[0].steps[0].action, WorkStepAction::Copy);
    assert_eq!(workflows[0].steps[0].file.name, "a.txt");
    assert_eq!(workflows[0].steps[0].target, "target");

    // Destination copy deleted
    f.target.remove("a.txt");
    f.generator.cron_job().await;
    assert_eq!(drain(&mut f.workflows).len(), 1);

    f.generator.destroy().await;
}

#[tokio::test]
async fn test_storage_check_copies_when_target_unreadable() {
    let mut f = fixture(true);
    f.generator.init().await.unwrap();

    f.source.insert("a.txt", 4);
    f.target.insert("a.txt", 4);
    f.generator
        .handle_event("source", StorageEvent::add(f.source.handle("a.txt")))
        .await
        .unwrap();
    drain(&mut f.workflows);

    f.target.break_properties("a.txt");
    f.generator.storage_check("source").await.unwrap();
    assert_eq!(drain(&mut f.workflows).len(), 1);
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_storage_check_skips_files_gone_from_source() {
    let mut f = fixture(true);
    f.generator.init().await.unwrap();

    f.source.insert("a.txt", 4);
    f.generator
        .handle_event("source", StorageEvent::add(f.source.handle("a.txt")))
        .await
        .unwrap();
    drain(&mut f.workflows);

    f.source.remove("a.txt");
    f.generator.storage_check("source").await.unwrap();
    assert!(drain(&mut f.workflows).is_empty());
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_storage_check_requires_copy_removed() {
    let f = fixture(false);
    f.generator.init().await.unwrap();

    let err = f.generator.storage_check("source").await.unwrap_err();
    assert!(matches!(err, GeneratorError::Unregistered(_)));
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_initial_check_reconciles_with_ledger() {
    let mut f = fixture(false);
    let long_ago = Utc::now() - chrono::Duration::hours(1);

    // Tracked and still present
    let mut kept = TrackedMediaItem::new("kept.txt", "kept.txt")
        .with_source("source")
        .with_target("target");
    kept.last_seen = long_ago;
    f.tracked.put(kept).await.unwrap();

    // Tracked but removed while not running
    let mut gone = TrackedMediaItem::new("gone.txt", "gone.txt")
        .with_source("source")
        .with_target("target");
    gone.last_seen = long_ago;
    f.tracked.put(gone).await.unwrap();

    f.source.insert("kept.txt", 4);
    f.source.insert("new.txt", 4);
    f.target.insert("kept.txt", 4);
    f.target.insert("gone.txt", 4);

    f.generator.init().await.unwrap();

    let mut workflows = drain(&mut f.workflows);
    workflows.sort_by(|a, b| a.steps[0].file.name.cmp(&b.steps[0].file.name));
    assert_eq!(workflows.len(), 2);

    assert_eq!(workflows[0].steps[0].file.name, "gone.txt");
    assert_eq!(workflows[0].steps[0].action, WorkStepAction::Delete);
    assert_eq!(workflows[1].steps[0].file.name, "new.txt");
    assert_eq!(workflows[1].steps[0].action, WorkStepAction::Copy);

    assert!(f.tracked.get_by_id("gone.txt").await.unwrap_err().is_not_found());
    assert!(f.tracked.get_by_id("new.txt").await.is_ok());
    let kept = f.tracked.get_by_id("kept.txt").await.unwrap();
    assert!(kept.last_seen > long_ago);

    f.generator.destroy().await;
}

#[tokio::test]
async fn test_initial_check_copies_tracked_item_missing_on_target() {
    let mut f = fixture(false);

    let item = TrackedMediaItem::new("kept.txt", "kept.txt")
        .with_source("source")
        .with_target("target");
    f.tracked.put(item).await.unwrap();
    f.source.insert("kept.txt", 4);

    f.generator.init().await.unwrap();

    let workflows = drain(&mut f.workflows);
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0].source, WorkFlowSource::LocalMediaItem);
    assert_eq!(workflows[0].steps[0].action, WorkStepAction::Copy);
    assert_eq!(workflows[0].steps[0].file.name, "kept.txt");
    assert_eq!(workflows[0].steps[0].target, "target");
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_source_is_watched_before_initial_check() {
    let mut f = fixture(false);
    f.generator.init().await.unwrap();

    assert_eq!(f.source.calls(), vec!["watch", "get_all_files"]);

    // Events reach the handlers through the dispatcher
    f.source.insert("b.txt", 4);
    f.source.send(StorageEvent::add(f.source.handle("b.txt")));

    let workflow = next_workflow(&mut f.workflows, Duration::from_secs(2))
        .await
        .expect("copy workflow for the reported file");
    assert_eq!(workflow.steps[0].action, WorkStepAction::Copy);
    assert_eq!(workflow.steps[0].file.name, "b.txt");
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_sweep_runs_on_its_interval() {
    let mut f = fixture_with(
        true,
        GeneratorOptions {
            cron_interval: Duration::from_millis(200),
            ..GeneratorOptions::default()
        },
    );
    f.generator.init().await.unwrap();

    f.source.insert("a.txt", 4);
    f.target.insert("a.txt", 4);
    f.generator
        .handle_event("source", StorageEvent::add(f.source.handle("a.txt")))
        .await
        .unwrap();
    assert!(drain(&mut f.workflows).is_empty());

    f.target.remove("a.txt");

    let workflow = next_workflow(&mut f.workflows, Duration::from_secs(3))
        .await
        .expect("copy workflow from the sweep");
    assert_eq!(workflow.source, WorkFlowSource::TargetStorageRemove);
    assert_eq!(workflow.steps[0].action, WorkStepAction::Copy);
    assert_eq!(workflow.steps[0].file.name, "a.txt");
    assert_eq!(workflow.steps[0].target, "target");
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_zero_cron_interval_keeps_dispatching() {
    let mut f = fixture_with(
        false,
        GeneratorOptions {
            cron_interval: Duration::ZERO,
            ..GeneratorOptions::default()
        },
    );
    f.generator.init().await.unwrap();

    f.source.insert("a.txt", 4);
    f.source.send(StorageEvent::add(f.source.handle("a.txt")));

    let workflow = next_workflow(&mut f.workflows, Duration::from_secs(2))
        .await
        .expect("copy workflow for the reported file");
    assert_eq!(workflow.steps[0].file.name, "a.txt");
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_only_selected_files_source_is_rejected() {
    let source = MemoryStorage::new("source");
    let target = MemoryStorage::new("target");
    let other = MemoryStorage::new("other");
    let (_ledger_dir, tracked) = open_ledger();
    let (sink, _workflows) = ChannelSink::new();

    let generator = WatchFolderGenerator::new(
        vec![
            storage_object(&source, true),
            storage_object(&target, false),
            storage_object(&other, false),
        ],
        tracked,
        vec![
            MediaFlow::watch_folder("selected", "source", "target"),
            MediaFlow::watch_folder("broken", "other", "missing"),
            MediaFlow::watch_folder("ok", "other", "target"),
        ],
        Arc::new(sink),
        GeneratorOptions::default(),
    );
    generator.init().await.unwrap();

    assert_eq!(generator.registered_sources(), vec!["other"]);
    let err = generator
        .handle_event("source", StorageEvent::delete("a.txt"))
        .await
        .unwrap_err();
    assert!(matches!(err, GeneratorError::Unregistered(_)));

    generator.destroy().await;
}

#[tokio::test]
async fn test_init_twice_and_destroy_twice() {
    let f = fixture(false);
    f.generator.init().await.unwrap();
    assert!(matches!(
        f.generator.init().await,
        Err(GeneratorError::AlreadyRunning)
    ));

    f.generator.destroy().await;
    f.generator.destroy().await;
}

#[tokio::test]
async fn test_local_folders_emit_copy_for_new_file() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let (_ledger_dir, tracked) = open_ledger();
    let (sink, mut workflows) = ChannelSink::new();

    let options = WatcherOptions {
        stability_threshold: Duration::from_millis(300),
        ..WatcherOptions::default()
    };
    let local = |id: &str, dir: &TempDir| {
        let handler = LocalFolderHandler::new(id, dir.path()).with_watcher_options(options);
        let storage_options = handler.options();
        StorageObject::new(id, storage_options, Arc::new(handler))
    };
    let storages = vec![local("ingest", &source_dir), local("nas", &target_dir)];

    let generator = WatchFolderGenerator::new(
        storages.clone(),
        tracked.clone(),
        vec![MediaFlow::watch_folder("flow0", "ingest", "nas")],
        Arc::new(sink),
        GeneratorOptions::default(),
    );
    generator.init().await.unwrap();

    // Let the discovery watch settle
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(source_dir.path().join("clip.mxf"), "1234").unwrap();

    let workflow = next_workflow(&mut workflows, Duration::from_secs(5))
        .await
        .expect("copy workflow for the new file");
    assert_eq!(workflow.steps[0].action, WorkStepAction::Copy);
    assert_eq!(workflow.steps[0].file.name, "clip.mxf");
    assert_eq!(workflow.steps[0].target, "nas");

    let item = tracked.get_by_id("clip.mxf").await.unwrap();
    assert!(item.is_from("ingest"));

    generator.destroy().await;
    for storage in &storages {
        storage.handler.close().await;
    }
}
