//! Settings loading and the configuration commands of the binary.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;
use watchflow::config::{Settings, StorageKind};
use watchflow::generator::MediaFlowType;

const SETTINGS: &str = r#"
version = 1

[ledger]
path = "/var/lib/watchflow/ledger"
linger_time_ms = 60000

[generator]
cron_interval_ms = 30000

[workflows]
output = "/var/log/watchflow/workflows.jsonl"

[[storages]]
id = "ingest"
type = "local_folder"
base_path = "/media/ingest"

[[storages]]
id = "picked"
base_path = "/media/picked"
only_selected_files = true

[[storages]]
id = "nas"
base_path = "/mnt/nas"

[[flows]]
id = "ingest-to-nas"
source_id = "ingest"
destination_id = "nas"
copy_removed = true

[[flows]]
id = "expected"
source_id = "picked"
destination_id = "nas"
media_flow_type = "expected_items"
"#;

fn write_settings(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("settings.toml");
    std::fs::write(&path, contents).unwrap();
    (temp_dir, path)
}

#[test]
fn test_load_storages_and_flows() {
    let (_dir, path) = write_settings(SETTINGS);
    let settings = Settings::load_from(&path).unwrap();

    assert_eq!(settings.ledger.path, PathBuf::from("/var/lib/watchflow/ledger"));
    assert_eq!(
        settings.workflows.output,
        Some(PathBuf::from("/var/log/watchflow/workflows.jsonl"))
    );

    assert_eq!(settings.storages.len(), 3);
    let ingest = settings.storage("ingest").unwrap();
    assert_eq!(ingest.kind, StorageKind::LocalFolder);
    assert!(!ingest.only_selected_files);
    assert!(settings.storage("picked").unwrap().only_selected_files);
    assert!(settings.storage("missing").is_none());

    assert_eq!(settings.flows.len(), 2);
    let flow = &settings.flows[0];
    assert_eq!(flow.media_flow_type, MediaFlowType::WatchFolder);
    assert!(flow.copy_removed);
    assert_eq!(settings.flows[1].media_flow_type, MediaFlowType::ExpectedItems);
    assert!(!settings.flows[1].copy_removed);
}

#[test]
fn test_generator_options_follow_settings() {
    let (_dir, path) = write_settings(SETTINGS);
    let settings = Settings::load_from(&path).unwrap();

    let options = settings.generator_options();
    assert_eq!(options.cron_interval, Duration::from_secs(30));
    assert_eq!(options.linger_time, Duration::from_secs(60));
}

#[test]
fn test_missing_file_gives_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let settings = Settings::load_from(temp_dir.path().join("absent.toml")).unwrap();

    assert_eq!(settings.ledger.path, Settings::default().ledger.path);
    assert!(settings.storages.is_empty());
    assert!(settings.flows.is_empty());
    assert_eq!(
        settings.watcher.options().stability_threshold,
        Duration::from_secs(2)
    );
}

#[test]
fn test_environment_overrides_file() {
    let (_dir, path) = write_settings(SETTINGS);

    // Only this test reads the restart interval
    unsafe {
        std::env::set_var("WF_WATCHER__RESTART_INTERVAL_MS", "1500");
    }
    let settings = Settings::load_from(&path).unwrap();
    unsafe {
        std::env::remove_var("WF_WATCHER__RESTART_INTERVAL_MS");
    }

    assert_eq!(settings.watcher.restart_interval_ms, 1500);
    assert_eq!(
        settings.watcher.options().restart_interval,
        Duration::from_millis(1500)
    );
}

#[test]
fn test_invalid_settings_are_rejected() {
    let (_dir, path) = write_settings("[[storages]]\nid = \"no-base-path\"\n");
    assert!(Settings::load_from(&path).is_err());
}

#[test]
fn test_cli_init_and_config() {
    let temp_dir = TempDir::new().unwrap();
    let binary = env!("CARGO_BIN_EXE_watchflow");

    let output = Command::new(binary)
        .arg("init")
        .current_dir(temp_dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(temp_dir.path().join(".watchflow/settings.toml").exists());

    // Second init without --force fails
    let output = Command::new(binary)
        .arg("init")
        .current_dir(temp_dir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());

    let output = Command::new(binary)
        .args(["init", "--force"])
        .current_dir(temp_dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let output = Command::new(binary)
        .arg("config")
        .current_dir(temp_dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("cron_interval_ms = 600000"));
}

#[test]
fn test_cli_tracked_list_on_empty_ledger() {
    let temp_dir = TempDir::new().unwrap();
    let (_settings_dir, path) = write_settings(&format!(
        "[ledger]\npath = {:?}\n",
        temp_dir.path().join("ledger").to_string_lossy()
    ));

    let output = Command::new(env!("CARGO_BIN_EXE_watchflow"))
        .args(["--config", path.to_str().unwrap(), "tracked", "list"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "[]");

    let output = Command::new(env!("CARGO_BIN_EXE_watchflow"))
        .args(["--config", path.to_str().unwrap(), "tracked", "show", "a.mxf"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}
