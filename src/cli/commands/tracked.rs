//! Tracked command - inspect ledger records as JSON.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;

use crate::config::Settings;
use crate::ledger::{TrackedItems, TrackedMediaItem};

fn open(settings: &Settings) -> Result<TrackedItems> {
    TrackedItems::open_with_heap(&settings.ledger.path, settings.ledger.writer_heap_bytes)
        .with_context(|| format!("Cannot open ledger at {}", settings.ledger.path.display()))
}

/// Record as JSON, with its revision.
fn to_json(item: &TrackedMediaItem) -> Result<Value> {
    let mut value = serde_json::to_value(item)?;
    if let (Value::Object(map), Some(revision)) = (&mut value, item.revision) {
        map.insert("revision".to_string(), Value::from(revision.value()));
    }
    Ok(value)
}

pub async fn run_list(settings: &Settings, storage: Option<&str>, expired: bool) -> Result<()> {
    let tracked = open(settings)?;
    let mut items = match storage {
        Some(storage_id) => tracked.get_all_from_storage(storage_id, None).await?,
        None => tracked.all().await?,
    };
    if expired {
        let now = Utc::now();
        items.retain(|item| item.is_expired(now));
    }

    let values = items.iter().map(to_json).collect::<Result<Vec<_>>>()?;
    println!("{}", serde_json::to_string_pretty(&values)?);
    Ok(())
}

pub async fn run_show(settings: &Settings, id: &str) -> Result<()> {
    let tracked = open(settings)?;
    let item = tracked
        .get_by_id(id)
        .await
        .with_context(|| format!("No tracked item {id}"))?;
    println!("{}", serde_json::to_string_pretty(&to_json(&item)?)?);
    Ok(())
}
