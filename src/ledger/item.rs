//! Tracked item records and scan filters.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Revision token of a stored record.
///
/// Starts at 1 and grows by one on every committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(u64);

impl Revision {
    /// Revision of a freshly inserted record.
    pub fn first() -> Self {
        Self(1)
    }

    /// Create a revision from a stored value, returning None if zero.
    pub fn from_u64(value: u64) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    /// The revision after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Get the inner value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the ledger believes about one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedMediaItem {
    /// Identity: the file's logical path.
    pub id: String,

    /// External identifiers this file is expected to satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_media_item_id: Option<Vec<String>>,

    /// Storage considered authoritative for this file.
    #[serde(default)]
    pub source_storage_id: Option<String>,

    /// Destinations this file is propagated to.
    #[serde(default)]
    pub target_storage_ids: Vec<String>,

    /// Flow that registered this file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_flow_id: Option<String>,

    pub name: String,

    pub last_seen: DateTime<Utc>,

    /// How long the record may linger once the file is no longer observed.
    pub linger_time: Duration,

    /// Free-form note carried into emitted workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Revision this copy was read at; `None` for records never stored.
    #[serde(skip)]
    pub revision: Option<Revision>,
}

impl TrackedMediaItem {
    /// A new, unstored record seen now.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            expected_media_item_id: None,
            source_storage_id: None,
            target_storage_ids: Vec::new(),
            media_flow_id: None,
            name: name.into(),
            last_seen: Utc::now(),
            linger_time: Duration::ZERO,
            comment: None,
            revision: None,
        }
    }

    /// Set the authoritative storage.
    pub fn with_source(mut self, storage_id: impl Into<String>) -> Self {
        self.source_storage_id = Some(storage_id.into());
        self
    }

    /// Add a destination storage.
    pub fn with_target(mut self, storage_id: impl Into<String>) -> Self {
        self.add_target(storage_id);
        self
    }

    /// Add a destination unless it is already listed. Returns `true` if added.
    pub fn add_target(&mut self, storage_id: impl Into<String>) -> bool {
        let storage_id = storage_id.into();
        if self.target_storage_ids.contains(&storage_id) {
            return false;
        }
        self.target_storage_ids.push(storage_id);
        true
    }

    /// Whether the record is sourced from the given storage.
    pub fn is_from(&self, storage_id: &str) -> bool {
        self.source_storage_id.as_deref() == Some(storage_id)
    }

    /// Whether the record has outlived its linger time at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.linger_time) {
            Ok(linger) => self.last_seen + linger < now,
            Err(_) => false,
        }
    }
}

/// Conjunctive filter applied on top of a per-storage scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemFilter {
    /// Only records with `last_seen` strictly before this instant.
    pub last_seen_before: Option<DateTime<Utc>>,
    /// Only records with `last_seen` at or after this instant.
    pub last_seen_since: Option<DateTime<Utc>>,
    /// Only records registered by this flow.
    pub media_flow_id: Option<String>,
    /// Only records propagated to this destination.
    pub target_storage_id: Option<String>,
}

impl ItemFilter {
    /// Records not seen since `instant`.
    pub fn last_seen_before(instant: DateTime<Utc>) -> Self {
        Self {
            last_seen_before: Some(instant),
            ..Self::default()
        }
    }

    /// Restrict to records propagated to `storage_id`.
    pub fn with_target(mut self, storage_id: impl Into<String>) -> Self {
        self.target_storage_id = Some(storage_id.into());
        self
    }

    /// Check a record against every condition.
    pub fn matches(&self, item: &TrackedMediaItem) -> bool {
        if let Some(before) = self.last_seen_before {
            if item.last_seen >= before {
                return false;
            }
        }
        if let Some(since) = self.last_seen_since {
            if item.last_seen < since {
                return false;
            }
        }
        if let Some(flow) = &self.media_flow_id {
            if item.media_flow_id.as_ref() != Some(flow) {
                return false;
            }
        }
        if let Some(target) = &self.target_storage_id {
            if !item.target_storage_ids.contains(target) {
                return false;
            }
        }
        true
    }
}
