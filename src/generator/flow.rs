//! Declared media flows.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaFlowType {
    /// Mirror everything in a source folder onto a destination.
    WatchFolder,
    /// Handled by other generators.
    LocalIngest,
    ExpectedItems,
}

/// A configured source to destination flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlow {
    pub id: String,
    pub source_id: String,
    pub destination_id: String,
    #[serde(default = "default_flow_type")]
    pub media_flow_type: MediaFlowType,
    /// Re-copy files that go missing or drift on the destination.
    #[serde(default)]
    pub copy_removed: bool,
}

fn default_flow_type() -> MediaFlowType {
    MediaFlowType::WatchFolder
}

impl MediaFlow {
    pub fn watch_folder(
        id: impl Into<String>,
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            media_flow_type: MediaFlowType::WatchFolder,
            copy_removed: false,
        }
    }

    pub fn with_copy_removed(mut self, copy_removed: bool) -> Self {
        self.copy_removed = copy_removed;
        self
    }
}
