//! Workflow documents emitted for execution elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::FileHandle;

/// Priority of emitted workflows.
pub const WORKFLOW_PRIORITY: u32 = 1;
/// Priority of copy and delete steps.
pub const FILE_STEP_PRIORITY: u32 = 2;

/// What triggered a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkFlowSource {
    /// A file was added or changed on a source storage.
    LocalMediaItem,
    /// A file was removed from its source storage.
    SourceStorageRemove,
    /// A destination copy is missing or differs from its source.
    TargetStorageRemove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStepAction {
    Copy,
    Delete,
}

/// Execution state of a step. Only `Idle` is ever set here; the rest belong
/// to whoever executes the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStepStatus {
    Idle,
    Working,
    Done,
    Error,
    Skipped,
}

/// A single file operation against a target storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkStep {
    pub action: WorkStepAction,
    pub file: FileHandle,
    /// Storage the action applies to.
    pub target: String,
    pub priority: u32,
    pub critical_step: bool,
    pub status: WorkStepStatus,
}

impl WorkStep {
    fn file_step(action: WorkStepAction, file: FileHandle, target: impl Into<String>) -> Self {
        Self {
            action,
            file,
            target: target.into(),
            priority: FILE_STEP_PRIORITY,
            critical_step: true,
            status: WorkStepStatus::Idle,
        }
    }

    /// Copy `file` onto `target`.
    pub fn copy(file: FileHandle, target: impl Into<String>) -> Self {
        Self::file_step(WorkStepAction::Copy, file, target)
    }

    /// Delete `file` from `target`.
    pub fn delete(file: FileHandle, target: impl Into<String>) -> Self {
        Self::file_step(WorkStepAction::Delete, file, target)
    }
}

/// An ordered set of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkFlow {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub source: WorkFlowSource,
    pub priority: u32,
    pub created: DateTime<Utc>,
    pub finished: bool,
    pub success: bool,
    pub steps: Vec<WorkStep>,
}

impl WorkFlow {
    /// A fresh, unfinished workflow triggered by `trigger_path`.
    pub fn new(
        trigger_path: &str,
        file_name: &str,
        source: WorkFlowSource,
        steps: Vec<WorkStep>,
    ) -> Self {
        Self {
            id: workflow_id(trigger_path),
            name: workflow_name(file_name),
            comment: None,
            source,
            priority: WORKFLOW_PRIORITY,
            created: Utc::now(),
            finished: false,
            success: false,
            steps,
        }
    }

    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }
}

/// Unique workflow id derived from the triggering path.
pub fn workflow_id(trigger_path: &str) -> String {
    format!("{trigger_path}_{:08x}", rand::random::<u32>())
}

/// Display name of a workflow for a file.
pub fn workflow_name(file_name: &str) -> String {
    format!("Watch folder: {file_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str) -> FileHandle {
        FileHandle {
            name: name.to_string(),
            url: format!("/media/{name}"),
            storage_id: "local".to_string(),
        }
    }

    #[test]
    fn test_ids_do_not_collide() {
        let first = workflow_id("clips/a.mxf");
        let second = workflow_id("clips/a.mxf");
        assert!(first.starts_with("clips/a.mxf_"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_copy_step_defaults() {
        let step = WorkStep::copy(handle("a.mxf"), "nas");
        assert_eq!(step.action, WorkStepAction::Copy);
        assert_eq!(step.priority, FILE_STEP_PRIORITY);
        assert!(step.critical_step);
        assert_eq!(step.status, WorkStepStatus::Idle);
    }

    #[test]
    fn test_workflow_serialization() {
        let workflow = WorkFlow::new(
            "a.mxf",
            "a.mxf",
            WorkFlowSource::SourceStorageRemove,
            vec![WorkStep::delete(handle("a.mxf"), "nas")],
        );
        assert_eq!(workflow.name, "Watch folder: a.mxf");
        assert_eq!(workflow.priority, WORKFLOW_PRIORITY);
        assert!(!workflow.finished);

        let json = serde_json::to_value(&workflow).unwrap();
        assert_eq!(json["source"], "source_storage_remove");
        assert_eq!(json["steps"][0]["action"], "DELETE");
        assert!(json.get("comment").is_none());
    }
}
