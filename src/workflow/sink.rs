//! Destinations for emitted workflows.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use tokio::sync::mpsc;

use super::types::WorkFlow;

/// Receives emitted workflows. Emission is fire-and-forget.
pub trait WorkflowSink: Send + Sync {
    fn emit(&self, workflow: WorkFlow);
}

/// Forwards workflows into a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<WorkFlow>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkFlow>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl WorkflowSink for ChannelSink {
    fn emit(&self, workflow: WorkFlow) {
        if self.tx.send(workflow).is_err() {
            tracing::warn!("[workflow] receiver dropped, workflow discarded");
        }
    }
}

/// Writes each workflow as one line of JSON.
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Append to the file at `path`, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(Box::new(file)))
    }
}

impl WorkflowSink for JsonLinesSink {
    fn emit(&self, workflow: WorkFlow) {
        let line = match serde_json::to_string(&workflow) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("[workflow] cannot serialize {}: {e}", workflow.id);
                return;
            }
        };

        let Ok(mut writer) = self.writer.lock() else {
            tracing::error!("[workflow] writer lock poisoned, {} dropped", workflow.id);
            return;
        };
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            tracing::error!("[workflow] cannot write {}: {e}", workflow.id);
        }
    }
}
