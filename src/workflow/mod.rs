//! Workflow documents and the sinks they are emitted to.

mod sink;
mod types;

pub use sink::{ChannelSink, JsonLinesSink, WorkflowSink};
pub use types::{
    FILE_STEP_PRIORITY, WORKFLOW_PRIORITY, WorkFlow, WorkFlowSource, WorkStep, WorkStepAction,
    WorkStepStatus, workflow_id, workflow_name,
};
