use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one workflow execution.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle events emitted while a workflow graph is walked.
///
/// Events are published for observers only; nothing in the engine reads them back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A workflow execution started.
    WorkflowStarted {
        execution_id: ExecutionId,
        /// Rendered graph notation.
        graph: String,
        restart: bool,
    },
    /// A node was handed to a hook (`execute`, `skip`, `cancel`, `restart`).
    NodeDispatched {
        execution_id: ExecutionId,
        node: String,
        mode: String,
    },
    /// A node reached a terminal status.
    NodeResolved {
        execution_id: ExecutionId,
        node: String,
        /// Status in display form, e.g. `executed(SUCCESS)`.
        status: String,
    },
    /// A node hook returned an error; its branch stops here.
    NodeFailed {
        execution_id: ExecutionId,
        node: String,
        error: String,
    },
    /// The result handle has been completed.
    WorkflowCompleted {
        execution_id: ExecutionId,
        succeeded: bool,
    },
}

impl WorkflowEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::WorkflowStarted { execution_id, .. }
            | Self::NodeDispatched { execution_id, .. }
            | Self::NodeResolved { execution_id, .. }
            | Self::NodeFailed { execution_id, .. }
            | Self::WorkflowCompleted { execution_id, .. } => execution_id,
        }
    }

    /// Short name used as `event_type` in run logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::NodeDispatched { .. } => "node_dispatched",
            Self::NodeResolved { .. } => "node_resolved",
            Self::NodeFailed { .. } => "node_failed",
            Self::WorkflowCompleted { .. } => "workflow_completed",
        }
    }
}
