use cds_core::CdsError;
use thiserror::Error;

/// Errors raised while reading graph notation or workflow definitions.
///
/// These are reported before any execution begins; no partial graph is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphParseError {
    #[error("graph notation must start with '[' and end with ']': {0}")]
    MissingBrackets(String),

    #[error("malformed edge '{0}', expected <source>><target>/<label>")]
    MalformedEdge(String),

    #[error("empty node id in '{0}'")]
    EmptyNodeId(String),

    #[error("unknown edge label: {0}")]
    UnknownLabel(String),

    #[error("workflow definition has no steps")]
    EmptyDefinition,

    #[error("duplicate workflow step: {0}")]
    DuplicateStep(String),

    #[error("step '{step}' references undefined step '{target}'")]
    UndefinedStep { step: String, target: String },

    #[error("invalid workflow definition: {0}")]
    Definition(String),
}

/// Terminal error handed to `prepare_workflow_output`.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// `initialize_workflow` failed; no node was dispatched.
    #[error("workflow initialization failed: {0}")]
    Initialize(#[source] CdsError),

    /// A node hook failed; its branch was terminated.
    #[error("node '{node}' failed: {source}")]
    Node {
        node: String,
        #[source]
        source: CdsError,
    },

    /// Nothing was left to run but `END` never resolved.
    #[error("workflow stopped before END was reached; unresolved nodes: {pending:?}")]
    EndNotReached { pending: Vec<String> },
}

impl WorkflowError {
    /// Node the error is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Node { node, .. } => Some(node),
            _ => None,
        }
    }
}
