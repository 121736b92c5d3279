use thiserror::Error;

#[derive(Debug, Error)]
pub enum CdsError {
    // Node errors
    #[error("Node execution failed: {node}: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Failed to determine outcome for node: {node}")]
    OutcomeLookup { node: String },

    #[error("Node hook panicked: {node}")]
    HookPanicked { node: String },

    // Workflow errors
    #[error("Workflow initialization failed: {0}")]
    Initialization(String),

    #[error("Workflow result handle dropped before completion")]
    ResultAbandoned,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CdsError {
    /// Shorthand for a node execution failure.
    pub fn node(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CdsError>;
