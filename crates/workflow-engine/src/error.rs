//! Error types for the workflow engine

use thiserror::Error;

/// Result type alias using WorkflowError
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors that can occur while running a workflow
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The graph failed structural validation; holds every reported problem
    #[error("Invalid workflow graph: {}", .0.join("; "))]
    InvalidGraph(Vec<String>),

    /// No executor is registered for a step's type
    #[error("No executor registered for node type '{node_type}' (node '{node_id}')")]
    UnknownNodeType { node_id: String, node_type: String },

    /// A step failed terminally and the run was halted
    #[error("Node '{node_id}' failed after {attempts} attempt(s): {message}")]
    StepFailed {
        node_id: String,
        attempts: u32,
        message: String,
    },

    /// Every permitted attempt failed with a retryable error; `source` is
    /// the error of the final attempt
    #[error("{message} (after {attempts} attempts)")]
    RetriesExhausted {
        attempts: u32,
        message: String,
        #[source]
        source: Box<WorkflowError>,
    },

    /// A step or operation failed
    #[error("{0}")]
    ExecutionFailed(String),

    /// A step did not settle within its timeout
    #[error("Node '{node_id}' timeout after {timeout_ms}ms")]
    Timeout { node_id: String, timeout_ms: u64 },

    /// The run was cancelled
    #[error("Workflow cancelled")]
    Cancelled,

    /// Engine configuration could not be loaded or applied
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    /// Create an execution failed error with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Number of attempts recorded in this error, if it carries one
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::StepFailed { attempts, .. } | Self::RetriesExhausted { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }
}
