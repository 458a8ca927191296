//! Event types for reporting workflow progress
//!
//! Events are sent from the engine to any consumer (UI, logs, metrics) as
//! fire-and-forget notifications. A sink that fails to deliver never fails
//! the run; the engine only logs the error.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Trait for receiving workflow events
///
/// Abstracts over the transport so the engine can run in different hosts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be delivered (e.g. channel
    /// closed)
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    #[serde(rename_all = "camelCase")]
    WorkflowStarted { workflow_id: String, run_id: String },

    #[serde(rename_all = "camelCase")]
    WorkflowCompleted {
        workflow_id: String,
        run_id: String,
        /// False when some steps failed under continue-on-error
        success: bool,
        duration_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    WorkflowFailed {
        workflow_id: String,
        run_id: String,
        error: String,
    },

    #[serde(rename_all = "camelCase")]
    WorkflowCancelled { workflow_id: String, run_id: String },

    #[serde(rename_all = "camelCase")]
    NodeStarted {
        node_id: String,
        run_id: String,
        node_type: String,
    },

    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        node_id: String,
        run_id: String,
        output: Option<serde_json::Value>,
        duration_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    NodeFailed {
        node_id: String,
        run_id: String,
        error: String,
        attempts: u32,
    },

    /// A step is about to be retried after a transient failure
    #[serde(rename_all = "camelCase")]
    NodeRetrying {
        node_id: String,
        run_id: String,
        attempt: u32,
        error: String,
    },

    /// A disabled step was passed over
    #[serde(rename_all = "camelCase")]
    NodeSkipped { node_id: String, run_id: String },
}

impl WorkflowEvent {
    /// Step this event concerns, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeFailed { node_id, .. }
            | Self::NodeRetrying { node_id, .. }
            | Self::NodeSkipped { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::WorkflowStarted { run_id, .. }
            | Self::WorkflowCompleted { run_id, .. }
            | Self::WorkflowFailed { run_id, .. }
            | Self::WorkflowCancelled { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::NodeRetrying { run_id, .. }
            | Self::NodeSkipped { run_id, .. } => run_id,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: WorkflowEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for tests that check which events were emitted.
#[derive(Default)]
pub struct VecEventSink {
    events: std::sync::Mutex<Vec<WorkflowEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<WorkflowEvent>> {
        // A poisoned list is still a valid list
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.lock().push(event);
        Ok(())
    }
}

/// Forwards events into a tokio channel
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        Self { sender }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.sender
            .send(event)
            .map_err(|_| EventError::channel_closed())
    }
}
