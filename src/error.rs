use thiserror::Error;

use crate::dataset::TreeState;

/// Error kinds raised by the runtime.
///
/// Everything is returned through `anyhow::Result`, callers that need to
/// distinguish a failure class use `err.downcast_ref::<RuntimeError>()`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Tree operation called outside of its lifecycle state
    #[error("Invalid tree state for {action}: current state is {current}, expected {expected}")]
    InvalidTreeState {
        action: &'static str,
        current: TreeState,
        expected: &'static str,
    },

    /// Relationship between nodes of two different trees
    #[error("Node '{0}' does not belong to this execution tree")]
    ForeignNode(String),

    /// Node registered twice
    #[error("Node '{name}' is already associated with id {id}")]
    AlreadyAssociated { name: String, id: usize },

    /// Device memory request that cannot be served
    #[error("Out of device memory: {0}")]
    OutOfMemory(String),

    /// Structural precondition of a graph violated
    #[error("Malformed graph: {0}")]
    MalformedGraph(String),

    /// Host/device copy failure
    #[error("Memory sync failed: {0}")]
    SyncFailed(String),

    /// Kernel launch failure
    #[error("Kernel launch failed: {0}")]
    LaunchFailed(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    /// Stop requested while waiting on a queue
    #[error("Task interrupted")]
    Interrupted,
}

impl RuntimeError {
    pub fn unexpected(msg: impl Into<String>) -> anyhow::Error {
        RuntimeError::Unexpected(msg.into()).into()
    }

    pub fn malformed(msg: impl Into<String>) -> anyhow::Error {
        RuntimeError::MalformedGraph(msg.into()).into()
    }

    pub fn out_of_memory(msg: impl Into<String>) -> anyhow::Error {
        RuntimeError::OutOfMemory(msg.into()).into()
    }
}

/// True when the error is a cooperative cancellation rather than a failure.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<RuntimeError>(), Some(RuntimeError::Interrupted))
}
