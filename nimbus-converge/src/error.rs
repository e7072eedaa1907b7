//! Error types for adapters and the convergence core.

use thiserror::Error;

use crate::image::ImageStatus;
use crate::node::NodeStatus;

/// Errors returned by provider adapters.
///
/// Adapters normalize their own duplicate/in-use error codes into these kinds
/// so the core never matches on provider-specific strings.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A resource with the requested name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource is still referenced and cannot be removed yet.
    #[error("in use: {0}")]
    InUse(String),

    /// The provider endpoint could not be reached.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by the convergence core.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Invalid input or configuration; nothing was polled.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The node reached a terminal status that makes the target unreachable.
    #[error("node {id} is {status} while waiting for {target} (after {elapsed_secs}s)")]
    Disqualified {
        id: String,
        status: NodeStatus,
        target: NodeStatus,
        elapsed_secs: u64,
    },

    /// The node never reached the target status within its budget.
    #[error("node {id} did not reach {target} within {max_wait_secs} seconds; last observed status: {last_status}")]
    Timeout {
        id: String,
        target: NodeStatus,
        max_wait_secs: u64,
        last_status: NodeStatus,
    },

    /// The refresh call reported that the resource no longer exists.
    #[error("resource {id} disappeared while waiting for {target}")]
    ResourceDisappeared { id: String, target: String },

    /// No candidate address accepted connections within the budget.
    #[error("could not find an open socket on port {port} of node {node_id} within {max_wait_secs} seconds")]
    SocketNotFound {
        port: u16,
        node_id: String,
        max_wait_secs: u64,
    },

    /// The image was not available within the configured max wait.
    #[error("image {id} was not available within {max_wait_secs} seconds; last observed status: {last_status}")]
    ImageTimeout {
        id: String,
        max_wait_secs: u64,
        last_status: ImageStatus,
    },

    /// The provider reported the image bake as failed.
    #[error("image {id} failed to bake (status {status})")]
    ImageFailed { id: String, status: ImageStatus },

    /// The call that begins an asynchronous operation was rejected.
    #[error("failed to submit {operation}: {source}")]
    Submission {
        operation: String,
        #[source]
        source: ProviderError,
    },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A connection could not be acquired within the retry budget.
    #[error("error acquiring {connection} (out of retries - max {attempts}): {source}")]
    RetriesExhausted {
        connection: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    /// The background operation was cancelled or its task panicked.
    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

/// Result type for convergence operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;
