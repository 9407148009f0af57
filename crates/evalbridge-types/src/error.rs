//! Shared error types for the bridge.

use thiserror::Error;

/// Top-level error type for the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A frame violated the wire encoding. Fatal to the current message only.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The transport failed; the session that observed it is unusable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// No terminal status or settlement arrived within the bound.
    #[error("Timed out after {elapsed_ms}ms: {what}")]
    Timeout {
        /// What was being waited on.
        what: String,
        /// How long we waited.
        elapsed_ms: u64,
    },

    /// A collaborator raised while executing a remote operation.
    #[error("Evaluation fault: {0}")]
    EvaluationFault(String),

    /// The operation name is outside the supported vocabulary.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A call with this id is already pending.
    #[error("Duplicate correlation id: {0}")]
    DuplicateId(String),

    /// The remote side answered with an error response.
    #[error("Remote error for {id}: {message}")]
    Remote {
        /// Correlation id of the failed call.
        id: String,
        /// Error text reported by the remote side.
        message: String,
    },

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with BridgeError.
pub type BridgeResult<T> = Result<T, BridgeError>;
