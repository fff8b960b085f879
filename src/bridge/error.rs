//! Error taxonomy shared by every bridge component.

use std::time::Duration;

use thiserror::Error;

use super::models::CallToken;

/// Errors surfaced by the dispatcher, supervisor, registry and probes.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing, empty or mistyped required argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown operation (or channel).
    #[error("not implemented: {channel}/{operation}")]
    NotImplemented { channel: String, operation: String },

    /// A host OS query for memory or storage failed.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// A request was sent while the worker was not `ready`.
    #[error("worker not ready")]
    WorkerNotReady,

    /// The worker exited while the call was outstanding.
    #[error("worker terminated")]
    WorkerTerminated,

    /// Settling a token that is unknown or was already settled.
    #[error("unknown or completed call: {0}")]
    UnknownOrCompletedCall(CallToken),

    #[error("no result within {0:?}")]
    Timeout(Duration),

    /// The worker reported a failure outcome for the call.
    #[error("worker failure: {0}")]
    WorkerFailure(String),

    #[error("failed to start worker: {0}")]
    WorkerSpawn(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Stable error code written next to the message in host replies.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::InvalidArgument(_) => "INVALID_ARGUMENT",
            BridgeError::NotImplemented { .. } => "NOT_IMPLEMENTED",
            BridgeError::ResourceUnavailable(_) => "RESOURCE_UNAVAILABLE",
            BridgeError::WorkerNotReady => "WORKER_NOT_READY",
            BridgeError::WorkerTerminated => "WORKER_TERMINATED",
            BridgeError::UnknownOrCompletedCall(_) => "UNKNOWN_OR_COMPLETED_CALL",
            BridgeError::Timeout(_) => "TIMEOUT",
            BridgeError::WorkerFailure(_) => "WORKER_FAILURE",
            BridgeError::WorkerSpawn(_) => "WORKER_SPAWN",
            BridgeError::Config(_) => "CONFIG",
            BridgeError::Io(_) => "IO",
            BridgeError::Json(_) => "JSON",
        }
    }

    pub(crate) fn not_implemented(channel: &str, operation: &str) -> Self {
        BridgeError::NotImplemented {
            channel: channel.to_string(),
            operation: operation.to_string(),
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
