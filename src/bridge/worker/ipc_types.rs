//! IPC protocol types for bridge ↔ worker communication.
//!
//! Uses JSON Lines (one JSON object per line) over stdin/stdout pipes.

use serde::{Deserialize, Serialize};

use crate::bridge::models::CallToken;

/// Request sent from the bridge to the worker via stdin.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    /// Correlation token of the call. 0 = not tied to a call.
    pub id: CallToken,
    pub command: WorkerCommand,
}

/// Commands the bridge can send to the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerCommand {
    /// Load a model file.
    LoadModel { model_path: String },
    /// Run one message through the loaded model.
    SendMessage { message: String },
    /// Health check.
    Ping,
    /// Graceful shutdown.
    Shutdown,
}

impl WorkerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::LoadModel { .. } => "LoadModel",
            WorkerCommand::SendMessage { .. } => "SendMessage",
            WorkerCommand::Ping => "Ping",
            WorkerCommand::Shutdown => "Shutdown",
        }
    }
}

/// Response sent from the worker to the bridge via stdout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    /// Matches the request ID. 0 for unsolicited messages.
    pub id: CallToken,
    pub payload: WorkerPayload,
}

/// Response payloads from the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerPayload {
    /// Worker is up and accepting requests. Sent once, unsolicited.
    Ready,
    /// The request completed.
    Success { text: String },
    /// The request failed inside the worker.
    Failure { reason: String },
    /// Health check response.
    Pong,
}

impl WorkerResponse {
    pub fn ok(id: CallToken, text: impl Into<String>) -> Self {
        Self {
            id,
            payload: WorkerPayload::Success { text: text.into() },
        }
    }

    pub fn error(id: CallToken, reason: impl Into<String>) -> Self {
        Self {
            id,
            payload: WorkerPayload::Failure {
                reason: reason.into(),
            },
        }
    }

    pub fn ready() -> Self {
        Self {
            id: CallToken(0),
            payload: WorkerPayload::Ready,
        }
    }
}
