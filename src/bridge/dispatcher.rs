//! Entry point for named calls from the foreground.
//!
//! Resource channels are answered synchronously from the probe. Model calls
//! are validated here, tagged with a fresh token and queued on the worker;
//! the caller gets an acknowledgement plus a `PendingResponse` right away.

use std::sync::Arc;

use log::{debug, info};
use serde_json::{json, Value};

use super::error::{BridgeError, BridgeResult};
use super::models::{Arguments, CallRequest, CallToken, Channel, Operation};
use super::registry::{PendingResponse, SharedCallRegistry};
use super::supervisor::SharedWorkerSupervisor;
use super::system::ResourceProbe;
use super::worker::ipc_types::{WorkerCommand, WorkerRequest};

/// A worker that vanishes between start and send gets one more try.
const MAX_SEND_ATTEMPTS: u32 = 2;

/// What `Dispatcher::handle` hands back to the caller.
#[derive(Debug)]
pub enum Reply {
    /// Probe result, complete.
    Value(Value),
    /// Model call queued on the worker; `pending` settles later.
    Accepted {
        token: CallToken,
        acknowledgement: String,
        pending: PendingResponse,
    },
}

impl Reply {
    pub fn token(&self) -> Option<CallToken> {
        match self {
            Reply::Value(_) => None,
            Reply::Accepted { token, .. } => Some(*token),
        }
    }
}

pub struct Dispatcher {
    probe: Arc<dyn ResourceProbe>,
    supervisor: SharedWorkerSupervisor,
    registry: SharedCallRegistry,
    namespace: String,
}

impl Dispatcher {
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        supervisor: SharedWorkerSupervisor,
        registry: SharedCallRegistry,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            probe,
            supervisor,
            registry,
            namespace: namespace.into(),
        }
    }

    pub fn supervisor(&self) -> &SharedWorkerSupervisor {
        &self.supervisor
    }

    pub fn registry(&self) -> &SharedCallRegistry {
        &self.registry
    }

    /// Route one call. Safe to invoke concurrently.
    pub async fn handle(
        &self,
        channel: &str,
        operation: &str,
        arguments: Arguments,
    ) -> BridgeResult<Reply> {
        let resolved = Channel::parse(channel, &self.namespace)
            .ok_or_else(|| BridgeError::not_implemented(channel, operation))?;
        let op = Operation::parse(resolved, operation)
            .ok_or_else(|| BridgeError::not_implemented(resolved.as_str(), operation))?;

        debug!("Dispatching {resolved}/{operation}");

        match op {
            Operation::GetDeviceMemory => Ok(Reply::Value(json!(self.probe.device_memory()?.total_mb))),
            Operation::GetUsedMemory => Ok(Reply::Value(json!(self.probe.used_memory()?))),
            Operation::GetFreeStorage => Ok(Reply::Value(json!(self.probe.free_storage()?))),
            Operation::GetTotalStorage => Ok(Reply::Value(json!(self.probe.total_storage()?))),
            Operation::GetSnapshot => Ok(Reply::Value(serde_json::to_value(self.probe.snapshot()?)?)),
            Operation::LoadModel => {
                let path = required_string(&arguments, "path")?;
                let acknowledgement = format!("model load started: {path}");
                let command = WorkerCommand::LoadModel { model_path: path };
                self.submit(resolved, op, arguments, command, acknowledgement)
                    .await
            }
            Operation::SendMessage => {
                let message = required_string(&arguments, "message")?;
                let acknowledgement = format!("message send started: {message}");
                let command = WorkerCommand::SendMessage { message };
                self.submit(resolved, op, arguments, command, acknowledgement)
                    .await
            }
        }
    }

    /// Make sure the worker runs, register the call and queue it.
    async fn submit(
        &self,
        channel: Channel,
        operation: Operation,
        arguments: Arguments,
        command: WorkerCommand,
        acknowledgement: String,
    ) -> BridgeResult<Reply> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.supervisor.ensure_started().await?;

            let pending = self.registry.register(CallRequest {
                channel,
                operation,
                arguments: arguments.clone(),
            });
            let token = pending.token();
            let request = WorkerRequest {
                id: token,
                command: command.clone(),
            };

            match self.supervisor.send(request) {
                Ok(()) => {
                    info!("Accepted {channel}/{} as {token}", operation.as_str());
                    return Ok(Reply::Accepted {
                        token,
                        acknowledgement,
                        pending,
                    });
                }
                Err(BridgeError::WorkerNotReady) if attempt < MAX_SEND_ATTEMPTS => {
                    debug!("Worker went away before {token} was sent, retrying");
                    let _ = self.registry.reject(token, BridgeError::WorkerNotReady);
                }
                Err(e) => {
                    let _ = self.registry.reject(token, BridgeError::WorkerTerminated);
                    return Err(match e {
                        BridgeError::WorkerNotReady => BridgeError::WorkerTerminated,
                        other => other,
                    });
                }
            }
        }
    }
}

/// Non-blank string argument `key`.
fn required_string(arguments: &Arguments, key: &str) -> BridgeResult<String> {
    match arguments.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(BridgeError::InvalidArgument(format!(
            "`{key}` must not be empty"
        ))),
        Some(_) => Err(BridgeError::InvalidArgument(format!(
            "`{key}` must be a string"
        ))),
        None => Err(BridgeError::InvalidArgument(format!("missing `{key}`"))),
    }
}
