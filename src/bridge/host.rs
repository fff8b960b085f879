//! JSON-lines foreground host.
//!
//! Each input line is one call:
//! `{"id": .., "channel": "..", "method": "..", "arguments": {..}}`.
//! Every call gets an immediate reply line carrying the same `id`. Accepted
//! model calls get a second line, tagged with their token, once they settle.
//! Calls are served concurrently, so replies may interleave.

use std::io;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::dispatcher::Reply;
use super::error::{BridgeError, BridgeResult};
use super::models::{Arguments, CallToken};
use super::runtime::{Bridge, SharedBridge};

#[derive(Debug, Clone, Deserialize)]
pub struct HostCall {
    /// Opaque client id, echoed on every reply to this call.
    #[serde(default)]
    pub id: Value,
    pub channel: String,
    pub method: String,
    #[serde(default)]
    pub arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostError {
    pub code: String,
    pub message: String,
}

impl From<&BridgeError> for HostError {
    fn from(e: &BridgeError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostReply {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<CallToken>,
    /// Set on the acknowledgement of a model call; its outcome follows later.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HostError>,
}

impl HostReply {
    pub fn value(id: Value, token: Option<CallToken>, value: Value) -> Self {
        Self {
            id,
            token,
            accepted: false,
            result: Some(value),
            error: None,
        }
    }

    pub fn accepted(id: Value, token: CallToken, acknowledgement: String) -> Self {
        Self {
            id,
            token: Some(token),
            accepted: true,
            result: Some(Value::String(acknowledgement)),
            error: None,
        }
    }

    pub fn error(id: Value, token: Option<CallToken>, error: &BridgeError) -> Self {
        Self {
            id,
            token,
            accepted: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Serve calls from `input` until it closes, then wait for every accepted
/// call to settle. Returns `output` once all replies are written.
pub async fn run_host<R, W>(bridge: SharedBridge, input: R, output: W) -> BridgeResult<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<HostReply>();
    let writer = tokio::spawn(write_replies(reply_rx, output));

    let mut calls = JoinSet::new();
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let call = match parse_call(&line) {
            Ok(call) => call,
            Err((id, e)) => {
                warn!("[HOST] Ignoring malformed call {id}: {e}");
                let _ = reply_tx.send(HostReply::error(id, None, &BridgeError::Json(e)));
                continue;
            }
        };

        let bridge = bridge.clone();
        let reply_tx = reply_tx.clone();
        calls.spawn(async move { serve_call(&bridge, call, &reply_tx).await });
    }

    debug!("[HOST] Input closed, waiting for {} call(s)", calls.len());
    while let Some(joined) = calls.join_next().await {
        if let Err(e) = joined {
            warn!("[HOST] Call task failed: {e}");
        }
    }
    drop(reply_tx);

    writer.await.map_err(|e| BridgeError::Io(io::Error::other(e)))?
}

/// Parse one input line. On failure, returns whatever `id` the line carried
/// so the error reply can still be matched to its call.
fn parse_call(line: &str) -> Result<HostCall, (Value, serde_json::Error)> {
    let raw: Value = serde_json::from_str(line).map_err(|e| (Value::Null, e))?;
    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(raw).map_err(|e| (id, e))
}

async fn serve_call(bridge: &Bridge, call: HostCall, replies: &mpsc::UnboundedSender<HostReply>) {
    let HostCall {
        id,
        channel,
        method,
        arguments,
    } = call;

    let reply = match bridge.handle(&channel, &method, arguments).await {
        Ok(Reply::Value(value)) => HostReply::value(id, None, value),
        Ok(Reply::Accepted {
            token,
            acknowledgement,
            pending,
        }) => {
            let _ = replies.send(HostReply::accepted(id.clone(), token, acknowledgement));
            match pending.wait().await {
                Ok(text) => HostReply::value(id, Some(token), Value::String(text)),
                Err(e) => HostReply::error(id, Some(token), &e),
            }
        }
        Err(e) => {
            debug!("[HOST] {channel}/{method} failed: {e}");
            HostReply::error(id, None, &e)
        }
    };
    let _ = replies.send(reply);
}

async fn write_replies<W>(mut replies: mpsc::UnboundedReceiver<HostReply>, mut output: W) -> BridgeResult<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(reply) = replies.recv().await {
        let mut line = serde_json::to_vec(&reply)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    Ok(output)
}
