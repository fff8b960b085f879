//! Worker side of the bridge.
//!
//! Runs as a child process spawned by the bridge (same binary with
//! `--worker`). Reads JSON commands from stdin, runs them one at a time on a
//! `ModelBackend`, and writes JSON responses to stdout. All log output goes
//! to stderr (inherited by parent).
//!
//! Thread design:
//! - Thread 0 (stdin reader): reads lines → channel
//! - Thread 1 (main loop): handles one request at a time, writes to stdout

use std::any::Any;
use std::io::{self, BufRead, Write};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{self, Receiver, Sender};
use log::{error, info, warn};

use super::ipc_types::*;
use crate::bridge::backend::ModelBackend;
use crate::bridge::models::CallToken;

/// Sequential request handler wrapped around a backend.
pub struct Worker<B> {
    backend: B,
    handled: u64,
}

impl<B: ModelBackend> Worker<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            handled: 0,
        }
    }

    /// Number of requests handled so far.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Handle one request. `Break` carries the final response before exit.
    pub fn handle(&mut self, request: WorkerRequest) -> ControlFlow<WorkerResponse, WorkerResponse> {
        let id = request.id;
        self.handled += 1;

        match request.command {
            WorkerCommand::Ping => ControlFlow::Continue(WorkerResponse {
                id,
                payload: WorkerPayload::Pong,
            }),
            WorkerCommand::Shutdown => {
                info!("[WORKER] Shutdown requested");
                ControlFlow::Break(WorkerResponse {
                    id,
                    payload: WorkerPayload::Pong,
                })
            }
            WorkerCommand::LoadModel { model_path } => {
                info!("[WORKER] Loading model: {model_path}");
                ControlFlow::Continue(self.run(id, |backend| backend.load_model(&model_path)))
            }
            WorkerCommand::SendMessage { message } => {
                info!("[WORKER] Message {id}: {} chars", message.len());
                ControlFlow::Continue(self.run(id, |backend| backend.send_message(&message)))
            }
        }
    }

    /// Run a backend operation, turning errors and panics into `Failure`.
    fn run<F>(&mut self, id: CallToken, op: F) -> WorkerResponse
    where
        F: FnOnce(&mut B) -> Result<String, String>,
    {
        let backend = &mut self.backend;
        match panic::catch_unwind(AssertUnwindSafe(|| op(backend))) {
            Ok(Ok(text)) => WorkerResponse::ok(id, text),
            Ok(Err(reason)) => {
                warn!("[WORKER] Request {id} failed: {reason}");
                WorkerResponse::error(id, reason)
            }
            Err(panic_info) => {
                let msg = panic_message(panic_info.as_ref());
                error!("[WORKER] Backend panicked on request {id}: {msg}");
                WorkerResponse::error(id, format!("backend panicked: {msg}"))
            }
        }
    }
}

/// Run the worker process on stdin/stdout until stdin closes or a
/// `Shutdown` command arrives.
pub fn run_worker<B: ModelBackend>(backend: B) {
    info!("[WORKER] Starting model worker process (pid={})", std::process::id());

    let (line_tx, line_rx): (Sender<String>, Receiver<String>) = crossbeam_channel::unbounded();

    // Thread 0: stdin reader
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) if !l.trim().is_empty() => {
                    if line_tx.send(l).is_err() {
                        break; // Main loop exited
                    }
                }
                Ok(_) => {}
                Err(_) => break, // stdin closed (parent died)
            }
        }
        info!("[WORKER] Stdin reader thread exiting");
    });

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    let mut worker = Worker::new(backend);
    serve_lines(&mut worker, &line_rx, &mut stdout);

    info!("[WORKER] Exiting after {} request(s)", worker.handled());
}

/// Main loop: announce readiness, then answer each request line in order.
pub fn serve_lines<B, W>(worker: &mut Worker<B>, lines: &Receiver<String>, out: &mut W)
where
    B: ModelBackend,
    W: Write,
{
    write_response(out, &WorkerResponse::ready());
    info!("[WORKER] Ready, waiting for commands...");

    for line in lines.iter() {
        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!("[WORKER] Failed to parse command: {e}");
                write_response(
                    out,
                    &WorkerResponse::error(CallToken(0), format!("Parse error: {e}")),
                );
                continue;
            }
        };

        match worker.handle(request) {
            ControlFlow::Continue(response) => write_response(out, &response),
            ControlFlow::Break(response) => {
                write_response(out, &response);
                return;
            }
        }
    }

    info!("[WORKER] Command channel disconnected, shutting down");
}

/// Write a JSON response line, flushing immediately.
fn write_response<W: Write>(out: &mut W, response: &WorkerResponse) {
    match serde_json::to_string(response) {
        Ok(json) => {
            if writeln!(out, "{json}").and_then(|()| out.flush()).is_err() {
                error!("[WORKER] Failed to write response {}", response.id);
            }
        }
        Err(e) => error!("[WORKER] Failed to serialize response: {e}"),
    }
}

fn panic_message(panic_info: &(dyn Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
