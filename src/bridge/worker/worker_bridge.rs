//! Pipe plumbing between the bridge and a worker child process.
//!
//! Turns the child's stdin/stdout into a `WorkerLink`: requests are
//! serialized one per line into stdin, stdout lines are parsed into events.

use std::io::{BufRead, BufReader, Write};
use std::process::{ChildStdin, ChildStdout};
use std::thread;

use log::{debug, error, warn};
use tokio::sync::mpsc;

use super::ipc_types::*;
use super::launcher::{WorkerEvent, WorkerLink};

/// Start the IO threads for one worker instance and return its link.
pub fn connect(stdin: ChildStdin, stdout: ChildStdout, instance: u64) -> WorkerLink {
    let (request_tx, request_rx) = mpsc::unbounded_channel::<WorkerRequest>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<WorkerEvent>();

    thread::spawn(move || stdin_writer(request_rx, stdin, instance));
    thread::spawn(move || stdout_reader(stdout, event_tx, instance));

    WorkerLink {
        requests: request_tx,
        events: event_rx,
    }
}

/// Writes queued requests to the worker's stdin until the queue closes.
fn stdin_writer(
    mut request_rx: mpsc::UnboundedReceiver<WorkerRequest>,
    mut stdin: ChildStdin,
    instance: u64,
) {
    while let Some(request) = request_rx.blocking_recv() {
        let json = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(e) => {
                error!("[BRIDGE {instance}] Failed to serialize request {}: {e}", request.id);
                continue;
            }
        };
        if writeln!(stdin, "{json}").is_err() {
            warn!("[BRIDGE {instance}] Failed to write to worker stdin");
            break;
        }
        if stdin.flush().is_err() {
            warn!("[BRIDGE {instance}] Failed to flush worker stdin");
            break;
        }
        debug!("[BRIDGE {instance}] Sent {} {}", request.command.name(), request.id);
    }
    debug!("[BRIDGE {instance}] Stdin writer exiting");
}

/// Reads worker stdout lines and forwards them as events. Reports `Exited`
/// once the pipe closes, which happens when the process dies.
fn stdout_reader(stdout: ChildStdout, event_tx: mpsc::UnboundedSender<WorkerEvent>, instance: u64) {
    let reader = BufReader::new(stdout);
    let mut reason = "worker stdout closed".to_string();

    for line in reader.lines() {
        let line = match line {
            Ok(l) if l.trim().is_empty() => continue,
            Ok(l) => l,
            Err(e) => {
                reason = format!("worker stdout read error: {e}");
                break;
            }
        };

        match parse_event(&line) {
            Some(event) => {
                if event_tx.send(event).is_err() {
                    return; // Supervisor stopped listening
                }
            }
            None => warn!("[BRIDGE {instance}] Ignoring unparseable worker line: {line}"),
        }
    }

    debug!("[BRIDGE {instance}] Stdout reader exiting: {reason}");
    let _ = event_tx.send(WorkerEvent::Exited(reason));
}

/// Parse one stdout line. The unsolicited `Ready` payload becomes its own event.
fn parse_event(line: &str) -> Option<WorkerEvent> {
    let response: WorkerResponse = serde_json::from_str(line).ok()?;
    Some(match response.payload {
        WorkerPayload::Ready => WorkerEvent::Ready,
        _ => WorkerEvent::Response(response),
    })
}
