//! Seam between the supervisor and a concrete worker instance.
//!
//! A launcher starts one worker and hands back a `WorkerLink`: a queue of
//! requests going in and a stream of events coming out. The worker consumes
//! the request queue in order, one request at a time.

use std::ops::ControlFlow;
use std::thread;

use log::{info, warn};
use tokio::sync::mpsc;

use super::ipc_types::{WorkerRequest, WorkerResponse};
use super::worker_main::Worker;
use crate::bridge::backend::ModelBackend;
use crate::bridge::error::{BridgeError, BridgeResult};

/// Something the worker reports to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The worker finished starting and accepts requests.
    Ready,
    /// Result (or unsolicited message) for a request.
    Response(WorkerResponse),
    /// The worker is gone. A closed event stream means the same.
    Exited(String),
}

/// Channels connected to one running worker instance.
#[derive(Debug)]
pub struct WorkerLink {
    pub requests: mpsc::UnboundedSender<WorkerRequest>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

/// Starts worker instances on behalf of the supervisor.
pub trait WorkerLauncher: Send + Sync {
    /// Start worker number `instance`. Must not block on worker readiness;
    /// readiness is reported later as `WorkerEvent::Ready`.
    fn launch(&self, instance: u64) -> BridgeResult<WorkerLink>;

    /// Force worker `instance` down, if the launcher can. A request for an
    /// instance that has already been replaced is a no-op.
    fn kill(&self, _instance: u64) {}
}

/// Runs the worker loop on a dedicated OS thread inside this process.
pub struct InProcessLauncher<F> {
    factory: F,
}

impl<F> InProcessLauncher<F> {
    /// `factory` builds a fresh backend for every instance.
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F, B> WorkerLauncher for InProcessLauncher<F>
where
    F: Fn() -> B + Send + Sync,
    B: ModelBackend + 'static,
{
    fn launch(&self, instance: u64) -> BridgeResult<WorkerLink> {
        let mut worker = Worker::new((self.factory)());
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<WorkerRequest>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<WorkerEvent>();

        thread::Builder::new()
            .name(format!("model-worker-{instance}"))
            .spawn(move || {
                info!("[WORKER {instance}] In-process worker started");
                let _ = event_tx.send(WorkerEvent::Ready);

                let reason = loop {
                    let Some(request) = request_rx.blocking_recv() else {
                        break "request queue closed".to_string();
                    };
                    match worker.handle(request) {
                        ControlFlow::Continue(response) => {
                            if event_tx.send(WorkerEvent::Response(response)).is_err() {
                                break "event stream dropped".to_string();
                            }
                        }
                        ControlFlow::Break(response) => {
                            let _ = event_tx.send(WorkerEvent::Response(response));
                            break "shutdown requested".to_string();
                        }
                    }
                };

                warn!("[WORKER {instance}] In-process worker exiting: {reason}");
                let _ = event_tx.send(WorkerEvent::Exited(reason));
            })
            .map_err(|e| BridgeError::WorkerSpawn(e.to_string()))?;

        Ok(WorkerLink {
            requests: request_tx,
            events: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::backend::MockBackend;
    use crate::bridge::models::CallToken;
    use crate::bridge::worker::ipc_types::{WorkerCommand, WorkerPayload};

    #[tokio::test]
    async fn test_in_process_worker_reports_ready_then_results() {
        let launcher = InProcessLauncher::new(MockBackend::default);
        let mut link = launcher.launch(1).unwrap();

        assert_eq!(link.events.recv().await, Some(WorkerEvent::Ready));

        link.requests
            .send(WorkerRequest {
                id: CallToken(5),
                command: WorkerCommand::SendMessage {
                    message: "hi".to_string(),
                },
            })
            .unwrap();

        let Some(WorkerEvent::Response(response)) = link.events.recv().await else {
            panic!("expected a response event");
        };
        assert_eq!(response.id, CallToken(5));
        assert!(matches!(response.payload, WorkerPayload::Failure { .. }));
    }

    #[tokio::test]
    async fn test_in_process_worker_exits_when_queue_closes() {
        let launcher = InProcessLauncher::new(MockBackend::default);
        let WorkerLink {
            requests,
            mut events,
        } = launcher.launch(1).unwrap();

        assert_eq!(events.recv().await, Some(WorkerEvent::Ready));
        drop(requests);

        assert!(matches!(events.recv().await, Some(WorkerEvent::Exited(_))));
        assert_eq!(events.recv().await, None);
    }
}
