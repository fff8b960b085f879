//! Single-instance worker lifecycle.
//!
//! The supervisor owns the only handle to the background worker. It starts
//! the worker lazily on first use, hands the same instance to every caller,
//! and replaces it only after the previous one is observed to have
//! terminated. Liveness changes and launches happen under one lock, so at
//! most one instance is ever `starting` or `ready`.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use super::error::{BridgeError, BridgeResult};
use super::models::CallToken;
use super::worker::ipc_types::{WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse};
use super::worker::launcher::{WorkerEvent, WorkerLauncher};

/// How long `shutdown` waits for a graceful exit before killing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Shared reference to the WorkerSupervisor.
pub type SharedWorkerSupervisor = Arc<WorkerSupervisor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Absent,
    Starting,
    Ready,
    Terminated,
}

/// Outcome the worker reported for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Success(String),
    Failure(String),
}

/// The single downstream consumer of worker results.
pub trait WorkerResultSink: Send + Sync {
    /// A result tagged with the token that was attached to its request.
    fn on_result(&self, token: CallToken, outcome: WorkerOutcome);

    /// The worker exited; nothing still pending will ever get a result.
    fn on_terminated(&self);
}

/// Handle to the current worker instance.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    instance: u64,
    liveness: Liveness,
    endpoint: mpsc::UnboundedSender<WorkerRequest>,
}

impl WorkerHandle {
    /// Instance number; increases by one on every (re)start.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Liveness when the handle was taken.
    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn is_connected(&self) -> bool {
        !self.endpoint.is_closed()
    }
}

struct SupervisorState {
    liveness: Liveness,
    instance: u64,
    endpoint: Option<mpsc::UnboundedSender<WorkerRequest>>,
}

impl SupervisorState {
    fn handle(&self) -> BridgeResult<WorkerHandle> {
        let endpoint = self.endpoint.clone().ok_or(BridgeError::WorkerNotReady)?;
        Ok(WorkerHandle {
            instance: self.instance,
            liveness: self.liveness,
            endpoint,
        })
    }
}

/// Guarantees a single live worker and a stable endpoint to it.
pub struct WorkerSupervisor {
    launcher: Arc<dyn WorkerLauncher>,
    state: Mutex<SupervisorState>,
    /// Mirrors (instance, liveness) for callers waiting on a transition.
    liveness_tx: watch::Sender<(u64, Liveness)>,
    sink: RwLock<Option<Arc<dyn WorkerResultSink>>>,
    startup_timeout: Duration,
}

impl WorkerSupervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, startup_timeout: Duration) -> Self {
        let (liveness_tx, _) = watch::channel((0, Liveness::Absent));
        Self {
            launcher,
            state: Mutex::new(SupervisorState {
                liveness: Liveness::Absent,
                instance: 0,
                endpoint: None,
            }),
            liveness_tx,
            sink: RwLock::new(None),
            startup_timeout,
        }
    }

    /// Register the consumer of every result the worker emits.
    pub fn on_worker_result(&self, sink: Arc<dyn WorkerResultSink>) {
        *self.sink.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    pub fn liveness(&self) -> Liveness {
        self.lock_state().liveness
    }

    /// Current instance number (0 before the first start).
    pub fn instance(&self) -> u64 {
        self.lock_state().instance
    }

    pub fn current_handle(&self) -> Option<WorkerHandle> {
        self.lock_state().handle().ok()
    }

    /// Observe (instance, liveness) transitions.
    pub fn subscribe(&self) -> watch::Receiver<(u64, Liveness)> {
        self.liveness_tx.subscribe()
    }

    /// Return the live worker, starting one if none exists or the last one
    /// terminated. Concurrent callers converge on the same instance and all
    /// wait for it to report ready.
    pub async fn ensure_started(self: &Arc<Self>) -> BridgeResult<WorkerHandle> {
        let (instance, mut liveness_rx) = {
            let mut state = self.lock_state();
            match state.liveness {
                Liveness::Ready => return state.handle(),
                Liveness::Starting => {}
                Liveness::Absent | Liveness::Terminated => self.launch(&mut state)?,
            }
            (state.instance, self.liveness_tx.subscribe())
        };

        let settled = tokio::time::timeout(
            self.startup_timeout,
            liveness_rx.wait_for(|&(current, liveness)| {
                current != instance || liveness != Liveness::Starting
            }),
        )
        .await
        .map(|changed| changed.map(|_| ()));

        match settled {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(BridgeError::WorkerTerminated),
            Err(_) => {
                warn!(
                    "Worker instance {instance} not ready after {:?}, giving up on it",
                    self.startup_timeout
                );
                self.on_worker_terminated(instance);
                self.kill(instance).await;
                return Err(BridgeError::Timeout(self.startup_timeout));
            }
        }

        let state = self.lock_state();
        if state.instance == instance && state.liveness == Liveness::Ready {
            state.handle()
        } else {
            Err(BridgeError::WorkerTerminated)
        }
    }

    /// Forward a request to the ready worker.
    pub fn send(&self, request: WorkerRequest) -> BridgeResult<()> {
        let state = self.lock_state();
        if state.liveness != Liveness::Ready {
            return Err(BridgeError::WorkerNotReady);
        }
        let endpoint = state.endpoint.as_ref().ok_or(BridgeError::WorkerNotReady)?;
        endpoint
            .send(request)
            .map_err(|_| BridgeError::WorkerNotReady)
    }

    /// Record that worker `instance` exited. Rejects everything still
    /// pending and marks the worker `terminated`; the next `ensure_started`
    /// starts a fresh instance. Stale or repeated reports are ignored.
    pub fn on_worker_terminated(&self, instance: u64) {
        let mut state = self.lock_state();
        if state.instance != instance
            || matches!(state.liveness, Liveness::Absent | Liveness::Terminated)
        {
            debug!("Ignoring stale termination of worker instance {instance}");
            return;
        }

        warn!("Worker instance {instance} terminated");
        // Still under the state lock: no replacement can register calls yet
        if let Some(sink) = self.sink() {
            sink.on_terminated();
        }
        state.endpoint = None;
        self.set_liveness(&mut state, Liveness::Terminated);
    }

    /// Ask the worker to exit, then make sure it is gone.
    pub async fn shutdown(&self) {
        let (last, running) = {
            let state = self.lock_state();
            let running = match state.liveness {
                Liveness::Starting | Liveness::Ready => {
                    Some((state.instance, state.endpoint.clone()))
                }
                Liveness::Absent | Liveness::Terminated => None,
            };
            (state.instance, running)
        };

        if let Some((instance, endpoint)) = running {
            info!("Shutting down worker instance {instance}");
            if let Some(endpoint) = endpoint {
                let _ = endpoint.send(WorkerRequest {
                    id: CallToken(0),
                    command: WorkerCommand::Shutdown,
                });
            }

            let mut liveness_rx = self.liveness_tx.subscribe();
            let exited = tokio::time::timeout(
                SHUTDOWN_GRACE,
                liveness_rx.wait_for(|&(current, liveness)| {
                    current != instance || liveness == Liveness::Terminated
                }),
            )
            .await
            .map(|changed| changed.is_ok())
            .unwrap_or(false);

            if !exited {
                warn!("Worker instance {instance} did not exit within {SHUTDOWN_GRACE:?}");
            }
            self.on_worker_terminated(instance);
        }

        self.kill(last).await;
    }

    /// Kill one specific instance off the async threads; killing reaps.
    async fn kill(&self, instance: u64) {
        let launcher = Arc::clone(&self.launcher);
        if let Err(e) = tokio::task::spawn_blocking(move || launcher.kill(instance)).await {
            warn!("Killing worker instance {instance} failed: {e}");
        }
    }

    fn launch(self: &Arc<Self>, state: &mut SupervisorState) -> BridgeResult<()> {
        let instance = state.instance + 1;
        info!("Starting worker instance {instance}");

        let link = match self.launcher.launch(instance) {
            Ok(link) => link,
            Err(e) => {
                warn!("Worker instance {instance} failed to start: {e}");
                return Err(e);
            }
        };

        state.instance = instance;
        state.endpoint = Some(link.requests);
        self.set_liveness(state, Liveness::Starting);

        tokio::spawn(Arc::clone(self).pump_events(instance, link.events));
        Ok(())
    }

    /// Drain one instance's events until it exits.
    async fn pump_events(
        self: Arc<Self>,
        instance: u64,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        let reason = loop {
            match events.recv().await {
                Some(WorkerEvent::Ready) => self.mark_ready(instance),
                Some(WorkerEvent::Response(response)) => self.deliver(instance, response),
                Some(WorkerEvent::Exited(reason)) => break reason,
                None => break "worker event stream closed".to_string(),
            }
        };

        info!("Worker instance {instance} exited: {reason}");
        self.on_worker_terminated(instance);
    }

    fn mark_ready(&self, instance: u64) {
        let mut state = self.lock_state();
        if state.instance == instance && state.liveness == Liveness::Starting {
            self.set_liveness(&mut state, Liveness::Ready);
            info!("Worker instance {instance} ready");
        }
    }

    fn deliver(&self, instance: u64, response: WorkerResponse) {
        let WorkerResponse { id, payload } = response;
        let outcome = match payload {
            WorkerPayload::Success { text } => WorkerOutcome::Success(text),
            WorkerPayload::Failure { reason } => WorkerOutcome::Failure(reason),
            WorkerPayload::Pong => {
                debug!("Pong from worker instance {instance}");
                return;
            }
            WorkerPayload::Ready => {
                self.mark_ready(instance);
                return;
            }
        };

        if id == CallToken(0) {
            warn!("Unsolicited message from worker instance {instance}: {outcome:?}");
            return;
        }

        match self.sink() {
            Some(sink) => sink.on_result(id, outcome),
            None => warn!("No result consumer registered, dropping result for {id}"),
        }
    }

    fn set_liveness(&self, state: &mut SupervisorState, liveness: Liveness) {
        debug!(
            "Worker instance {}: {:?} -> {liveness:?}",
            state.instance, state.liveness
        );
        state.liveness = liveness;
        self.liveness_tx.send_replace((state.instance, liveness));
    }

    fn sink(&self) -> Option<Arc<dyn WorkerResultSink>> {
        self.sink.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
