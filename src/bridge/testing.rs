//! Test doubles shared by the bridge's unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use super::error::{BridgeError, BridgeResult};
use super::models::CallToken;
use super::supervisor::{Liveness, WorkerSupervisor};
use super::worker::ipc_types::{WorkerRequest, WorkerResponse};
use super::worker::launcher::{WorkerEvent, WorkerLauncher, WorkerLink};

struct Slot {
    instance: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
    requests: Option<mpsc::UnboundedReceiver<WorkerRequest>>,
}

/// Launcher whose workers are driven by the test itself.
#[derive(Default)]
pub struct ScriptedLauncher {
    auto_ready: AtomicBool,
    fail_next: AtomicBool,
    launches: AtomicUsize,
    killed: Mutex<Vec<u64>>,
    slots: Mutex<Vec<Slot>>,
}

impl ScriptedLauncher {
    /// With `auto_ready`, every worker reports ready as soon as it launches.
    pub fn new(auto_ready: bool) -> Arc<Self> {
        let launcher = Self::default();
        launcher.auto_ready.store(auto_ready, Ordering::SeqCst);
        Arc::new(launcher)
    }

    pub fn set_auto_ready(&self, auto_ready: bool) {
        self.auto_ready.store(auto_ready, Ordering::SeqCst);
    }

    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.killed.lock().unwrap().len()
    }

    /// Instances `kill` was aimed at, in call order.
    pub fn killed(&self) -> Vec<u64> {
        self.killed.lock().unwrap().clone()
    }

    /// Event side of worker `instance`.
    pub fn worker(&self, instance: u64) -> ScriptedWorker {
        let slots = self.slots.lock().unwrap();
        let slot = slots
            .iter()
            .find(|s| s.instance == instance)
            .expect("no such worker instance");
        ScriptedWorker {
            events: slot.events.clone(),
            requests: None,
        }
    }

    /// Both sides of worker `instance`, including its request queue.
    pub fn take_worker(&self, instance: u64) -> ScriptedWorker {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .iter_mut()
            .find(|s| s.instance == instance)
            .expect("no such worker instance");
        ScriptedWorker {
            events: slot.events.clone(),
            requests: slot.requests.take(),
        }
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(&self, instance: u64) -> BridgeResult<WorkerLink> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BridgeError::WorkerSpawn("scripted launch failure".into()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        if self.auto_ready.load(Ordering::SeqCst) {
            let _ = event_tx.send(WorkerEvent::Ready);
        }

        self.slots.lock().unwrap().push(Slot {
            instance,
            events: event_tx,
            requests: Some(request_rx),
        });

        Ok(WorkerLink {
            requests: request_tx,
            events: event_rx,
        })
    }

    /// Records the kill and makes that instance, and only that one, exit.
    fn kill(&self, instance: u64) {
        self.killed.lock().unwrap().push(instance);
        let slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.iter().find(|s| s.instance == instance) {
            let _ = slot.events.send(WorkerEvent::Exited("killed".to_string()));
        }
    }
}

/// Test-side end of a scripted worker.
pub struct ScriptedWorker {
    events: mpsc::UnboundedSender<WorkerEvent>,
    requests: Option<mpsc::UnboundedReceiver<WorkerRequest>>,
}

impl ScriptedWorker {
    pub async fn next_request(&mut self) -> WorkerRequest {
        let requests = self.requests.as_mut().expect("request queue not taken");
        tokio::time::timeout(Duration::from_secs(5), requests.recv())
            .await
            .expect("no request within 5s")
            .expect("request queue closed")
    }

    pub fn ready(&self) {
        let _ = self.events.send(WorkerEvent::Ready);
    }

    pub fn reply(&self, token: CallToken, text: &str) {
        let _ = self
            .events
            .send(WorkerEvent::Response(WorkerResponse::ok(token, text)));
    }

    pub fn fail(&self, token: CallToken, reason: &str) {
        let _ = self
            .events
            .send(WorkerEvent::Response(WorkerResponse::error(token, reason)));
    }

    pub fn exit(&self, reason: &str) {
        let _ = self.events.send(WorkerEvent::Exited(reason.to_string()));
    }
}

/// Wait (bounded) until the supervisor reports `expected`.
pub async fn wait_for_liveness(supervisor: &WorkerSupervisor, expected: Liveness) {
    let mut liveness_rx = supervisor.subscribe();
    let reached = tokio::time::timeout(
        Duration::from_secs(5),
        liveness_rx.wait_for(|&(_, liveness)| liveness == expected),
    )
    .await
    .map(|changed| changed.is_ok())
    .unwrap_or(false);
    assert!(reached, "worker never became {expected:?}");
}
