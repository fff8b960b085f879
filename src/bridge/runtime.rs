//! Process-wide bridge.
//!
//! One `Bridge` wires the probe, supervisor, registry and dispatcher
//! together. The host process creates it once with `init`, looks it up with
//! `get`, and tears it down with `shutdown` on exit.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use super::backend::MockBackend;
use super::config::{BridgeConfig, WorkerMode};
use super::dispatcher::{Dispatcher, Reply};
use super::error::{BridgeError, BridgeResult};
use super::models::Arguments;
use super::registry::{CallRegistry, SharedCallRegistry};
use super::supervisor::{SharedWorkerSupervisor, WorkerSupervisor};
use super::system::{ResourceProbe, SystemProbe};
use super::worker::launcher::{InProcessLauncher, WorkerLauncher};
use super::worker::process_manager::ProcessLauncher;

/// Shared reference to the Bridge.
pub type SharedBridge = Arc<Bridge>;

pub struct Bridge {
    config: BridgeConfig,
    dispatcher: Dispatcher,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        launcher: Arc<dyn WorkerLauncher>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        let supervisor = Arc::new(WorkerSupervisor::new(launcher, config.startup_timeout()));
        let registry = Arc::new(CallRegistry::new(config.call_timeout()));
        supervisor.on_worker_result(registry.clone());

        let dispatcher = Dispatcher::new(
            probe,
            supervisor,
            registry,
            config.channel_namespace.clone(),
        );
        Self { config, dispatcher }
    }

    /// Bridge with the launcher chosen by `config.worker.mode` and a
    /// sysinfo-backed probe.
    pub fn from_config(config: BridgeConfig) -> BridgeResult<Self> {
        let launcher: Arc<dyn WorkerLauncher> = match config.worker.mode {
            WorkerMode::Process => Arc::new(ProcessLauncher::from_config(&config.worker)?),
            WorkerMode::InProcess => {
                let latency = config.worker.mock_latency();
                Arc::new(InProcessLauncher::new(move || MockBackend::new(latency)))
            }
        };
        let probe = Arc::new(SystemProbe::new(config.storage_path.clone()));
        Ok(Self::new(config, launcher, probe))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn supervisor(&self) -> &SharedWorkerSupervisor {
        self.dispatcher.supervisor()
    }

    pub fn registry(&self) -> &SharedCallRegistry {
        self.dispatcher.registry()
    }

    pub async fn handle(
        &self,
        channel: &str,
        operation: &str,
        arguments: Arguments,
    ) -> BridgeResult<Reply> {
        self.dispatcher.handle(channel, operation, arguments).await
    }

    /// Stop the worker and reject whatever is still pending.
    pub async fn shutdown(&self) {
        self.supervisor().shutdown().await;

        let abandoned = self.registry().abandon_all(|| BridgeError::WorkerTerminated);
        if abandoned > 0 {
            warn!("Rejected {abandoned} call(s) still pending at shutdown");
        }
    }
}

lazy_static::lazy_static! {
    static ref BRIDGE: Mutex<Option<SharedBridge>> = Mutex::new(None);
}

fn slot() -> MutexGuard<'static, Option<SharedBridge>> {
    BRIDGE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Create the process-wide bridge, or return the one that already exists.
pub fn init(config: BridgeConfig) -> BridgeResult<SharedBridge> {
    let mut slot = slot();
    if let Some(existing) = slot.as_ref() {
        debug!("Bridge already initialised");
        return Ok(existing.clone());
    }

    let bridge = Arc::new(Bridge::from_config(config)?);
    info!(
        "Bridge initialised (namespace {}, worker mode {:?})",
        bridge.config().channel_namespace,
        bridge.config().worker.mode
    );
    *slot = Some(bridge.clone());
    Ok(bridge)
}

pub fn get() -> Option<SharedBridge> {
    slot().clone()
}

/// Tear down the process-wide bridge, if any.
pub async fn shutdown() {
    let bridge = slot().take();
    if let Some(bridge) = bridge {
        info!("Shutting down bridge");
        bridge.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;
    use crate::bridge::models::CallToken;
    use crate::bridge::registry::DeliveryState;
    use crate::bridge::supervisor::Liveness;
    use crate::bridge::testing::ScriptedLauncher;

    fn in_process_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.worker.mode = WorkerMode::InProcess;
        config.storage_path = std::env::temp_dir();
        config
    }

    fn args(key: &str, value: &str) -> Arguments {
        let mut arguments = Arguments::new();
        arguments.insert(key.to_string(), json!(value));
        arguments
    }

    async fn settle(reply: Reply) -> BridgeResult<String> {
        match reply {
            Reply::Accepted { pending, .. } => pending.wait().await,
            Reply::Value(v) => panic!("expected an accepted reply, got {v}"),
        }
    }

    #[tokio::test]
    async fn test_in_process_bridge_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("tiny.gguf");
        fs::write(&model, b"weights").unwrap();
        let model = model.to_str().unwrap();

        let bridge = Bridge::from_config(in_process_config()).unwrap();

        let missing = bridge
            .handle("model", "loadModel", args("path", "/no/such/model.gguf"))
            .await
            .unwrap();
        assert!(matches!(
            settle(missing).await,
            Err(BridgeError::WorkerFailure(reason)) if reason.contains("not found")
        ));

        let loaded = bridge.handle("model", "loadModel", args("path", model)).await.unwrap();
        assert_eq!(settle(loaded).await.unwrap(), "loaded");

        let reply = bridge
            .handle("llama", "sendMessage", args("message", "hello"))
            .await
            .unwrap();
        assert_eq!(settle(reply).await.unwrap(), "[tiny.gguf] hello");

        // One worker served every call
        assert_eq!(bridge.supervisor().instance(), 1);

        bridge.shutdown().await;
        assert_eq!(bridge.supervisor().liveness(), Liveness::Terminated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_message_sent_during_load_settles_after_it() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("slow.gguf");
        fs::write(&model, b"weights").unwrap();

        let mut config = in_process_config();
        config.worker.mock_latency_ms = 200;
        let bridge = Bridge::from_config(config).unwrap();

        let Reply::Accepted { pending: mut load, .. } = bridge
            .handle("model", "loadModel", args("path", model.to_str().unwrap()))
            .await
            .unwrap()
        else {
            panic!("load was not accepted");
        };
        // Sent while the worker is still busy loading
        let message = bridge
            .handle("model", "sendMessage", args("message", "after load"))
            .await
            .unwrap();
        assert!(matches!(load.state(), DeliveryState::Pending));

        // Only succeeds if the worker finished the load first
        assert_eq!(settle(message).await.unwrap(), "[slow.gguf] after load");
        assert!(matches!(load.state(), DeliveryState::Resolved("loaded")));
        assert_eq!(bridge.supervisor().instance(), 1);

        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_pending_calls() {
        let launcher = ScriptedLauncher::new(true);
        let probe = Arc::new(SystemProbe::new(std::env::temp_dir()));
        let bridge = Bridge::new(BridgeConfig::default(), launcher.clone(), probe);

        let reply = bridge
            .handle("model", "sendMessage", args("message", "still thinking"))
            .await
            .unwrap();
        assert_eq!(reply.token(), Some(CallToken(1)));

        // The scripted worker ignores Shutdown, so the grace period runs out
        bridge.shutdown().await;

        assert!(matches!(settle(reply).await, Err(BridgeError::WorkerTerminated)));
        assert_eq!(bridge.registry().pending_count(), 0);
        assert_eq!(launcher.kills(), 1);
    }

    #[tokio::test]
    async fn test_global_init_get_shutdown() {
        let first = init(in_process_config()).unwrap();
        let second = init(BridgeConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().worker.mode, WorkerMode::InProcess);
        assert!(get().is_some_and(|b| Arc::ptr_eq(&b, &first)));

        shutdown().await;
        assert!(get().is_none());

        // Shutting down twice is harmless
        shutdown().await;
    }
}
