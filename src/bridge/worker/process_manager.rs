//! Worker process lifecycle management.
//!
//! Spawns the worker as a child process (by default the same binary with
//! `--worker`), wires its pipes into a `WorkerLink`, and kills/reaps it on
//! teardown.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use log::{info, warn};

use super::launcher::{WorkerLauncher, WorkerLink};
use super::worker_bridge;
use crate::bridge::config::WorkerConfig;
use crate::bridge::error::{BridgeError, BridgeResult};

/// Launches the worker as a child process.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    /// Current child, tagged with the instance it was launched as.
    child: Mutex<Option<(u64, Child)>>,
    launch_count: AtomicU32,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: Mutex::new(None),
            launch_count: AtomicU32::new(0),
        }
    }

    /// Launcher for the configured program, or the current executable.
    pub fn from_config(config: &WorkerConfig) -> BridgeResult<Self> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|e| {
                BridgeError::WorkerSpawn(format!("Cannot find own executable: {e}"))
            })?,
        };
        Ok(Self::new(program, config.args.clone()))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Number of times a worker was started after the first one.
    pub fn restart_count(&self) -> u32 {
        self.launch_count.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// OS process ID of the current worker, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.child
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|(_, child)| child.id()))
    }

    /// Whether the current worker process is still running.
    pub fn is_alive(&self) -> bool {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| {
                guard
                    .as_mut()
                    .map(|(_, child)| matches!(child.try_wait(), Ok(None)))
            })
            .unwrap_or(false)
    }

    /// Kill whichever worker is current.
    fn kill_current(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some((instance, mut child)) = guard.take() {
                terminate(instance, &mut child);
            }
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, instance: u64) -> BridgeResult<WorkerLink> {
        // A previous instance may still be exiting
        self.kill_current();

        let mut child = spawn_worker(&self.program, &self.args)?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BridgeError::WorkerSpawn(
                "worker pipes not available".to_string(),
            ));
        };

        let pid = child.id();
        if let Ok(mut guard) = self.child.lock() {
            *guard = Some((instance, child));
        }

        let launches = self.launch_count.fetch_add(1, Ordering::Relaxed) + 1;
        if launches > 1 {
            info!(
                "[PROCESS_MGR] Worker restarted (instance {instance}, pid {pid}, restart #{})",
                launches - 1
            );
        } else {
            info!("[PROCESS_MGR] Worker started (instance {instance}, pid {pid})");
        }

        Ok(worker_bridge::connect(stdin, stdout, instance))
    }

    /// Kill the worker process immediately. OS reclaims all memory.
    fn kill(&self, instance: u64) {
        if let Ok(mut guard) = self.child.lock() {
            match guard.take() {
                Some((current, mut child)) if current == instance => {
                    terminate(current, &mut child);
                }
                other => {
                    if let Some((current, _)) = &other {
                        info!("[PROCESS_MGR] Instance {instance} already replaced by {current}");
                    }
                    *guard = other;
                }
            }
        }
    }
}

impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        self.kill_current();
    }
}

fn terminate(instance: u64, child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => info!("[PROCESS_MGR] Worker {instance} already exited: {status}"),
        _ => {
            info!(
                "[PROCESS_MGR] Killing worker {instance} (pid {})",
                child.id()
            );
            if let Err(e) = child.kill() {
                warn!("[PROCESS_MGR] Kill failed: {e}");
            }
            let _ = child.wait(); // Reap
        }
    }
}

/// Spawn a worker child process with piped stdin/stdout.
fn spawn_worker(program: &Path, args: &[String]) -> BridgeResult<Child> {
    info!(
        "[PROCESS_MGR] Spawning worker: {} {}",
        program.display(),
        args.join(" ")
    );

    Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit()) // Worker logs go to parent's stderr
        .spawn()
        .map_err(|e| BridgeError::WorkerSpawn(format!("{}: {e}", program.display())))
}
