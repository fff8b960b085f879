//! In-flight call tracking.
//!
//! Each accepted model call gets a correlation token and a `PendingResponse`.
//! Results coming back from the worker are matched by token only, so calls
//! may settle in any order. Every entry settles exactly once: resolve, reject,
//! timeout or bulk abandonment, whichever comes first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use super::error::{BridgeError, BridgeResult};
use super::models::{Call, CallRequest, CallToken};
use super::supervisor::{WorkerOutcome, WorkerResultSink};

/// Final value delivered to a pending response.
pub type CallOutcome = Result<String, BridgeError>;

/// Shared reference to the CallRegistry.
pub type SharedCallRegistry = Arc<CallRegistry>;

struct PendingEntry {
    call: Call,
    tx: oneshot::Sender<CallOutcome>,
    /// Timeout task; cancelled once the entry settles another way.
    timer: AbortHandle,
}

impl PendingEntry {
    fn settle(self, outcome: CallOutcome) {
        self.timer.abort();
        // The foreground may have dropped its handle; the entry is settled regardless
        let _ = self.tx.send(outcome);
    }
}

/// Tracks calls issued to the worker until their result arrives.
pub struct CallRegistry {
    pending: Mutex<HashMap<CallToken, PendingEntry>>,
    /// Next token. Starts at 1; 0 is reserved for unsolicited worker messages.
    next_token: AtomicU64,
    call_timeout: Duration,
}

impl CallRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            call_timeout,
        }
    }

    /// Issue a fresh token for `request` and store it as pending.
    ///
    /// Arms a timer that rejects the entry with `Timeout` if nothing settles
    /// it within the configured bound. Must be called within a tokio runtime.
    pub fn register(self: &Arc<Self>, request: CallRequest) -> PendingResponse {
        let token = CallToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let call = Call::new(token, request);
        let created_at = call.created_at();
        let (tx, rx) = oneshot::channel();

        debug!(
            "Registered call {token}: {}/{}",
            call.channel(),
            call.operation().as_str()
        );

        let registry: Weak<CallRegistry> = Arc::downgrade(self);
        let timeout = self.call_timeout;
        // Held across the spawn so the timer cannot look up the entry first
        let mut pending = self.lock();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(registry) = registry.upgrade() {
                if registry.reject(token, BridgeError::Timeout(timeout)).is_ok() {
                    warn!("Call {token} timed out after {timeout:?}");
                }
            }
        })
        .abort_handle();
        pending.insert(token, PendingEntry { call, tx, timer });
        drop(pending);

        PendingResponse {
            token,
            created_at,
            rx,
            settled: None,
        }
    }

    /// Settle `token` successfully.
    pub fn resolve(&self, token: CallToken, value: String) -> BridgeResult<()> {
        self.settle(token, Ok(value))
    }

    /// Settle `token` with an error.
    pub fn reject(&self, token: CallToken, error: BridgeError) -> BridgeResult<()> {
        self.settle(token, Err(error))
    }

    /// Reject every still-pending entry and clear the registry.
    ///
    /// `make_error` builds the rejection for each entry. Returns how many
    /// entries were rejected.
    pub fn abandon_all(&self, make_error: impl Fn() -> BridgeError) -> usize {
        let drained: Vec<(CallToken, PendingEntry)> = self.lock().drain().collect();
        let count = drained.len();
        for (token, entry) in drained {
            debug!("Abandoning call {token} ({})", entry.call.operation().as_str());
            entry.settle(Err(make_error()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pending(&self, token: CallToken) -> bool {
        self.lock().contains_key(&token)
    }

    fn settle(&self, token: CallToken, outcome: CallOutcome) -> BridgeResult<()> {
        let entry = self
            .lock()
            .remove(&token)
            .ok_or(BridgeError::UnknownOrCompletedCall(token))?;

        debug!(
            "Settled call {token} after {:?}",
            entry.call.created_at().elapsed()
        );
        entry.settle(outcome);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallToken, PendingEntry>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl WorkerResultSink for CallRegistry {
    fn on_result(&self, token: CallToken, outcome: WorkerOutcome) {
        let result = match outcome {
            WorkerOutcome::Success(text) => self.resolve(token, text),
            WorkerOutcome::Failure(reason) => {
                self.reject(token, BridgeError::WorkerFailure(reason))
            }
        };
        if let Err(e) = result {
            warn!("Dropping worker result: {e}");
        }
    }

    fn on_terminated(&self) {
        let abandoned = self.abandon_all(|| BridgeError::WorkerTerminated);
        if abandoned > 0 {
            warn!("Worker terminated with {abandoned} call(s) pending; all rejected");
        }
    }
}

/// Borrowed view of a pending response's delivery state.
#[derive(Debug)]
pub enum DeliveryState<'a> {
    Pending,
    Resolved(&'a str),
    Rejected(&'a BridgeError),
}

/// Handle for work that was accepted but has not completed yet.
#[derive(Debug)]
pub struct PendingResponse {
    token: CallToken,
    created_at: Instant,
    rx: oneshot::Receiver<CallOutcome>,
    settled: Option<CallOutcome>,
}

impl PendingResponse {
    pub fn token(&self) -> CallToken {
        self.token
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current delivery state, without waiting.
    pub fn state(&mut self) -> DeliveryState<'_> {
        if self.settled.is_none() {
            match self.rx.try_recv() {
                Ok(outcome) => self.settled = Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.settled = Some(Err(BridgeError::WorkerTerminated));
                }
            }
        }

        match &self.settled {
            None => DeliveryState::Pending,
            Some(Ok(value)) => DeliveryState::Resolved(value),
            Some(Err(e)) => DeliveryState::Rejected(e),
        }
    }

    /// Wait for the call to settle.
    pub async fn wait(self) -> CallOutcome {
        match self.settled {
            Some(outcome) => outcome,
            // A dropped sender means the registry itself went away
            None => self.rx.await.unwrap_or(Err(BridgeError::WorkerTerminated)),
        }
    }
}
