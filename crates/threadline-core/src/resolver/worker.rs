use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::resolve::{resolve_batch, ResolvedPatch};
use crate::config::ThreadPolicy;
use crate::models::Note;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolverError {
    #[error("worker timeout: request {seq} did not complete within {after:?}")]
    Timeout { seq: u64, after: Duration },
    #[error("resolution worker failed: {0}")]
    WorkerFailed(String),
    #[error("resolution worker is shut down")]
    ShutDown,
    #[error("failed to spawn resolution worker: {0}")]
    Spawn(String),
}

type ResponseSender = oneshot::Sender<Result<ResolvedPatch, ResolverError>>;
type PendingTable = Arc<Mutex<HashMap<u64, ResponseSender>>>;

pub(crate) enum ResolverCommand {
    Resolve {
        seq: u64,
        known: Vec<Note>,
        incoming: Vec<Note>,
    },
    /// Blocks the worker thread, simulating a slow batch
    #[cfg(test)]
    Stall(Duration),
    /// Panics inside the worker, simulating a fatal error
    #[cfg(test)]
    Crash,
    Shutdown,
}

/// Runs batch resolution on a dedicated thread.
///
/// Requests carry a monotonically increasing sequence number; the pending
/// table maps each number to the caller's response channel so completions
/// can arrive in any order. A fatal error on the worker rejects every
/// pending request and all later ones fail fast.
pub struct ResolverWorker {
    command_tx: Mutex<Option<Sender<ResolverCommand>>>,
    pending: PendingTable,
    next_seq: AtomicU64,
    alive: Arc<AtomicBool>,
    timeout: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ResolverWorker {
    pub fn spawn(policy: ThreadPolicy, timeout: Duration) -> Result<Self, ResolverError> {
        let (command_tx, command_rx) = mpsc::channel::<ResolverCommand>();
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let thread = {
            let pending = pending.clone();
            let alive = alive.clone();
            std::thread::Builder::new()
                .name("threadline-resolver".to_string())
                .spawn(move || run_worker(command_rx, pending, alive, policy))
                .map_err(|e| ResolverError::Spawn(e.to_string()))?
        };

        Ok(Self {
            command_tx: Mutex::new(Some(command_tx)),
            pending,
            next_seq: AtomicU64::new(0),
            alive,
            timeout,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Resolve `incoming` against `known`, waiting at most the configured timeout.
    pub async fn resolve(
        &self,
        known: Vec<Note>,
        incoming: Vec<Note>,
    ) -> Result<ResolvedPatch, ResolverError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let command = ResolverCommand::Resolve {
            seq,
            known,
            incoming,
        };
        let rx = self.submit(command, seq)?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ResolverError::WorkerFailed(
                "response channel closed".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(&seq);
                warn!(seq, timeout = ?self.timeout, "resolution request timed out");
                Err(ResolverError::Timeout {
                    seq,
                    after: self.timeout,
                })
            }
        }
    }

    fn submit(
        &self,
        command: ResolverCommand,
        seq: u64,
    ) -> Result<oneshot::Receiver<Result<ResolvedPatch, ResolverError>>, ResolverError> {
        if !self.is_alive() {
            return Err(self.dead_error());
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);

        let sent = match self.command_tx.lock().as_ref() {
            Some(command_tx) => command_tx.send(command).is_ok(),
            None => false,
        };

        // The worker may have died between the liveness check and the send
        if !sent || !self.is_alive() {
            self.pending.lock().remove(&seq);
            return Err(self.dead_error());
        }

        Ok(rx)
    }

    fn dead_error(&self) -> ResolverError {
        if self.command_tx.lock().is_none() {
            ResolverError::ShutDown
        } else {
            ResolverError::WorkerFailed("worker thread is not running".to_string())
        }
    }

    #[cfg(test)]
    pub(crate) fn send_raw(&self, command: ResolverCommand) {
        if let Some(tx) = self.command_tx.lock().as_ref() {
            let _ = tx.send(command);
        }
    }

    /// Stop the worker thread. Pending requests are rejected with `ShutDown`.
    pub fn shutdown(&self) {
        if let Some(tx) = self.command_tx.lock().take() {
            let _ = tx.send(ResolverCommand::Shutdown);
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("resolution worker thread panicked during shutdown");
            }
        }
        reject_all(&self.pending, || ResolverError::ShutDown);
    }
}

impl Drop for ResolverWorker {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.lock().take() {
            let _ = tx.send(ResolverCommand::Shutdown);
        }
    }
}

fn run_worker(
    command_rx: Receiver<ResolverCommand>,
    pending: PendingTable,
    alive: Arc<AtomicBool>,
    policy: ThreadPolicy,
) {
    debug!("resolution worker started");

    while let Ok(command) = command_rx.recv() {
        match command {
            ResolverCommand::Resolve {
                seq,
                known,
                incoming,
            } => {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    resolve_batch(&known, &incoming, &policy)
                }));
                match outcome {
                    Ok(patch) => complete(&pending, seq, patch),
                    Err(panic) => {
                        fail_worker(&pending, &alive, panic_message(&*panic));
                        return;
                    }
                }
            }
            #[cfg(test)]
            ResolverCommand::Stall(duration) => std::thread::sleep(duration),
            #[cfg(test)]
            ResolverCommand::Crash => {
                if let Err(panic) = std::panic::catch_unwind(simulated_crash) {
                    fail_worker(&pending, &alive, panic_message(&*panic));
                    return;
                }
            }
            ResolverCommand::Shutdown => break,
        }
    }

    alive.store(false, Ordering::SeqCst);
    reject_all(&pending, || ResolverError::ShutDown);
    debug!("resolution worker stopped");
}

fn complete(pending: &PendingTable, seq: u64, patch: ResolvedPatch) {
    match pending.lock().remove(&seq) {
        Some(tx) => {
            let _ = tx.send(Ok(patch));
        }
        // The caller already gave up on this request
        None => debug!(seq, "dropping late resolution result"),
    }
}

fn fail_worker(pending: &PendingTable, alive: &AtomicBool, reason: String) {
    error!(%reason, "resolution worker hit a fatal error");
    alive.store(false, Ordering::SeqCst);
    reject_all(pending, || ResolverError::WorkerFailed(reason.clone()));
}

fn reject_all(pending: &PendingTable, error: impl Fn() -> ResolverError) {
    let drained: Vec<ResponseSender> = pending.lock().drain().map(|(_, tx)| tx).collect();
    for tx in drained {
        let _ = tx.send(Err(error()));
    }
}

#[cfg(test)]
fn simulated_crash() {
    panic!("simulated resolver crash")
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
