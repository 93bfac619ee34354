use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::discovery::DiscoveryOutcome;
use crate::events::ThreadEvent;
use crate::fetch::{
    cancel_pair, CancelHandle, CancelSignal, FetchError, FetchKey, FetchOrchestrator, FetchPhase,
    FetchReport, FetchRequest, RelayTransport,
};
use crate::models::{ThreadTree, ThreadView};
use crate::resolver::ResolverError;
use crate::stats::{FetchStats, SharedFetchStats};
use crate::store::{FileKvStore, KvStore, MemoryKvStore, StorageError, ThreadState};
use crate::tree::{build_thread_view, unexplored_ids, GcReport};

pub use crate::fetch::ViewContext;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("thread engine is disposed")]
    Disposed,
}

/// In-flight work that can be superseded or aborted
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FetchSlot {
    Thread(FetchKey),
    Page(String),
}

struct InFlight {
    generation: u64,
    handle: CancelHandle,
}

/// The thread engine: root discovery, fetching, merging and persistence
/// behind one explicitly constructed service object.
///
/// Construct with [`ThreadEngine::init`], share by reference, and call
/// [`ThreadEngine::dispose`] when the owning view goes away.
pub struct ThreadEngine {
    orchestrator: FetchOrchestrator,
    events: broadcast::Sender<ThreadEvent>,
    stats: SharedFetchStats,
    in_flight: Mutex<HashMap<FetchSlot, InFlight>>,
    next_generation: AtomicU64,
    disposed: AtomicBool,
}

impl ThreadEngine {
    /// Build an engine persisting trees under `config.data_dir`, or in
    /// memory when no directory is configured.
    pub fn init(config: EngineConfig, transport: Arc<dyn RelayTransport>) -> Result<Self, EngineError> {
        let kv: Arc<dyn KvStore> = match &config.data_dir {
            Some(dir) => Arc::new(FileKvStore::new(dir)?),
            None => Arc::new(MemoryKvStore::new()),
        };
        Self::with_kv_store(config, transport, kv)
    }

    pub fn with_kv_store(
        config: EngineConfig,
        transport: Arc<dyn RelayTransport>,
        kv: Arc<dyn KvStore>,
    ) -> Result<Self, EngineError> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let stats = SharedFetchStats::new();
        let orchestrator = FetchOrchestrator::new(config, transport, kv, events.clone(), stats.clone())?;
        info!(relays = orchestrator.config().relays.len(), "thread engine started");
        Ok(Self {
            orchestrator,
            events,
            stats,
            in_flight: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        self.orchestrator.config()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThreadEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> FetchStats {
        self.stats.snapshot()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Current tree snapshot; compare successive snapshots with `Arc::ptr_eq`
    pub fn tree(&self, root_id: &str) -> Option<Arc<ThreadTree>> {
        self.orchestrator.cache().get(root_id)
    }

    /// View for `parent_id` within the tree of `root_id`, computed fresh
    pub fn thread_view(&self, root_id: &str, parent_id: &str, max_depth: usize) -> Option<ThreadView> {
        let tree = self.tree(root_id)?;
        build_thread_view(&tree, parent_id, max_depth)
    }

    pub fn thread_state(&self, root_id: &str) -> Option<ThreadState> {
        self.orchestrator.store().read().state(root_id).cloned()
    }

    pub fn phase(&self, root_id: &str, parent_id: &str) -> FetchPhase {
        self.orchestrator.phase(&FetchKey::new(root_id, parent_id))
    }

    /// Memoized root of `note_id`, if discovery already completed for it
    pub fn known_root(&self, note_id: &str) -> Option<String> {
        self.orchestrator.discovery().cached_root(note_id)
    }

    pub async fn discover_root(&self, note_id: &str) -> Result<DiscoveryOutcome, EngineError> {
        let key = FetchKey::new(note_id, note_id);
        let (generation, signal) = self.register(FetchSlot::Thread(key.clone()))?;
        let outcome = self
            .orchestrator
            .discover_root(note_id, &signal, ViewContext::default())
            .await;
        self.release(&FetchSlot::Thread(key), generation);
        Ok(outcome?)
    }

    /// Open the conversation containing `note_id` with that note as the
    /// current parent.
    pub async fn open_thread(
        &self,
        note_id: &str,
        max_depth: usize,
        ctx: ViewContext,
    ) -> Result<FetchReport, EngineError> {
        let discovery_key = FetchKey::new(note_id, note_id);
        let (generation, signal) = self.register(FetchSlot::Thread(discovery_key.clone()))?;
        let outcome = self.orchestrator.discover_root(note_id, &signal, ctx).await;
        self.release(&FetchSlot::Thread(discovery_key), generation);
        let outcome = outcome?;

        let request = FetchRequest {
            root_id: outcome.root_id().to_string(),
            target_id: note_id.to_string(),
            max_depth,
            force: false,
            ctx,
        };
        let mut report = self.run_fetch(request).await?;
        report.root_complete = outcome.is_complete();
        Ok(report)
    }

    /// Move the current parent. Fetches only when the parent or one of its
    /// direct children has never had its replies fetched.
    pub async fn navigate(
        &self,
        root_id: &str,
        parent_id: &str,
        max_depth: usize,
        ctx: ViewContext,
    ) -> Result<Option<FetchReport>, EngineError> {
        self.ensure_live()?;
        if !ctx.suspend_view_updates {
            self.orchestrator
                .store()
                .write()
                .set_current_parent_id(root_id, parent_id);
            self.orchestrator.emit_status(root_id, ctx);
        }

        let needs_fetch = match self.tree(root_id) {
            Some(tree) => !tree.contains(parent_id) || !unexplored_ids(&tree, parent_id).is_empty(),
            None => true,
        };
        if !needs_fetch {
            debug!(root = %root_id, parent = %parent_id, "navigation served from cache");
            return Ok(None);
        }

        let request = FetchRequest {
            root_id: root_id.to_string(),
            target_id: parent_id.to_string(),
            max_depth,
            force: false,
            ctx,
        };
        self.run_fetch(request).await.map(Some)
    }

    /// Re-query the subtree under `parent_id`, including explored branches
    pub async fn refetch(&self, root_id: &str, parent_id: &str, max_depth: usize) -> Result<FetchReport, EngineError> {
        let request = FetchRequest {
            root_id: root_id.to_string(),
            target_id: parent_id.to_string(),
            max_depth,
            force: true,
            ctx: ViewContext::default(),
        };
        self.run_fetch(request).await
    }

    /// Page older replies to the current parent. Returns how many notes were added.
    pub async fn fetch_next_page(&self, root_id: &str) -> Result<usize, EngineError> {
        let slot = FetchSlot::Page(root_id.to_string());
        let (generation, signal) = self.register(slot.clone())?;
        let result = self.orchestrator.fetch_next_page(root_id, &signal).await;
        self.release(&slot, generation);
        Ok(result?)
    }

    /// Cancel the in-flight fetch for `(root_id, parent_id)`, if any
    pub fn abort(&self, root_id: &str, parent_id: &str) {
        let key = FetchKey::new(root_id, parent_id);
        let removed = self.in_flight.lock().remove(&FetchSlot::Thread(key.clone()));
        if let Some(in_flight) = removed {
            in_flight.handle.cancel();
            self.orchestrator.store().write().set_loading(root_id, false);
            self.orchestrator.set_phase(&key, FetchPhase::Idle, ViewContext::default());
            self.orchestrator.emit_status(root_id, ViewContext::default());
            debug!(root = %root_id, parent = %parent_id, "fetch aborted");
        }
    }

    /// End a suspended stretch: move the current parent and notify
    /// subscribers of the state they missed.
    pub fn resume_view_updates(&self, root_id: &str, parent_id: &str) {
        self.orchestrator
            .store()
            .write()
            .set_current_parent_id(root_id, parent_id);
        let ctx = ViewContext::default();
        if let Some(tree) = self.tree(root_id) {
            self.orchestrator.emit(
                ctx,
                ThreadEvent::TreeUpdated {
                    root_id: root_id.to_string(),
                    nodes: tree.len(),
                },
            );
        }
        self.orchestrator.emit_status(root_id, ctx);
    }

    /// Drop idle trees from memory (with their store state) and expired
    /// trees from persistence.
    pub fn collect_garbage(&self) -> GcReport {
        let (report, evicted) = self.orchestrator.cache().collect_garbage();
        self.forget_roots(&evicted);
        report
    }

    #[cfg(test)]
    fn collect_garbage_at(&self, now: u64) -> GcReport {
        let (report, evicted) = self.orchestrator.cache().collect_garbage_at(now);
        self.forget_roots(&evicted);
        report
    }

    fn forget_roots(&self, roots: &[String]) {
        let mut store = self.orchestrator.store().write();
        for root_id in roots {
            store.remove_thread(root_id);
            self.orchestrator.forget_phases(root_id);
        }
    }

    /// Cancel everything in flight and stop the resolution worker.
    /// Later operations fail with [`EngineError::Disposed`].
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let in_flight: Vec<InFlight> = self.in_flight.lock().drain().map(|(_, f)| f).collect();
        for flight in &in_flight {
            flight.handle.cancel();
        }

        let resolver = self.orchestrator.resolver().clone();
        if tokio::task::spawn_blocking(move || resolver.shutdown()).await.is_err() {
            error!("resolution worker shutdown task failed");
        }
        info!(cancelled = in_flight.len(), "thread engine disposed");
    }

    async fn run_fetch(&self, request: FetchRequest) -> Result<FetchReport, EngineError> {
        let slot = FetchSlot::Thread(FetchKey::new(&request.root_id, &request.target_id));
        let (generation, signal) = self.register(slot.clone())?;
        let result = self.orchestrator.run(&request, &signal).await;
        self.release(&slot, generation);
        Ok(result?)
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.is_disposed() {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Claim `slot`, cancelling whatever was running there
    fn register(&self, slot: FetchSlot) -> Result<(u64, CancelSignal), EngineError> {
        self.ensure_live()?;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (handle, signal) = cancel_pair();
        let previous = self
            .in_flight
            .lock()
            .insert(slot.clone(), InFlight { generation, handle });
        if let Some(previous) = previous {
            debug!(slot = ?slot, "superseding in-flight fetch");
            previous.handle.cancel();
        }
        Ok((generation, signal))
    }

    /// Release `slot` unless a newer fetch already claimed it
    fn release(&self, slot: &FetchSlot, generation: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(slot).is_some_and(|f| f.generation == generation) {
            in_flight.remove(slot);
        }
    }
}
