//! The fetch state machine.
//!
//! Each `(root, parent)` pair moves through
//! `Idle → DiscoveringRoot → LoadingTreeShell → FetchingMissingData → Settled`
//! (or `Failed`). `Settled` is re-entered whenever navigation reveals
//! unexplored children.
//!
//! All writes to a root's tree and store state go through
//! [`FetchOrchestrator::integrate`], which holds the root's write lock for
//! merge, persistence and patch application.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::cancel::CancelSignal;
use super::relay::RelayTransport;
use super::replies::ReplyFetcher;
use super::FetchError;
use crate::config::EngineConfig;
use crate::discovery::{DiscoveryOutcome, NoteLookup, RootDiscovery};
use crate::events::ThreadEvent;
use crate::models::{Note, ThreadTree};
use crate::resolver::{ResolvedPatch, ResolverError, ResolverWorker};
use crate::stats::SharedFetchStats;
use crate::store::{KvStore, PaginationFrontier, ThreadStore};
use crate::tree::{child_level, merge_notes_into_tree, TreeCache, TreePersistence};

/// Status message recorded when the target note cannot be loaded at all
pub const LOAD_FAILED_MESSAGE: &str = "failed to load thread";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FetchPhase {
    #[default]
    Idle,
    DiscoveringRoot,
    LoadingTreeShell,
    FetchingMissingData,
    Settled,
    Failed,
}

impl FetchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchPhase::Idle => "idle",
            FetchPhase::DiscoveringRoot => "discovering-root",
            FetchPhase::LoadingTreeShell => "loading-tree-shell",
            FetchPhase::FetchingMissingData => "fetching-missing-data",
            FetchPhase::Settled => "settled",
            FetchPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchKey {
    pub root_id: String,
    pub parent_id: String,
}

impl FetchKey {
    pub fn new(root_id: &str, parent_id: &str) -> Self {
        Self {
            root_id: root_id.to_string(),
            parent_id: parent_id.to_string(),
        }
    }
}

/// Suspends view-facing side effects while a view restores its position.
///
/// Data is still merged and persisted, but the current parent is not moved
/// and no [`ThreadEvent`] is broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewContext {
    pub suspend_view_updates: bool,
}

impl ViewContext {
    pub fn suspended() -> Self {
        Self {
            suspend_view_updates: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub root_id: String,
    pub target_id: String,
    pub max_depth: usize,
    /// Re-query the whole subtree, ignoring what was already fetched
    pub force: bool,
    pub ctx: ViewContext,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub root_id: String,
    pub parent_id: String,
    /// False when root discovery stopped early and fell back to an ancestor
    pub root_complete: bool,
    /// BFS levels queried
    pub levels: usize,
    pub replies_fetched: usize,
    /// Nodes in the tree after the fetch
    pub nodes: usize,
    pub has_more: bool,
    /// Reply expansion stopped on this error; the tree is partial
    pub partial_error: Option<String>,
}

pub struct FetchOrchestrator {
    config: EngineConfig,
    cache: TreeCache,
    store: RwLock<ThreadStore>,
    resolver: Arc<ResolverWorker>,
    fetcher: ReplyFetcher,
    discovery: RootDiscovery,
    phases: RwLock<HashMap<FetchKey, FetchPhase>>,
    events: broadcast::Sender<ThreadEvent>,
    stats: SharedFetchStats,
}

impl FetchOrchestrator {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn RelayTransport>,
        kv: Arc<dyn KvStore>,
        events: broadcast::Sender<ThreadEvent>,
        stats: SharedFetchStats,
    ) -> Result<Self, ResolverError> {
        let resolver = Arc::new(ResolverWorker::spawn(config.policy, config.worker_timeout())?);
        let persistence = TreePersistence::new(kv, config.tree_max_age());
        Ok(Self {
            cache: TreeCache::new(persistence, config.tree_idle()),
            store: RwLock::new(ThreadStore::new()),
            resolver,
            fetcher: ReplyFetcher::new(transport, stats.clone(), &config),
            discovery: RootDiscovery::new(
                config.policy,
                config.max_root_walk_depth,
                config.root_cache_capacity,
            ),
            phases: RwLock::new(HashMap::new()),
            events,
            stats,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &TreeCache {
        &self.cache
    }

    pub fn store(&self) -> &RwLock<ThreadStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<ResolverWorker> {
        &self.resolver
    }

    pub fn discovery(&self) -> &RootDiscovery {
        &self.discovery
    }

    pub fn phase(&self, key: &FetchKey) -> FetchPhase {
        self.phases.read().get(key).copied().unwrap_or_default()
    }

    pub fn set_phase(&self, key: &FetchKey, phase: FetchPhase, ctx: ViewContext) {
        self.phases.write().insert(key.clone(), phase);
        debug!(root = %key.root_id, parent = %key.parent_id, phase = phase.as_str(), "fetch phase");
        self.emit(
            ctx,
            ThreadEvent::PhaseChanged {
                root_id: key.root_id.clone(),
                parent_id: key.parent_id.clone(),
                phase,
            },
        );
    }

    pub fn forget_phases(&self, root_id: &str) {
        self.phases.write().retain(|key, _| key.root_id != root_id);
    }

    pub fn emit(&self, ctx: ViewContext, event: ThreadEvent) {
        if ctx.suspend_view_updates {
            return;
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn emit_status(&self, root_id: &str, ctx: ViewContext) {
        let status = self.store.read().status(root_id);
        if let Some(status) = status {
            self.emit(
                ctx,
                ThreadEvent::StatusChanged {
                    root_id: root_id.to_string(),
                    status,
                },
            );
        }
    }

    /// A note from any in-memory tree or store, without touching relays
    pub fn local_note(&self, id: &str) -> Option<Note> {
        self.cache
            .find_note(id)
            .or_else(|| self.store.read().find_note(id).cloned())
    }

    /// Resolve the conversation root for `note_id`
    pub async fn discover_root(
        &self,
        note_id: &str,
        cancel: &CancelSignal,
        ctx: ViewContext,
    ) -> Result<DiscoveryOutcome, FetchError> {
        if let Some(root_id) = self.discovery.cached_root(note_id) {
            return Ok(DiscoveryOutcome::Complete(root_id));
        }

        let key = FetchKey::new(note_id, note_id);
        self.set_phase(&key, FetchPhase::DiscoveringRoot, ctx);
        let lookup = LocalFirstLookup {
            orchestrator: self,
            cancel,
        };
        let outcome = self.discovery.discover(note_id, &lookup).await;
        // The discovery key is transient; the load phase is keyed by the real root
        self.phases.write().remove(&key);
        cancel.check()?;

        debug!(note = %note_id, root = %outcome.root_id(), complete = outcome.is_complete(), "root discovered");
        Ok(outcome)
    }

    /// Load the tree for `request.target_id` and expand it breadth-first.
    pub async fn run(&self, request: &FetchRequest, cancel: &CancelSignal) -> Result<FetchReport, FetchError> {
        let key = FetchKey::new(&request.root_id, &request.target_id);
        let result = self.load(&key, request, cancel).await;
        match &result {
            Ok(report) => {
                self.stats.record_completed();
                info!(
                    root = %key.root_id,
                    parent = %key.parent_id,
                    levels = report.levels,
                    replies = report.replies_fetched,
                    nodes = report.nodes,
                    "thread settled"
                );
            }
            Err(FetchError::Cancelled) => {
                self.stats.record_cancelled();
                debug!(root = %key.root_id, parent = %key.parent_id, "fetch cancelled");
            }
            Err(e) => {
                self.stats.record_failed();
                self.fail(&key, e, request.ctx);
            }
        }
        result
    }

    async fn load(&self, key: &FetchKey, request: &FetchRequest, cancel: &CancelSignal) -> Result<FetchReport, FetchError> {
        let root_id = key.root_id.as_str();
        let target_id = key.parent_id.as_str();
        let ctx = request.ctx;
        cancel.check()?;

        self.set_phase(key, FetchPhase::LoadingTreeShell, ctx);
        let tree = self.cache.get_or_load(root_id);
        self.prepare_store(root_id, target_id, &tree, ctx);

        let mut report = FetchReport {
            root_id: root_id.to_string(),
            parent_id: target_id.to_string(),
            root_complete: true,
            ..Default::default()
        };

        let mut missing: Vec<String> = Vec::new();
        for id in [target_id, root_id] {
            if !tree.contains(id) && !missing.iter().any(|m| m == id) {
                missing.push(id.to_string());
            }
        }
        if !missing.is_empty() {
            self.set_phase(key, FetchPhase::FetchingMissingData, ctx);
            let found = self.fetch_missing(&missing, cancel).await?;
            if !found.iter().any(|n| n.id == target_id) {
                return Err(FetchError::ThreadUnavailable(target_id.to_string()));
            }
            self.integrate(root_id, &found, &[], ctx, cancel).await?;
        }

        // Walk down level by level; explored nodes are passed through so
        // their unexplored descendants within `max_depth` are still queried
        let mut tree = self.cache.get_or_load(root_id);
        let mut level = vec![target_id.to_string()];
        let mut depth = 0;
        while !level.is_empty() && depth < request.max_depth {
            let query: Vec<String> = level
                .iter()
                .filter(|id| request.force || !tree.children_fetch_attempted(id))
                .cloned()
                .collect();

            if !query.is_empty() {
                self.set_phase(key, FetchPhase::FetchingMissingData, ctx);
                let batch = match self.fetcher.fetch_replies(&query, cancel).await {
                    Ok(batch) => batch,
                    Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                    Err(e) => {
                        warn!(root = %root_id, parents = query.len(), error = %e, "reply fetch failed, keeping partial tree");
                        report.partial_error = Some(e.to_string());
                        break;
                    }
                };
                if !batch.deferred.is_empty() {
                    report.partial_error = Some(format!(
                        "replies to {} notes could not be fetched",
                        batch.deferred.len()
                    ));
                }
                report.replies_fetched += batch.notes.len();

                let attempted: Vec<String> = query
                    .into_iter()
                    .filter(|id| !batch.deferred.contains(id))
                    .collect();
                tree = self.integrate(root_id, &batch.notes, &attempted, ctx, cancel).await?;
                {
                    let mut store = self.store.write();
                    for (parent_id, frontier) in batch.frontiers {
                        store.record_frontier(root_id, &parent_id, frontier);
                    }
                }
                report.levels += 1;
            }

            depth += 1;
            level = child_level(&tree, &level);
        }

        {
            let mut store = self.store.write();
            store.set_loading(root_id, false);
            store.set_error(root_id, None);
            report.has_more = store
                .frontier(root_id, target_id)
                .is_some_and(|f| f.has_more);
        }
        self.emit_status(root_id, ctx);
        self.set_phase(key, FetchPhase::Settled, ctx);

        report.nodes = self.cache.get(root_id).map(|t| t.len()).unwrap_or(0);
        Ok(report)
    }

    fn prepare_store(&self, root_id: &str, target_id: &str, tree: &ThreadTree, ctx: ViewContext) {
        {
            let mut store = self.store.write();
            // A shell restored from persistence seeds a fresh store entry
            if store.init_thread(root_id, target_id) && !tree.is_empty() {
                let notes: Vec<Note> = tree.nodes.values().map(|n| n.note.clone()).collect();
                store.ingest_notes(root_id, &notes);
                let patch = ResolvedPatch {
                    children: tree.parent_to_children.clone(),
                    notes: Vec::new(),
                };
                store.apply_worker_patch(root_id, &patch);
            }
            if !ctx.suspend_view_updates {
                store.set_current_parent_id(root_id, target_id);
            }
            store.set_loading(root_id, true);
        }
        self.emit_status(root_id, ctx);
    }

    /// Local caches first, then relays. Relay failures leave the note missing.
    async fn fetch_missing(&self, ids: &[String], cancel: &CancelSignal) -> Result<Vec<Note>, FetchError> {
        let mut found = Vec::new();
        let mut remote = Vec::new();
        for id in ids {
            match self.local_note(id) {
                Some(note) => found.push(note),
                None => remote.push(id.clone()),
            }
        }
        if remote.is_empty() {
            return Ok(found);
        }

        match self.fetcher.fetch_notes_by_id(&remote, cancel).await {
            Ok(notes) => found.extend(notes),
            Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
            Err(e) => warn!(ids = ?remote, error = %e, "failed to fetch notes by id"),
        }
        Ok(found)
    }

    /// Merge, persist, ingest and resolve one batch under the root's write lock.
    ///
    /// A resolver failure is returned after the notes are merged and
    /// ingested, so a retry recomputes from cache.
    pub async fn integrate(
        &self,
        root_id: &str,
        notes: &[Note],
        affected_parent_ids: &[String],
        ctx: ViewContext,
        cancel: &CancelSignal,
    ) -> Result<Arc<ThreadTree>, FetchError> {
        let lock = self.cache.write_lock(root_id);
        let _guard = lock.lock().await;
        // Results of a superseded fetch are dropped before they touch state
        cancel.check()?;

        let current = self.cache.get_or_load(root_id);
        let merged = merge_notes_into_tree(&current, notes, affected_parent_ids, &self.config.policy);
        let (snapshot, changed) = self.cache.install(merged);

        let resolved = if notes.is_empty() {
            Ok(())
        } else {
            let known = {
                let mut store = self.store.write();
                let known = store.known_notes(root_id);
                store.ingest_notes(root_id, notes);
                known
            };
            match self.resolver.resolve(known, notes.to_vec()).await {
                Ok(patch) => {
                    self.store.write().apply_worker_patch(root_id, &patch);
                    Ok(())
                }
                Err(e) => {
                    warn!(root = %root_id, error = %e, "resolution failed, notes kept for retry");
                    Err(FetchError::from(e))
                }
            }
        };

        if changed {
            self.emit(
                ctx,
                ThreadEvent::TreeUpdated {
                    root_id: root_id.to_string(),
                    nodes: snapshot.len(),
                },
            );
        }
        resolved.map(|_| snapshot)
    }

    /// Page older replies to the root's current parent, continuing from
    /// that parent's own frontier. Returns how many nodes the tree gained.
    pub async fn fetch_next_page(&self, root_id: &str, cancel: &CancelSignal) -> Result<usize, FetchError> {
        let (parent_id, frontier) = {
            let store = self.store.read();
            let state = store
                .state(root_id)
                .ok_or_else(|| FetchError::ThreadUnavailable(root_id.to_string()))?;
            let parent_id = state.current_parent_id.clone();
            let frontier = state.frontiers.get(&parent_id).cloned().unwrap_or_default();
            (parent_id, frontier)
        };
        let ctx = ViewContext::default();

        self.store.write().set_loading(root_id, true);
        self.emit_status(root_id, ctx);

        let result: Result<(usize, PaginationFrontier), FetchError> = async {
            let page = self.fetcher.fetch_reply_page(&parent_id, &frontier, cancel).await?;
            let before = self.cache.get_or_load(root_id).len();
            let tree = self.integrate(root_id, &page.notes, &[], ctx, cancel).await?;
            Ok((tree.len().saturating_sub(before), page.frontier))
        }
        .await;

        if matches!(result, Err(FetchError::Cancelled)) {
            return Err(FetchError::Cancelled);
        }
        let result = {
            let mut store = self.store.write();
            store.set_loading(root_id, false);
            result.map(|(added, frontier)| {
                let has_more = frontier.has_more;
                store.record_frontier(root_id, &parent_id, frontier);
                (added, has_more)
            })
        };
        self.emit_status(root_id, ctx);

        match result {
            Ok((added, has_more)) => {
                debug!(root = %root_id, parent = %parent_id, added, has_more, "fetched next page");
                Ok(added)
            }
            Err(e) => {
                warn!(root = %root_id, error = %e, "next page fetch failed");
                Err(e)
            }
        }
    }

    fn fail(&self, key: &FetchKey, error: &FetchError, ctx: ViewContext) {
        {
            let mut store = self.store.write();
            store.set_loading(&key.root_id, false);
            if matches!(error, FetchError::ThreadUnavailable(_)) {
                store.set_error(&key.root_id, Some(LOAD_FAILED_MESSAGE.to_string()));
            }
        }
        warn!(root = %key.root_id, parent = %key.parent_id, error = %error, "thread fetch failed");
        self.emit_status(&key.root_id, ctx);
        self.set_phase(key, FetchPhase::Failed, ctx);
    }
}

/// [`NoteLookup`] over the engine caches, falling back to relays
struct LocalFirstLookup<'a> {
    orchestrator: &'a FetchOrchestrator,
    cancel: &'a CancelSignal,
}

#[async_trait]
impl NoteLookup for LocalFirstLookup<'_> {
    async fn lookup(&self, id: &str) -> Result<Option<Note>, FetchError> {
        if let Some(note) = self.orchestrator.local_note(id) {
            return Ok(Some(note));
        }
        let notes = self
            .orchestrator
            .fetcher
            .fetch_notes_by_id(&[id.to_string()], self.cancel)
            .await?;
        Ok(notes.into_iter().find(|n| n.id == id))
    }
}
