use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::persist::TreePersistence;
use crate::models::{Note, ThreadTree};
use crate::store::thread_store::now_secs;

struct CachedTree {
    tree: Arc<ThreadTree>,
    last_access: AtomicU64,
}

impl CachedTree {
    fn new(tree: Arc<ThreadTree>, now: u64) -> Self {
        Self {
            tree,
            last_access: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.last_access.store(now, Ordering::Relaxed);
    }
}

/// Outcome of a garbage collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Trees dropped from memory after sitting idle
    pub evicted: usize,
    /// Persisted trees removed for being too old or unreadable
    pub expired: usize,
}

/// In-memory trees keyed by root, backed by [`TreePersistence`].
///
/// Trees are immutable snapshots. Every change installs a new `Arc`, so a
/// reader holding the previous snapshot can compare with `Arc::ptr_eq`.
pub struct TreeCache {
    trees: RwLock<HashMap<String, CachedTree>>,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    persistence: TreePersistence,
    idle: Duration,
}

impl TreeCache {
    pub fn new(persistence: TreePersistence, idle: Duration) -> Self {
        Self {
            trees: RwLock::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
            persistence,
            idle,
        }
    }

    /// Snapshot of the in-memory tree for `root_id`
    pub fn get(&self, root_id: &str) -> Option<Arc<ThreadTree>> {
        let trees = self.trees.read();
        let cached = trees.get(root_id)?;
        cached.touch(now_secs());
        Some(cached.tree.clone())
    }

    /// The tree shell for `root_id`: memory, then persistence, then empty.
    pub fn get_or_load(&self, root_id: &str) -> Arc<ThreadTree> {
        if let Some(tree) = self.get(root_id) {
            return tree;
        }

        let tree = match self.persistence.load(root_id) {
            Some(tree) => {
                debug!(root = %root_id, nodes = tree.len(), "loaded tree shell from persistence");
                tree
            }
            None => ThreadTree::new(root_id),
        };

        let mut trees = self.trees.write();
        // Another caller may have loaded it while the lock was released
        let cached = trees
            .entry(root_id.to_string())
            .or_insert_with(|| CachedTree::new(Arc::new(tree), now_secs()));
        cached.tree.clone()
    }

    /// Install a merged tree. Returns the snapshot now in the cache and
    /// whether it differs from the previous one.
    pub fn install(&self, tree: ThreadTree) -> (Arc<ThreadTree>, bool) {
        let now = now_secs();
        let root_id = tree.root_id.clone();
        {
            let trees = self.trees.read();
            if let Some(cached) = trees.get(&root_id) {
                if *cached.tree == tree {
                    cached.touch(now);
                    return (cached.tree.clone(), false);
                }
            }
        }

        if let Err(e) = self.persistence.save(&tree) {
            warn!(root = %root_id, error = %e, "failed to persist thread tree");
        }

        let snapshot = Arc::new(tree);
        self.trees
            .write()
            .insert(root_id, CachedTree::new(snapshot.clone(), now));
        (snapshot, true)
    }

    /// Lock serializing merges for one root
    pub fn write_lock(&self, root_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .entry(root_id.to_string())
            .or_default()
            .clone()
    }

    /// Look a note up in any in-memory tree
    pub fn find_note(&self, id: &str) -> Option<Note> {
        self.trees
            .read()
            .values()
            .find_map(|cached| cached.tree.note(id).cloned())
    }

    pub fn roots(&self) -> Vec<String> {
        self.trees.read().keys().cloned().collect()
    }

    /// Drop the tree from memory and persistence
    pub fn remove(&self, root_id: &str) {
        self.trees.write().remove(root_id);
        self.write_locks.lock().remove(root_id);
        if let Err(e) = self.persistence.remove(root_id) {
            warn!(root = %root_id, error = %e, "failed to remove persisted tree");
        }
    }

    /// Evict idle trees from memory and expired ones from persistence.
    /// Returns the report plus the roots that left memory.
    pub fn collect_garbage(&self) -> (GcReport, Vec<String>) {
        self.collect_garbage_at(now_secs())
    }

    pub(crate) fn collect_garbage_at(&self, now: u64) -> (GcReport, Vec<String>) {
        let idle_secs = self.idle.as_secs();
        let mut evicted = Vec::new();
        {
            let mut trees = self.trees.write();
            let mut write_locks = self.write_locks.lock();
            trees.retain(|root, cached| {
                let idle_for = now.saturating_sub(cached.last_access.load(Ordering::Relaxed));
                // A root with a merge in flight stays resident
                let busy = write_locks
                    .get(root)
                    .is_some_and(|lock| lock.try_lock().is_err());
                if idle_for > idle_secs && !busy {
                    evicted.push(root.clone());
                    false
                } else {
                    true
                }
            });
            for root in &evicted {
                write_locks.remove(root);
            }
        }

        let expired = match self.persistence.collect_garbage_at(now) {
            Ok(expired) => expired,
            Err(e) => {
                warn!(error = %e, "failed to collect persisted trees");
                0
            }
        };

        let report = GcReport {
            evicted: evicted.len(),
            expired,
        };
        debug!(evicted = report.evicted, expired = report.expired, "tree garbage collection finished");
        (report, evicted)
    }
}
